//! The reactor: owns every socket, stages registration changes, waits for
//! readiness in `FD_SETSIZE`-bounded windows and dispatches lifecycle events.
//!
//! One call to [`Reactor::tick`] runs, in order:
//! 1. due timers,
//! 2. the registry commit (adds, destroys, closes),
//! 3. the readiness wait over the active set, window by window,
//! 4. dispatch over the active set in insertion order.
//!
//! Anything a callback registers, closes or destroys during step 4 is
//! staged and takes effect at the next tick's commit.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use pollnet_buf::ByteBuffer;
use pollnet_config::{
    log_reactor_debug, log_reactor_trace, log_reactor_warn, log_socket_debug, log_socket_warn,
    Config, ReactorConfig,
};
use socket2::{Domain, SockAddr};

use crate::addr;
use crate::error::{is_transient, ReactorError, Result};
use crate::event::{Event, EventKind, Interest};
use crate::registry::Registry;
use crate::select::{self, FdSet, FD_SETSIZE};
use crate::socket::{domain_for, Flow, SockOption, Socket, SocketId, SocketKind, SocketState};
use crate::timer::{self, TimerId, TimerScheduler, TimerTick};

/// Outcome of [`Reactor::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    /// Connected synchronously; `Connect { ok: true }` already fired.
    Connected,
    /// Handshake running; the result arrives as a `Connect` event.
    InProgress,
    /// Failed synchronously; `Connect { ok: false }` and `Close` already fired.
    Failed,
}

pub struct Reactor {
    sockets: HashMap<SocketId, Socket>,
    registry: Registry,
    timers: TimerScheduler<Reactor>,
    config: ReactorConfig,
    block_size: usize,
    next_id: u64,
    scratch: Vec<u8>,
    in_tick: bool,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("sockets", &self.sockets.len())
            .field("registry", &self.registry)
            .field("idle", &self.registry.is_idle())
            .field("timers", &self.timers)
            .field("config", &self.config)
            .finish()
    }
}

impl Reactor {
    /// Reactor with default tuning; does not read any config file.
    pub fn new() -> Self {
        Self::with_config(&Config::default())
    }

    pub fn with_config(config: &Config) -> Self {
        let mut tuning = config.reactor.clone();
        tuning.max_set_size = tuning.max_set_size.clamp(1, FD_SETSIZE);
        tuning.recv_chunk = tuning.recv_chunk.max(1);
        if tuning.listen_backlog <= 0 {
            tuning.listen_backlog = ReactorConfig::default().listen_backlog;
        }
        log_reactor_debug!(
            max_set_size = tuning.max_set_size,
            recv_chunk = tuning.recv_chunk,
            "Reactor created"
        );
        Self {
            sockets: HashMap::new(),
            registry: Registry::new(),
            timers: TimerScheduler::new(),
            scratch: vec![0; tuning.recv_chunk],
            block_size: config.buffer.block_size.max(1),
            config: tuning,
            next_id: 1,
            in_tick: false,
        }
    }

    /// Effective tuning after clamping.
    pub fn config(&self) -> &ReactorConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------

    /// New detached stream socket.
    pub fn tcp(&mut self) -> SocketId {
        self.insert(SocketKind::Stream)
    }

    /// New detached datagram socket.
    pub fn udp(&mut self) -> SocketId {
        self.insert(SocketKind::Datagram)
    }

    fn insert(&mut self, kind: SocketKind) -> SocketId {
        let id = SocketId::from_raw(self.next_id);
        self.next_id += 1;
        self.sockets.insert(id, Socket::new(id, kind, self.block_size));
        id
    }

    /// Wrap an open stream descriptor as an accepted connection and register
    /// it for all readiness classes.
    pub fn adopt(&mut self, sock: socket2::Socket) -> Result<SocketId> {
        sock.set_nonblocking(true)?;
        #[cfg(target_vendor = "apple")]
        sock.set_nosigpipe(true)?;
        let domain = sock
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .map(|a| domain_for(&a))
            .unwrap_or(Domain::IPV4);

        let id = self.insert(SocketKind::Stream);
        if let Some(socket) = self.sockets.get_mut(&id) {
            socket.install(sock, domain, SocketState::Accepted);
        }
        self.register(id, Interest::ALL)?;
        log_socket_debug!(id = id.as_u64(), "Adopted connection");
        Ok(id)
    }

    pub fn socket(&self, id: SocketId) -> Option<&Socket> {
        self.sockets.get(&id)
    }

    pub fn contains(&self, id: SocketId) -> bool {
        self.sockets.contains_key(&id)
    }

    /// Sockets not yet released by a destroy commit.
    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Sockets polled by the next readiness wait.
    pub fn active_len(&self) -> usize {
        self.registry.active_len()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn get(&self, id: SocketId) -> Result<&Socket> {
        self.sockets.get(&id).ok_or(ReactorError::UnknownSocket(id))
    }

    fn get_mut(&mut self, id: SocketId) -> Result<&mut Socket> {
        self.sockets
            .get_mut(&id)
            .ok_or(ReactorError::UnknownSocket(id))
    }

    fn expect_kind(&self, id: SocketId, expected: SocketKind) -> Result<&Socket> {
        let socket = self.get(id)?;
        if socket.kind() != expected {
            return Err(ReactorError::WrongKind { id, expected });
        }
        Ok(socket)
    }

    pub fn state(&self, id: SocketId) -> Result<SocketState> {
        Ok(self.get(id)?.state())
    }

    /// Unknown sockets count as closed.
    pub fn is_closed(&self, id: SocketId) -> bool {
        self.sockets.get(&id).map_or(true, Socket::is_closed)
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    /// Stage `id` for polling with `interest` from the next tick on.
    pub fn register(&mut self, id: SocketId, interest: Interest) -> Result<()> {
        let socket = self.get_mut(id)?;
        if socket.is_closed() {
            return Err(ReactorError::NotOpen(id));
        }
        socket.care = interest;
        self.registry.register(id);
        log_reactor_trace!(id = id.as_u64(), ?interest, "Registered");
        Ok(())
    }

    pub fn reregister(&mut self, id: SocketId, interest: Interest) -> Result<()> {
        self.register(id, interest)
    }

    /// Stop polling `id` from the next tick on. The descriptor stays open.
    pub fn deregister(&mut self, id: SocketId) -> Result<()> {
        self.get(id)?;
        self.registry.deregister(id);
        log_reactor_trace!(id = id.as_u64(), "Deregistered");
        Ok(())
    }

    /// Close `id` now and release it at the next tick's commit.
    pub fn destroy(&mut self, id: SocketId) -> Result<()> {
        self.close(id)?;
        self.registry.destroy(id);
        log_reactor_trace!(id = id.as_u64(), "Destroy staged");
        Ok(())
    }

    fn commit(&mut self) {
        for id in self.registry.commit() {
            if self.sockets.remove(&id).is_some() {
                log_reactor_debug!(id = id.as_u64(), "Socket released");
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Allocate a fresh IPv4 descriptor, closing any previous one.
    pub fn create(&mut self, id: SocketId) -> Result<()> {
        self.create_for(id, Domain::IPV4)
    }

    fn create_for(&mut self, id: SocketId, domain: Domain) -> Result<()> {
        self.close(id)?;
        self.get_mut(id)?.open(domain)?;
        log_socket_debug!(id = id.as_u64(), "Descriptor created");
        Ok(())
    }

    /// Open a descriptor of the address's family unless a matching one is
    /// already open.
    fn ensure_open(&mut self, id: SocketId, addr: &SocketAddr) -> Result<()> {
        let domain = domain_for(addr);
        let socket = self.get(id)?;
        if socket.is_closed() || socket.domain() != Some(domain) {
            self.create_for(id, domain)?;
        }
        Ok(())
    }

    /// Start a non-blocking connect.
    ///
    /// Immediate success and immediate failure fire their events before
    /// returning; otherwise the outcome arrives as a `Connect` event.
    pub fn connect(&mut self, id: SocketId, addr: SocketAddr) -> Result<ConnectStatus> {
        self.expect_kind(id, SocketKind::Stream)?;
        self.ensure_open(id, &addr)?;

        let socket = self.get_mut(id)?;
        if let Some(buf) = socket.inbuf_mut() {
            buf.reset();
        }
        if let Some(buf) = socket.outbuf_mut() {
            buf.reset();
        }
        socket.set_option(SockOption::NonBlocking(true))?;
        socket.set_state(SocketState::Connecting);

        let outcome = socket.raw()?.connect(&SockAddr::from(addr));
        match outcome {
            Ok(()) => {
                self.get_mut(id)?.set_state(SocketState::Connected);
                self.register(id, Interest::ALL)?;
                log_socket_debug!(id = id.as_u64(), %addr, "Connected");
                self.fire(id, Event::Connect { ok: true });
                Ok(ConnectStatus::Connected)
            }
            Err(err) if is_transient(&err) => {
                self.register(id, Interest::ALL)?;
                log_socket_debug!(id = id.as_u64(), %addr, "Connect in progress");
                Ok(ConnectStatus::InProgress)
            }
            Err(err) => {
                log_socket_debug!(id = id.as_u64(), %addr, error = %err, "Connect failed");
                self.fail_connect(id, Some(err));
                Ok(ConnectStatus::Failed)
            }
        }
    }

    /// Resolve `host` and connect.
    pub fn connect_host(&mut self, id: SocketId, host: &str, port: u16) -> Result<ConnectStatus> {
        let addr = addr::resolve(host, port)?;
        self.connect(id, addr)
    }

    /// Bind with address reuse enabled. Datagram sockets become `Bound` and
    /// are registered for read readiness.
    pub fn bind(&mut self, id: SocketId, addr: SocketAddr) -> Result<()> {
        self.ensure_open(id, &addr)?;
        let socket = self.get_mut(id)?;
        socket.set_option(SockOption::ReuseAddr(true))?;
        socket.raw()?.bind(&SockAddr::from(addr))?;
        log_socket_debug!(id = id.as_u64(), %addr, "Bound");

        if socket.kind() == SocketKind::Datagram {
            socket.set_state(SocketState::Bound);
            self.register(id, Interest::RECV | Interest::ERROR)?;
        }
        Ok(())
    }

    pub fn bind_host(&mut self, id: SocketId, host: &str, port: u16) -> Result<()> {
        let addr = addr::bind_addr(host, port)?;
        self.bind(id, addr)
    }

    /// Listen on an already bound stream socket; registers read readiness,
    /// which signals a pending connection.
    pub fn listen(&mut self, id: SocketId, backlog: i32) -> Result<()> {
        let socket = self.expect_kind(id, SocketKind::Stream)?;
        socket.raw()?.listen(backlog)?;
        self.get_mut(id)?.set_state(SocketState::Listening);
        self.register(id, Interest::RECV | Interest::ERROR)?;
        log_socket_debug!(id = id.as_u64(), backlog, "Listening");
        Ok(())
    }

    /// Create, bind and listen in one step. `None` uses the configured backlog.
    pub fn listen_on(&mut self, id: SocketId, addr: SocketAddr, backlog: Option<i32>) -> Result<()> {
        self.expect_kind(id, SocketKind::Stream)?;
        self.create_for(id, domain_for(&addr))?;
        self.bind(id, addr)?;
        self.listen(id, backlog.unwrap_or(self.config.listen_backlog))
    }

    /// Accept one pending connection; `None` when nothing is waiting.
    pub fn accept(&mut self, id: SocketId) -> Result<Option<SocketId>> {
        let socket = self.expect_kind(id, SocketKind::Stream)?;
        if socket.state() != SocketState::Listening {
            return Err(ReactorError::InvalidState {
                id,
                state: socket.state(),
            });
        }
        let accepted = socket.raw()?.accept();
        match accepted {
            Ok((sock, peer)) => {
                let child = self.adopt(sock)?;
                log_socket_debug!(
                    listener = id.as_u64(),
                    id = child.as_u64(),
                    peer = ?peer.as_socket(),
                    "Accepted"
                );
                Ok(Some(child))
            }
            Err(err) if is_transient(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Queue bytes for sending; they are flushed when the socket is writable.
    pub fn send(&mut self, id: SocketId, bytes: &[u8]) -> Result<usize> {
        self.expect_kind(id, SocketKind::Stream)?;
        let socket = self.get_mut(id)?;
        if socket.is_closed() {
            return Err(ReactorError::NotOpen(id));
        }
        match socket.outbuf_mut() {
            Some(out) => Ok(out.write(bytes)?),
            None => Ok(0),
        }
    }

    /// Read buffered inbound bytes. Works after close until drained.
    pub fn recv(&mut self, id: SocketId, out: &mut [u8]) -> Result<usize> {
        self.expect_kind(id, SocketKind::Stream)?;
        let Some(inbuf) = self.get_mut(id)?.inbuf_mut() else {
            return Ok(0);
        };
        let n = inbuf.peek(out);
        inbuf.discard(n);
        Ok(n)
    }

    pub fn inbuf(&self, id: SocketId) -> Result<&ByteBuffer> {
        self.expect_kind(id, SocketKind::Stream)?
            .inbuf()
            .ok_or(ReactorError::WrongKind {
                id,
                expected: SocketKind::Stream,
            })
    }

    pub fn inbuf_mut(&mut self, id: SocketId) -> Result<&mut ByteBuffer> {
        self.expect_kind(id, SocketKind::Stream)?;
        self.get_mut(id)?
            .inbuf_mut()
            .ok_or(ReactorError::WrongKind {
                id,
                expected: SocketKind::Stream,
            })
    }

    pub fn outbuf_mut(&mut self, id: SocketId) -> Result<&mut ByteBuffer> {
        self.expect_kind(id, SocketKind::Stream)?;
        self.get_mut(id)?
            .outbuf_mut()
            .ok_or(ReactorError::WrongKind {
                id,
                expected: SocketKind::Stream,
            })
    }

    /// Send one datagram. Opens an IPv4/IPv6 descriptor on first use and
    /// registers it for replies. Returns 0 if the OS would block.
    pub fn send_to(&mut self, id: SocketId, addr: SocketAddr, bytes: &[u8]) -> Result<usize> {
        let socket = self.expect_kind(id, SocketKind::Datagram)?;
        if socket.is_closed() {
            self.create_for(id, domain_for(&addr))?;
            self.get_mut(id)?.set_state(SocketState::Bound);
            self.register(id, Interest::RECV | Interest::ERROR)?;
        }
        self.get(id)?.send_to(bytes, addr)
    }

    pub fn send_to_host(&mut self, id: SocketId, host: &str, port: u16, bytes: &[u8]) -> Result<usize> {
        let addr = addr::resolve(host, port)?;
        self.send_to(id, addr, bytes)
    }

    /// Receive one datagram; `None` when none is queued.
    pub fn recv_from(&mut self, id: SocketId, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        self.expect_kind(id, SocketKind::Datagram)?.recv_from(buf)
    }

    /// Close now and fire `Close`. Returns `false` if already closed.
    pub fn close(&mut self, id: SocketId) -> Result<bool> {
        if !self.shutdown(id)? {
            return Ok(false);
        }
        self.fire(id, Event::Close);
        Ok(true)
    }

    /// Close without notification.
    fn shutdown(&mut self, id: SocketId) -> Result<bool> {
        if !self.get_mut(id)?.close_descriptor() {
            return Ok(false);
        }
        self.registry.deregister(id);
        log_socket_debug!(id = id.as_u64(), "Closed");
        Ok(true)
    }

    pub fn set_option(&mut self, id: SocketId, option: SockOption) -> Result<()> {
        self.get(id)?.set_option(option)
    }

    pub fn local_addr(&self, id: SocketId) -> Result<SocketAddr> {
        self.get(id)?.local_addr()
    }

    pub fn peer_addr(&self, id: SocketId) -> Result<SocketAddr> {
        self.get(id)?.peer_addr()
    }

    // ------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------

    /// Install the callback for `kind`, replacing any previous one.
    pub fn on<F>(&mut self, id: SocketId, kind: EventKind, callback: F) -> Result<()>
    where
        F: FnMut(&mut Reactor, SocketId, &Event) + 'static,
    {
        self.get_mut(id)?.set_callback(kind, Box::new(callback));
        Ok(())
    }

    pub fn off(&mut self, id: SocketId, kind: EventKind) -> Result<()> {
        self.get_mut(id)?.clear_callback(kind);
        Ok(())
    }

    fn fire(&mut self, id: SocketId, event: Event) {
        let kind = event.kind();
        let Some(mut callback) = self.sockets.get_mut(&id).and_then(|s| s.take_callback(kind))
        else {
            return;
        };
        callback(self, id, &event);
        if let Some(socket) = self.sockets.get_mut(&id) {
            socket.restore_callback(kind, callback);
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Run `callback` every `interval`, at most `max_repeats` times
    /// (negative: forever). The callback returns `false` to stop.
    pub fn set_timer<F>(&mut self, interval: Duration, max_repeats: i64, callback: F) -> TimerId
    where
        F: FnMut(&mut Reactor, &TimerTick) -> bool + 'static,
    {
        self.timers.add(interval, max_repeats, callback)
    }

    pub fn cancel_timer(&mut self, id: TimerId) {
        self.timers.remove(id);
    }

    pub fn has_timer(&self, id: TimerId) -> bool {
        self.timers.contains(id)
    }

    fn run_timers(&mut self) {
        let mut due = self.timers.detach();
        due.fire(timer::now_millis(), self);
        self.timers.attach(due);
    }

    // ------------------------------------------------------------------
    // Engine
    // ------------------------------------------------------------------

    /// Run one reactor iteration, blocking at most `timeout`.
    pub fn tick(&mut self, timeout: Duration) {
        if self.in_tick {
            log_reactor_warn!("Nested tick ignored");
            return;
        }
        self.in_tick = true;

        self.run_timers();
        self.commit();

        if self.registry.active_len() == 0 {
            if !timeout.is_zero() {
                std::thread::sleep(timeout.min(Duration::from_micros(self.config.idle_sleep_us)));
            }
        } else {
            self.wait(timeout);
            self.dispatch();
        }

        self.in_tick = false;
    }

    /// Readiness wait over the active set in windows of `max_set_size`.
    /// Only the first window blocks.
    fn wait(&mut self, timeout: Duration) {
        let ids = self.registry.active_ids();
        let mut start = 0;
        let mut window_timeout = timeout;
        let mut windows = 0usize;
        while start < ids.len() {
            start = self.wait_window(&ids, start, window_timeout);
            window_timeout = Duration::ZERO;
            windows += 1;
        }
        log_reactor_trace!(active = ids.len(), windows, "Wait finished");
    }

    /// Build and wait on one window beginning at `start`; returns the index
    /// after the last socket considered.
    fn wait_window(&mut self, ids: &[SocketId], start: usize, timeout: Duration) -> usize {
        let Reactor {
            sockets,
            registry,
            config,
            ..
        } = self;

        let mut read = FdSet::new();
        let mut write = FdSet::new();
        let mut error = FdSet::new();
        let mut members = Vec::with_capacity(config.max_set_size.min(ids.len() - start));
        let mut max_fd = -1;

        let mut next = start;
        while next < ids.len() && members.len() < config.max_set_size {
            let id = ids[next];
            next += 1;
            let Some(socket) = sockets.get_mut(&id) else {
                continue;
            };
            socket.fired = Interest::empty();
            let Some(fd) = socket.fd() else {
                registry.deregister(id);
                continue;
            };
            if fd as usize >= FD_SETSIZE {
                log_socket_warn!(id = id.as_u64(), fd, "Descriptor beyond FD_SETSIZE");
                socket.set_fault(io::Error::from_raw_os_error(libc::EMFILE));
                socket.fired = Interest::ERROR;
                continue;
            }

            if socket.care.contains(Interest::RECV) && socket.wants_recv() {
                read.insert(fd);
            }
            if socket.care.contains(Interest::SEND) && socket.wants_send() {
                write.insert(fd);
            }
            error.insert(fd);
            max_fd = max_fd.max(fd);
            members.push((id, fd));
        }

        if members.is_empty() {
            return next;
        }

        match select::select(max_fd + 1, &mut read, &mut write, &mut error, timeout) {
            Ok(0) => {}
            Ok(_) => {
                for (id, fd) in members {
                    let mut fired = Interest::empty();
                    if read.contains(fd) {
                        fired |= Interest::RECV;
                    }
                    if write.contains(fd) {
                        fired |= Interest::SEND;
                    }
                    if error.contains(fd) {
                        fired |= Interest::ERROR;
                    }
                    if let Some(socket) = sockets.get_mut(&id) {
                        socket.fired = fired;
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                log_reactor_warn!(error = %err, window = members.len(), "select failed");
            }
        }
        next
    }

    fn dispatch(&mut self) {
        for id in self.registry.active_ids() {
            self.dispatch_one(id);
        }
    }

    fn dispatch_one(&mut self, id: SocketId) {
        if self.registry.is_pending_destroy(id) {
            return;
        }
        self.fire(id, Event::Poll);

        let Some(socket) = self.sockets.get(&id) else {
            return;
        };
        if socket.is_closed() {
            return;
        }
        let fired = socket.fired;
        let state = socket.state();
        let kind = socket.kind();

        if state == SocketState::Connecting {
            if fired.contains(Interest::ERROR) {
                let err = self.sockets.get_mut(&id).and_then(Socket::take_error);
                self.fail_connect(id, err);
            } else if fired.contains(Interest::SEND) {
                match self.sockets.get_mut(&id).and_then(Socket::take_error) {
                    None => {
                        if let Some(socket) = self.sockets.get_mut(&id) {
                            socket.set_state(SocketState::Connected);
                        }
                        log_socket_debug!(id = id.as_u64(), "Connected");
                        self.fire(id, Event::Connect { ok: true });
                    }
                    Some(err) => self.fail_connect(id, Some(err)),
                }
            }
            return;
        }

        if fired.contains(Interest::ERROR) {
            let err = self.sockets.get_mut(&id).and_then(Socket::take_error);
            self.close_with(id, err);
            return;
        }

        if state == SocketState::Listening {
            if fired.contains(Interest::RECV) {
                self.fire(id, Event::Accept);
            }
            return;
        }

        if fired.contains(Interest::RECV) {
            self.on_readable(id, kind);
        }
        if fired.contains(Interest::SEND) && !self.is_closed(id) {
            self.on_writable(id, kind);
        }
    }

    fn on_readable(&mut self, id: SocketId, kind: SocketKind) {
        if kind == SocketKind::Datagram {
            self.fire(id, Event::Recv { bytes: 0 });
            return;
        }
        let Reactor {
            sockets, scratch, ..
        } = self;
        let Some(flow) = sockets.get_mut(&id).map(|s| s.fill(scratch)) else {
            return;
        };
        match flow {
            Flow::Moved(0) => {}
            Flow::Moved(bytes) => self.fire(id, Event::Recv { bytes }),
            Flow::PeerClosed => {
                log_socket_debug!(id = id.as_u64(), "Peer closed");
                self.close_with(id, None);
            }
            Flow::Failed(err) => self.close_with(id, Some(err)),
        }
    }

    fn on_writable(&mut self, id: SocketId, kind: SocketKind) {
        if kind == SocketKind::Datagram {
            self.fire(id, Event::Send { bytes: 0 });
            return;
        }
        let Some(flow) = self.sockets.get_mut(&id).map(Socket::flush) else {
            return;
        };
        match flow {
            Flow::Moved(0) => {}
            Flow::Moved(bytes) => self.fire(id, Event::Send { bytes }),
            Flow::PeerClosed => self.close_with(id, None),
            Flow::Failed(err) => self.close_with(id, Some(err)),
        }
    }

    /// Report a fatal error if there is one, then close and fire `Close`.
    fn close_with(&mut self, id: SocketId, err: Option<io::Error>) {
        if let Some(err) = &err {
            log_socket_warn!(id = id.as_u64(), error = %err, "Fatal socket error");
            self.fire(id, Event::from_io(err));
        }
        if let Ok(true) = self.shutdown(id) {
            self.fire(id, Event::Close);
        }
    }

    fn fail_connect(&mut self, id: SocketId, err: Option<io::Error>) {
        if let Some(socket) = self.sockets.get_mut(&id) {
            socket.set_state(SocketState::ConnectFailed);
        }
        if let Some(err) = &err {
            log_socket_debug!(id = id.as_u64(), error = %err, "Connect failed");
            self.fire(id, Event::from_io(err));
        }
        self.fire(id, Event::Connect { ok: false });
        if let Ok(true) = self.shutdown(id) {
            self.fire(id, Event::Close);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::net::TcpListener;
    use std::rc::Rc;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_config_is_clamped() {
        let mut config = Config::default();
        config.reactor.max_set_size = 0;
        config.reactor.recv_chunk = 0;
        config.reactor.listen_backlog = -3;
        let reactor = Reactor::with_config(&config);
        assert_eq!(reactor.config().max_set_size, 1);
        assert_eq!(reactor.config().recv_chunk, 1);
        assert_eq!(reactor.config().listen_backlog, 5);

        config.reactor.max_set_size = usize::MAX;
        let reactor = Reactor::with_config(&config);
        assert_eq!(reactor.config().max_set_size, FD_SETSIZE);
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut reactor = Reactor::new();
        let a = reactor.tcp();
        reactor.destroy(a).unwrap();
        reactor.tick(Duration::ZERO);
        assert!(!reactor.contains(a));
        let b = reactor.udp();
        assert!(b > a);
    }

    #[test]
    fn test_unknown_socket_errors() {
        let mut reactor = Reactor::new();
        let ghost = SocketId::from_raw(999);
        assert!(matches!(
            reactor.register(ghost, Interest::ALL),
            Err(ReactorError::UnknownSocket(_))
        ));
        assert!(matches!(reactor.close(ghost), Err(ReactorError::UnknownSocket(_))));
        assert!(reactor.is_closed(ghost));
    }

    #[test]
    fn test_register_requires_descriptor() {
        let mut reactor = Reactor::new();
        let id = reactor.tcp();
        assert!(matches!(
            reactor.register(id, Interest::ALL),
            Err(ReactorError::NotOpen(_))
        ));
    }

    #[test]
    fn test_wrong_kind_is_rejected() {
        let mut reactor = Reactor::new();
        let udp = reactor.udp();
        let tcp = reactor.tcp();
        assert!(matches!(
            reactor.send(udp, b"x"),
            Err(ReactorError::WrongKind { .. })
        ));
        assert!(matches!(
            reactor.connect(udp, loopback()),
            Err(ReactorError::WrongKind { .. })
        ));
        let mut buf = [0u8; 8];
        assert!(matches!(
            reactor.recv_from(tcp, &mut buf),
            Err(ReactorError::WrongKind { .. })
        ));
    }

    #[test]
    fn test_accept_requires_listening() {
        let mut reactor = Reactor::new();
        let id = reactor.tcp();
        reactor.create(id).unwrap();
        assert!(matches!(
            reactor.accept(id),
            Err(ReactorError::InvalidState {
                state: SocketState::Uninitialized,
                ..
            })
        ));
    }

    #[test]
    fn test_close_is_idempotent_and_fires_once() {
        let mut reactor = Reactor::new();
        let id = reactor.tcp();
        reactor.create(id).unwrap();

        let closes = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&closes);
        reactor
            .on(id, EventKind::Close, move |_, _, _| *counter.borrow_mut() += 1)
            .unwrap();

        assert!(reactor.close(id).unwrap());
        assert!(!reactor.close(id).unwrap());
        assert_eq!(*closes.borrow(), 1);
        assert_eq!(reactor.state(id).unwrap(), SocketState::Closed);
        assert!(reactor.socket(id).unwrap().fd().is_none());
    }

    #[test]
    fn test_register_then_deregister_is_never_polled() {
        let mut reactor = Reactor::new();
        let id = reactor.tcp();
        reactor.listen_on(id, loopback(), None).unwrap();

        let polls = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&polls);
        reactor
            .on(id, EventKind::Poll, move |_, _, _| *counter.borrow_mut() += 1)
            .unwrap();

        reactor.deregister(id).unwrap();
        reactor.tick(Duration::ZERO);
        assert_eq!(*polls.borrow(), 0);
        assert!(!reactor.registry().is_active(id));
        assert!(!reactor.is_closed(id));
    }

    #[test]
    fn test_poll_fires_every_tick() {
        let mut reactor = Reactor::new();
        let id = reactor.tcp();
        reactor.listen_on(id, loopback(), None).unwrap();

        let polls = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&polls);
        reactor
            .on(id, EventKind::Poll, move |_, _, event| {
                assert_eq!(*event, Event::Poll);
                *counter.borrow_mut() += 1;
            })
            .unwrap();

        for _ in 0..3 {
            reactor.tick(Duration::ZERO);
        }
        assert_eq!(*polls.borrow(), 3);
    }

    #[test]
    fn test_off_inside_callback_sticks() {
        let mut reactor = Reactor::new();
        let id = reactor.tcp();
        reactor.listen_on(id, loopback(), None).unwrap();

        let polls = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&polls);
        reactor
            .on(id, EventKind::Poll, move |r, me, _| {
                *counter.borrow_mut() += 1;
                r.off(me, EventKind::Poll).unwrap();
            })
            .unwrap();

        reactor.tick(Duration::ZERO);
        reactor.tick(Duration::ZERO);
        assert_eq!(*polls.borrow(), 1);
        assert!(!reactor.socket(id).unwrap().has_callback(EventKind::Poll));
    }

    #[test]
    fn test_listen_on_uses_reuse_addr() {
        let mut reactor = Reactor::new();
        let id = reactor.tcp();
        reactor.listen_on(id, loopback(), Some(16)).unwrap();
        assert_eq!(reactor.state(id).unwrap(), SocketState::Listening);
        let addr = reactor.local_addr(id).unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        assert!(reactor
            .socket(id)
            .unwrap()
            .raw()
            .unwrap()
            .reuse_address()
            .unwrap());
    }

    #[test]
    fn test_accept_without_pending_is_none() {
        let mut reactor = Reactor::new();
        let id = reactor.tcp();
        reactor.listen_on(id, loopback(), None).unwrap();
        assert_eq!(reactor.accept(id).unwrap(), None);
    }

    #[test]
    fn test_send_queues_and_arms_write_interest() {
        let listener = TcpListener::bind(loopback()).unwrap();
        let mut reactor = Reactor::new();
        let id = reactor.tcp();
        let status = reactor.connect(id, listener.local_addr().unwrap()).unwrap();
        assert_ne!(status, ConnectStatus::Failed);
        assert!(reactor.registry().is_pending_add(id));

        assert_eq!(reactor.send(id, b"hello").unwrap(), 5);
        assert_eq!(reactor.socket(id).unwrap().outbuf().unwrap().len(), 5);
        assert!(reactor.socket(id).unwrap().wants_send());
    }

    #[test]
    fn test_send_on_closed_socket_fails() {
        let mut reactor = Reactor::new();
        let id = reactor.tcp();
        assert!(matches!(reactor.send(id, b"x"), Err(ReactorError::NotOpen(_))));
    }

    #[test]
    fn test_idle_tick_respects_timeout() {
        let mut reactor = Reactor::new();
        let started = std::time::Instant::now();
        reactor.tick(Duration::from_micros(200));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_nested_tick_is_ignored() {
        let mut reactor = Reactor::new();
        let fired = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&fired);
        reactor.set_timer(Duration::ZERO, 2, move |r, _| {
            *counter.borrow_mut() += 1;
            r.tick(Duration::ZERO);
            true
        });
        reactor.tick(Duration::ZERO);
        reactor.tick(Duration::ZERO);
        assert_eq!(*fired.borrow(), 2);
    }

    /// Raise the soft descriptor limit past `FD_SETSIZE`; false if the hard
    /// limit does not allow it.
    fn lift_nofile_limit() -> bool {
        let want = (FD_SETSIZE + 16) as libc::rlim_t;
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
            return false;
        }
        if limit.rlim_cur >= want {
            return true;
        }
        if limit.rlim_max < want {
            return false;
        }
        limit.rlim_cur = want;
        unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) == 0 }
    }

    #[test]
    fn test_descriptor_beyond_fd_setsize_fails_with_emfile() {
        use std::os::fd::{AsRawFd, FromRawFd};

        if !lift_nofile_limit() {
            eprintln!("skipping: RLIMIT_NOFILE hard limit is at or below FD_SETSIZE");
            return;
        }
        let listener = TcpListener::bind(loopback()).unwrap();
        let stream = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let high = unsafe { libc::fcntl(stream.as_raw_fd(), libc::F_DUPFD_CLOEXEC, FD_SETSIZE as libc::c_int) };
        assert!(high >= FD_SETSIZE as i32, "dup failed: {}", io::Error::last_os_error());
        let sock = unsafe { socket2::Socket::from_raw_fd(high) };

        let mut reactor = Reactor::new();
        let id = reactor.adopt(sock).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        for kind in [EventKind::Recv, EventKind::Error, EventKind::Close] {
            let log = Rc::clone(&seen);
            reactor
                .on(id, kind, move |_, _, event| log.borrow_mut().push(event.clone()))
                .unwrap();
        }

        reactor.tick(Duration::from_millis(10));
        let seen = seen.borrow();
        assert_eq!(seen.len(), 2, "{:?}", seen);
        assert!(matches!(seen[0], Event::Error { code: Some(libc::EMFILE), .. }));
        assert_eq!(seen[1], Event::Close);
        drop(seen);
        assert!(reactor.is_closed(id));

        reactor.tick(Duration::ZERO);
        assert_eq!(reactor.active_len(), 0);
    }
}
