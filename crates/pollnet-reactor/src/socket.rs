//! Socket handles: descriptor, state machine, buffers and callback slots.

use std::fmt;
use std::io::{self, Read};
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use pollnet_buf::ByteBuffer;
use socket2::{Domain, Protocol, SockAddr, Type};

use crate::error::{is_transient, ReactorError, Result};
use crate::event::{Event, EventKind, Interest};
use crate::reactor::Reactor;

/// Stable handle for a socket owned by a [`Reactor`]. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    pub fn from_raw(raw: u64) -> Self {
        SocketId(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Stream,
    Datagram,
}

impl SocketKind {
    fn socket_type(self) -> Type {
        match self {
            SocketKind::Stream => Type::STREAM,
            SocketKind::Datagram => Type::DGRAM,
        }
    }

    fn protocol(self) -> Protocol {
        match self {
            SocketKind::Stream => Protocol::TCP,
            SocketKind::Datagram => Protocol::UDP,
        }
    }
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketKind::Stream => f.write_str("stream"),
            SocketKind::Datagram => f.write_str("datagram"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// No descriptor yet, or one created but not connected/bound.
    Uninitialized,
    Connecting,
    Connected,
    ConnectFailed,
    Bound,
    Listening,
    /// Produced by `accept`; behaves like `Connected`.
    Accepted,
    Closed,
}

/// Options applied with [`Reactor::set_option`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockOption {
    NonBlocking(bool),
    ReuseAddr(bool),
    Broadcast(bool),
    SendTimeout(Option<Duration>),
    RecvTimeout(Option<Duration>),
    SendBufferSize(usize),
    RecvBufferSize(usize),
}

impl SockOption {
    /// Parse a `KEY`/value pair such as `("SENDBUFSIZE", "65536")`.
    ///
    /// Booleans accept `1/0/true/false`; timeouts are seconds, `0` clears.
    pub fn parse(key: &str, value: &str) -> Result<Self> {
        let invalid = || ReactorError::InvalidOption(format!("{}={}", key, value));
        let flag = || match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" => Ok(true),
            "0" | "false" | "off" => Ok(false),
            _ => Err(invalid()),
        };
        let size = || value.trim().parse::<usize>().map_err(|_| invalid());
        let timeout = || {
            let secs: f64 = value.trim().parse().map_err(|_| invalid())?;
            if !secs.is_finite() || secs < 0.0 {
                return Err(invalid());
            }
            Ok((secs > 0.0).then(|| Duration::from_secs_f64(secs)))
        };

        match key.to_ascii_uppercase().as_str() {
            "BLOCKING" => Ok(SockOption::NonBlocking(!flag()?)),
            "NONBLOCKING" => Ok(SockOption::NonBlocking(flag()?)),
            "REUSEADDR" => Ok(SockOption::ReuseAddr(flag()?)),
            "BROADCAST" => Ok(SockOption::Broadcast(flag()?)),
            "SENDTIMEOUT" => Ok(SockOption::SendTimeout(timeout()?)),
            "RECVTIMEOUT" => Ok(SockOption::RecvTimeout(timeout()?)),
            "SENDBUFSIZE" => Ok(SockOption::SendBufferSize(size()?)),
            "RECVBUFSIZE" => Ok(SockOption::RecvBufferSize(size()?)),
            _ => Err(ReactorError::InvalidOption(key.to_string())),
        }
    }

    fn apply(&self, sock: &socket2::Socket) -> io::Result<()> {
        match *self {
            SockOption::NonBlocking(on) => sock.set_nonblocking(on),
            SockOption::ReuseAddr(on) => sock.set_reuse_address(on),
            SockOption::Broadcast(on) => sock.set_broadcast(on),
            SockOption::SendTimeout(t) => sock.set_write_timeout(t),
            SockOption::RecvTimeout(t) => sock.set_read_timeout(t),
            SockOption::SendBufferSize(n) => sock.set_send_buffer_size(n),
            SockOption::RecvBufferSize(n) => sock.set_recv_buffer_size(n),
        }
    }
}

pub(crate) type Callback = Box<dyn FnMut(&mut Reactor, SocketId, &Event)>;

/// A callback slot. `Busy` while its callback is running.
#[derive(Default)]
enum Slot {
    #[default]
    Empty,
    Idle(Callback),
    Busy {
        cleared: bool,
    },
}

/// Result of one drain of the OS send or receive path.
#[derive(Debug)]
pub(crate) enum Flow {
    /// Bytes moved before the OS would block.
    Moved(usize),
    /// Orderly shutdown by the peer.
    PeerClosed,
    Failed(io::Error),
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

pub struct Socket {
    id: SocketId,
    kind: SocketKind,
    sock: Option<socket2::Socket>,
    domain: Option<Domain>,
    state: SocketState,
    pub(crate) care: Interest,
    pub(crate) fired: Interest,
    fault: Option<io::Error>,
    inbuf: Option<ByteBuffer>,
    outbuf: Option<ByteBuffer>,
    slots: [Slot; EventKind::COUNT],
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("fd", &self.fd())
            .field("state", &self.state)
            .field("care", &self.care)
            .field("fired", &self.fired)
            .finish()
    }
}

impl Socket {
    pub(crate) fn new(id: SocketId, kind: SocketKind, block_size: usize) -> Self {
        let buffers = || match kind {
            SocketKind::Stream => Some(ByteBuffer::with_block_size(block_size)),
            SocketKind::Datagram => None,
        };
        Self {
            id,
            kind,
            sock: None,
            domain: None,
            state: SocketState::Uninitialized,
            care: Interest::empty(),
            fired: Interest::empty(),
            fault: None,
            inbuf: buffers(),
            outbuf: buffers(),
            slots: Default::default(),
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    /// OS descriptor, `None` when closed or never created.
    pub fn fd(&self) -> Option<RawFd> {
        self.sock.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn is_closed(&self) -> bool {
        self.sock.is_none()
    }

    /// Interest registered with the reactor.
    pub fn care(&self) -> Interest {
        self.care
    }

    /// Readiness observed by the most recent wait.
    pub fn fired(&self) -> Interest {
        self.fired
    }

    /// A connecting stream has nothing to read; the connect verdict comes
    /// from writability or the error set.
    pub fn wants_recv(&self) -> bool {
        !(self.kind == SocketKind::Stream && self.state == SocketState::Connecting)
    }

    /// Stream sockets want writability while connecting or while data is
    /// queued; datagram sockets never do.
    pub fn wants_send(&self) -> bool {
        match self.kind {
            SocketKind::Stream => {
                self.state == SocketState::Connecting
                    || self.outbuf.as_ref().is_some_and(|b| !b.is_empty())
            }
            SocketKind::Datagram => false,
        }
    }

    pub fn inbuf(&self) -> Option<&ByteBuffer> {
        self.inbuf.as_ref()
    }

    pub fn outbuf(&self) -> Option<&ByteBuffer> {
        self.outbuf.as_ref()
    }

    pub(crate) fn inbuf_mut(&mut self) -> Option<&mut ByteBuffer> {
        self.inbuf.as_mut()
    }

    pub(crate) fn outbuf_mut(&mut self) -> Option<&mut ByteBuffer> {
        self.outbuf.as_mut()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = self.raw()?.local_addr()?;
        inet(addr)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        let addr = self.raw()?.peer_addr()?;
        inet(addr)
    }

    pub(crate) fn raw(&self) -> Result<&socket2::Socket> {
        self.sock.as_ref().ok_or(ReactorError::NotOpen(self.id))
    }

    pub(crate) fn domain(&self) -> Option<Domain> {
        self.domain
    }

    pub(crate) fn set_state(&mut self, state: SocketState) {
        self.state = state;
    }

    pub(crate) fn set_option(&self, option: SockOption) -> Result<()> {
        option.apply(self.raw()?)?;
        Ok(())
    }

    /// Allocate a fresh non-blocking descriptor, dropping any previous one.
    pub(crate) fn open(&mut self, domain: Domain) -> Result<()> {
        let sock = socket2::Socket::new(domain, self.kind.socket_type(), Some(self.kind.protocol()))?;
        sock.set_nonblocking(true)?;
        #[cfg(target_vendor = "apple")]
        sock.set_nosigpipe(true)?;
        self.install(sock, domain, SocketState::Uninitialized);
        Ok(())
    }

    /// Take ownership of an already-open descriptor.
    pub(crate) fn install(&mut self, sock: socket2::Socket, domain: Domain, state: SocketState) {
        self.sock = Some(sock);
        self.domain = Some(domain);
        self.state = state;
        self.fired = Interest::empty();
        self.fault = None;
        if let Some(buf) = self.inbuf.as_mut() {
            buf.reset();
        }
        if let Some(buf) = self.outbuf.as_mut() {
            buf.reset();
        }
    }

    /// Drop the descriptor. Returns `false` if it was already closed.
    ///
    /// Queued outbound bytes are discarded; unread inbound bytes stay
    /// readable.
    pub(crate) fn close_descriptor(&mut self) -> bool {
        let Some(sock) = self.sock.take() else {
            return false;
        };
        drop(sock);
        self.state = SocketState::Closed;
        self.fired = Interest::empty();
        if let Some(buf) = self.outbuf.as_mut() {
            buf.reset();
        }
        true
    }

    /// Mark an error observed outside the OS socket error slot.
    pub(crate) fn set_fault(&mut self, err: io::Error) {
        self.fault = Some(err);
    }

    /// Pending error: a recorded fault, else the OS `SO_ERROR` value.
    pub(crate) fn take_error(&mut self) -> Option<io::Error> {
        if let Some(err) = self.fault.take() {
            return Some(err);
        }
        match self.sock.as_ref()?.take_error() {
            Ok(err) => err,
            Err(err) => Some(err),
        }
    }

    /// Send queued outbound bytes until the OS would block.
    pub(crate) fn flush(&mut self) -> Flow {
        let (Some(sock), Some(out)) = (self.sock.as_ref(), self.outbuf.as_mut()) else {
            return Flow::Moved(0);
        };
        let mut sent = 0;
        while !out.is_empty() {
            match sock.send_with_flags(out.as_slice(), SEND_FLAGS) {
                Ok(0) => return Flow::Failed(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    out.discard(n);
                    sent += n;
                }
                Err(err) if is_transient(&err) => break,
                Err(err) => return Flow::Failed(err),
            }
        }
        Flow::Moved(sent)
    }

    /// Read into the inbound buffer until the OS would block.
    pub(crate) fn fill(&mut self, scratch: &mut [u8]) -> Flow {
        let (Some(sock), Some(inbuf)) = (self.sock.as_ref(), self.inbuf.as_mut()) else {
            return Flow::Moved(0);
        };
        let mut reader: &socket2::Socket = sock;
        let mut received = 0;
        loop {
            match reader.read(scratch) {
                Ok(0) => return Flow::PeerClosed,
                Ok(n) => {
                    if let Err(err) = inbuf.write(&scratch[..n]) {
                        return Flow::Failed(io::Error::new(io::ErrorKind::OutOfMemory, err));
                    }
                    received += n;
                }
                Err(err) if is_transient(&err) => break,
                Err(err) => return Flow::Failed(err),
            }
        }
        Flow::Moved(received)
    }

    pub(crate) fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> Result<usize> {
        match self.raw()?.send_to_with_flags(bytes, &SockAddr::from(addr), SEND_FLAGS) {
            Ok(n) => Ok(n),
            Err(err) if is_transient(&err) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        let sock = self.raw()?;
        // SAFETY: an initialised byte slice is a valid `[MaybeUninit<u8>]`,
        // and recv_from only writes initialised bytes into it.
        let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        match sock.recv_from(uninit) {
            Ok((n, addr)) => Ok(Some((n, inet(addr)?))),
            Err(err) if is_transient(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) fn take_callback(&mut self, kind: EventKind) -> Option<Callback> {
        let slot = &mut self.slots[kind.slot()];
        match std::mem::take(slot) {
            Slot::Idle(callback) => {
                *slot = Slot::Busy { cleared: false };
                Some(callback)
            }
            other => {
                *slot = other;
                None
            }
        }
    }

    pub(crate) fn restore_callback(&mut self, kind: EventKind, callback: Callback) {
        let slot = &mut self.slots[kind.slot()];
        if let Slot::Busy { cleared } = *slot {
            *slot = if cleared {
                Slot::Empty
            } else {
                Slot::Idle(callback)
            };
        }
    }

    pub(crate) fn set_callback(&mut self, kind: EventKind, callback: Callback) {
        self.slots[kind.slot()] = Slot::Idle(callback);
    }

    pub(crate) fn clear_callback(&mut self, kind: EventKind) {
        let slot = &mut self.slots[kind.slot()];
        *slot = match slot {
            Slot::Busy { .. } => Slot::Busy { cleared: true },
            _ => Slot::Empty,
        };
    }

    pub fn has_callback(&self, kind: EventKind) -> bool {
        matches!(self.slots[kind.slot()], Slot::Idle(_) | Slot::Busy { cleared: false })
    }
}

pub(crate) fn domain_for(addr: &SocketAddr) -> Domain {
    Domain::for_address(*addr)
}

fn inet(addr: SockAddr) -> Result<SocketAddr> {
    addr.as_socket().ok_or_else(|| {
        ReactorError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            "not an internet socket address",
        ))
    })
}
