//! # pollnet-reactor
//!
//! Single-threaded socket reactor built on `select(2)`.
//!
//! A [`Reactor`] owns stream and datagram sockets, keeps per-socket
//! inbound/outbound [`ByteBuffer`]s for streams, and turns readiness into
//! lifecycle [`Event`]s delivered to per-socket callbacks. The host drives it
//! by calling [`Reactor::tick`] in a loop.
//!
//! ```no_run
//! use std::time::Duration;
//! use pollnet_reactor::{EventKind, Reactor};
//!
//! let mut reactor = Reactor::new();
//! let server = reactor.tcp();
//! reactor.listen_on(server, "127.0.0.1:7000".parse().unwrap(), None).unwrap();
//! reactor
//!     .on(server, EventKind::Accept, |r, id, _| {
//!         while let Ok(Some(conn)) = r.accept(id) {
//!             let _ = r.on(conn, EventKind::Recv, |r, conn, _| {
//!                 let mut buf = [0u8; 4096];
//!                 let n = r.recv(conn, &mut buf).unwrap_or(0);
//!                 let _ = r.send(conn, &buf[..n]);
//!             });
//!         }
//!     })
//!     .unwrap();
//!
//! loop {
//!     reactor.tick(Duration::from_millis(10));
//! }
//! ```

pub mod addr;
pub mod error;
pub mod event;
pub mod reactor;
pub mod registry;
pub mod select;
pub mod socket;
pub mod timer;

pub use addr::{bind_addr, resolve, AddrProbe};
pub use error::{ReactorError, Result};
pub use event::{Event, EventKind, Interest};
pub use pollnet_buf::ByteBuffer;
pub use reactor::{ConnectStatus, Reactor};
pub use registry::Registry;
pub use select::FD_SETSIZE;
pub use socket::{SockOption, Socket, SocketId, SocketKind, SocketState};
pub use timer::{now_millis, TimerId, TimerScheduler, TimerTick};
