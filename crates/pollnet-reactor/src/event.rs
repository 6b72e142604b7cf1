//! Readiness interest and lifecycle events.

use std::fmt;
use std::io;
use std::str::FromStr;

bitflags::bitflags! {
    /// Readiness classes a socket cares about, or that the last wait observed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u8 {
        const RECV = 0b0001;
        const SEND = 0b0010;
        const ERROR = 0b0100;
        const ALL = Self::RECV.bits() | Self::SEND.bits() | Self::ERROR.bits();
    }
}

/// Names of the per-socket callback slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Accept,
    Recv,
    Send,
    Close,
    Poll,
    Error,
}

impl EventKind {
    pub const COUNT: usize = 7;

    pub const ALL: [EventKind; Self::COUNT] = [
        EventKind::Connect,
        EventKind::Accept,
        EventKind::Recv,
        EventKind::Send,
        EventKind::Close,
        EventKind::Poll,
        EventKind::Error,
    ];

    pub(crate) fn slot(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Accept => "accept",
            EventKind::Recv => "recv",
            EventKind::Send => "send",
            EventKind::Close => "close",
            EventKind::Poll => "poll",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown event: {}", s))
    }
}

/// What a callback is being told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Outcome of an outbound connect.
    Connect { ok: bool },
    /// A listening socket has a connection waiting for `accept`.
    Accept,
    /// Bytes appended to the inbound buffer this tick. Datagram sockets
    /// report 0: a datagram is ready for `recv_from`.
    Recv { bytes: usize },
    /// Bytes flushed from the outbound buffer this tick.
    Send { bytes: usize },
    Close,
    /// Fired for every active socket on every tick, ready or not.
    Poll,
    /// A fatal error is about to close the socket.
    Error {
        kind: io::ErrorKind,
        code: Option<i32>,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Connect { .. } => EventKind::Connect,
            Event::Accept => EventKind::Accept,
            Event::Recv { .. } => EventKind::Recv,
            Event::Send { .. } => EventKind::Send,
            Event::Close => EventKind::Close,
            Event::Poll => EventKind::Poll,
            Event::Error { .. } => EventKind::Error,
        }
    }

    pub(crate) fn from_io(err: &io::Error) -> Self {
        Event::Error {
            kind: err.kind(),
            code: err.raw_os_error(),
        }
    }
}
