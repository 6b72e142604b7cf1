//! Error types for the reactor.

use std::io;

use pollnet_buf::BufferError;

use crate::socket::{SocketId, SocketKind, SocketState};

#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("unknown socket {0}")]
    UnknownSocket(SocketId),

    #[error("socket {0} has no open descriptor")]
    NotOpen(SocketId),

    #[error("socket {id} is not a {expected} socket")]
    WrongKind { id: SocketId, expected: SocketKind },

    #[error("socket {id} cannot do that while {state:?}")]
    InvalidState { id: SocketId, state: SocketState },

    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("cannot resolve {0}")]
    Resolve(String),

    #[error("invalid socket option: {0}")]
    InvalidOption(String),
}

pub type Result<T> = std::result::Result<T, ReactorError>;

/// Would-block, in-progress, already and interrupted: try again on the next
/// readiness signal.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    ) {
        return true;
    }
    matches!(
        err.raw_os_error(),
        Some(code) if code == libc::EINPROGRESS
            || code == libc::EALREADY
            || code == libc::EAGAIN
            || code == libc::EWOULDBLOCK
            || code == libc::EINTR
    )
}
