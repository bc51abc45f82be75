//! qmq error types.
//!
//! Transport and protocol errors are ordinary `Result` values;
//! programmer errors are not represented here — see [`crate::fatal`].

use std::io;
use thiserror::Error;

/// Error type shared by every qmq crate.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error underneath a socket operation.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error surfaced by the underlying zmq socket library.
    #[error("zmq error: {0}")]
    Zmq(#[from] zmq::Error),

    /// Unexpected header, bad signature, wrong version, missing envelope.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A frame failed to decode (bad length prefix, truncated buffer).
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// The socket was closed mid-operation.
    #[error("socket closed")]
    SocketClosed,

    /// Context or reactor shutdown was observed mid-operation.
    #[error("terminated")]
    Terminated,

    /// A binary-picture (bsend/brecv) element exceeded its size limit.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type alias used throughout qmq.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build a [`Error::Protocol`] from anything stringy.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Build a [`Error::InvalidFrame`] from anything stringy.
    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Self::InvalidFrame(msg.into())
    }

    /// Whether the loop that produced this error should keep running
    /// (transport/protocol errors, §7) or let it propagate outward.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            Self::Zmq(e) => matches!(*e, zmq::Error::EAGAIN | zmq::Error::EINTR),
            Self::Protocol(_) | Self::InvalidFrame(_) | Self::MessageTooLarge { .. } => true,
            Self::SocketClosed | Self::Terminated => false,
        }
    }
}
