//! Transport error types.

use std::io;

/// Errors surfaced by channel and event-loop operations.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Operation on a connection that is already closed.
    #[error("channel closed")]
    ClosedChannel,

    /// OS-level failure from read/write/select. Triggers connection close.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The event loop is no longer accepting work.
    #[error("event loop shut down")]
    LoopShutDown,

    /// A non-byte message reached the socket write path.
    #[error("unsupported outbound message type")]
    UnsupportedMessage,
}
