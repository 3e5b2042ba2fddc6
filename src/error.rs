use std::io;
use thiserror::Error;

/// Errors returned by loop construction and socket setup paths.
///
/// Runtime errors on an individual socket are never surfaced here; they are
/// delivered to that socket's callbacks (`on_close`, `on_connect_error`) and
/// never propagate to the loop or to sibling sockets.
#[derive(Debug, Error)]
pub enum Error {
    /// Poller or socket setup failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The host string did not parse and could not be queued for resolution.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// The socket id is stale or out of range.
    #[error("unknown socket")]
    UnknownSocket,
    /// The context id is stale or out of range.
    #[error("unknown context")]
    UnknownContext,
    /// The operation targeted a context that is already closed.
    #[error("context is closed")]
    ContextClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
