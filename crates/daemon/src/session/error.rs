//! Session identifiers and errors.

use thiserror::Error;

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session's remote process is no longer open.
    #[error("session closed: {0}")]
    Closed(SessionId),

    /// The remote process could not be opened.
    #[error("remote process unavailable: {0}")]
    RemoteUnavailable(String),

    /// The target descriptor was rejected before opening anything.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// The registry already holds the configured maximum of sessions.
    #[error("session limit reached: {0}")]
    LimitReached(usize),

    /// Failed to write to the remote process input.
    #[error("failed to write to remote process: {0}")]
    WriteFailed(String),

    /// Failed to resize the remote terminal.
    #[error("failed to resize remote terminal: {0}")]
    ResizeFailed(String),

    /// Failed to close the remote process.
    #[error("failed to close remote process: {0}")]
    CloseFailed(String),

    /// The backend does not support the operation.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}
