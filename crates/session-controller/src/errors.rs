//! Session controller error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The controller reached zero publishers (or was cancelled) and stopped.
    #[error("Session controller has exited")]
    Exited,

    /// Mailbox or reply channel failure.
    #[error("Internal error: {0}")]
    Internal(String),
}
