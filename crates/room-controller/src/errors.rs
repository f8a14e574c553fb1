//! Coordinator error types.
//!
//! Internal details are logged server-side; callers facing clients should use
//! [`RoomError::client_message`].

use common::error::BusError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RoomError {
    /// A call towards a worker or the Worker Process Manager failed.
    #[error("Message bus error: {0}")]
    Bus(#[from] BusError),

    /// No worker could be created for a publisher.
    #[error("Worker creation failed: {0}")]
    WorkerCreation(String),

    /// The publisher is not tracked by this room.
    #[error("Publisher not found: {0}")]
    PublisherNotFound(String),

    /// The publisher is tracked but currently has no worker (still being
    /// placed, or its worker stopped answering keepalives).
    #[error("Publisher has no worker: {0}")]
    NoWorker(String),

    /// `removeExternalOutput` for a URL nobody records to.
    #[error("This stream is not being recorded")]
    NotRecorded,

    #[error("Migration already in progress: {0}")]
    MigrationInProgress(String),

    /// Mailbox or reply channel failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RoomError {
    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RoomError::Bus(_) | RoomError::Internal(_) => "An internal error occurred".to_string(),
            RoomError::WorkerCreation(_) => "No media worker available".to_string(),
            RoomError::PublisherNotFound(_) => "Stream not found".to_string(),
            RoomError::NoWorker(_) => "Stream is not available right now".to_string(),
            RoomError::NotRecorded => self.to_string(),
            RoomError::MigrationInProgress(_) => "Stream is already being moved".to_string(),
        }
    }
}
