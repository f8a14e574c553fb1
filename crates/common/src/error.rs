//! Common error types for SFU control plane components.

use thiserror::Error;

/// Errors surfaced by the Message Bus or the Worker Process Manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The addressed worker queue has no live consumer.
    #[error("Worker unreachable: {0}")]
    Unreachable(String),

    /// The Worker Process Manager could not provide a worker.
    #[error("Worker creation failed: {0}")]
    WorkerCreation(String),
}
