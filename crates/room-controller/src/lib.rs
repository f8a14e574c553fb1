//! Room Controller Library
//!
//! One `Coordinator` runs per room. It decides which worker hosts each
//! publisher and relays every client operation to that worker's session
//! controller:
//!
//! - One new worker per publisher, requested from the Worker Process Manager
//! - Subscriber bookkeeping and signaling relay, in issue order per worker
//! - Keepalive pings; a silent worker is unpublished, deleted and its
//!   publishers unmapped
//! - Publisher migration to a fresh worker using the recorded signaling
//!   context and the old worker's SRTP material
//! - Recording / re-streaming outputs keyed by URL
//!
//! # Architecture
//!
//! ```text
//! Client layer
//! └── Coordinator (actor, one per room)
//!     ├── WorkerAgent (create / delete workers)
//!     ├── Outbox (one per worker) ──► WorkerClient ──► SessionController
//!     └── event listeners (unpublish)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Coordinator actor and messages
//! - [`config`] - Configuration from environment
//! - [`errors`] - Error types
//! - [`events`] - Room events delivered to listeners
//! - [`observability`] - Metrics

pub mod actors;
pub mod config;
pub mod errors;
pub mod events;
pub mod observability;
mod outbox;

pub use actors::{Coordinator, CoordinatorHandle, RoomState, SubscribeOptions};
pub use config::Config;
pub use errors::RoomError;
pub use events::RoomEvent;
