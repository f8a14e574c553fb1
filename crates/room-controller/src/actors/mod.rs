//! Actor implementation of the room coordinator.
//!
//! ```text
//! Coordinator (one per room)
//! ├── owns publisher / subscriber / external-output registries
//! ├── keepalive ticker (direct pings, bypassing outboxes)
//! └── one Outbox per worker in use (ordered worker calls)
//! ```
//!
//! # Modules
//!
//! - [`coordinator`] - `Coordinator` and its handle
//! - [`messages`] - Message and state snapshot types

pub mod coordinator;
pub mod messages;

pub use coordinator::{Coordinator, CoordinatorHandle};
pub use messages::{CoordinatorMessage, PublisherInfo, RoomState, SubscribeOptions};
