//! Actor implementation of the session controller.
//!
//! ```text
//! SessionController (one per worker process)
//! ├── owns publisher / subscriber / external-output registries
//! └── spawns N ConnectionActors
//!     ├── publisher connection (opens the publisher's readiness gate)
//!     └── subscriber connections (request one keyframe once ready)
//! ```
//!
//! # Modules
//!
//! - [`controller`] - `SessionController` and its handle
//! - [`connection`] - `ConnectionActor` driving one engine connection
//! - [`messages`] - Message and status types

pub mod connection;
pub mod controller;
pub mod messages;

pub use controller::{SessionController, SessionControllerHandle};
pub use messages::{PublisherStatus, SessionMessage, SubscriberStatus, WorkerStatus};
