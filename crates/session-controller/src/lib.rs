//! Session Controller Library
//!
//! One `SessionController` runs per worker process. It owns every engine
//! object on that worker and drives their signaling state machines:
//!
//! - Publisher, subscriber and external input/output lifecycle
//! - Offer/answer and trickle ICE relay between the engine and the caller
//! - Migration rebuild: a publisher moved from another worker is recreated
//!   from its remote SDP, SRTP material and buffered candidates without a new
//!   offer/answer round
//! - One keyframe request per new subscriber, sent once both ends are READY
//! - Optional connection statistics side channel
//!
//! # Architecture
//!
//! ```text
//! Message Bus / LocalCluster
//! └── SessionController (actor, one per worker)
//!     ├── MediaEngine (external: connections, fan-outs, inputs, outputs)
//!     └── ConnectionActor (one per engine connection)
//!         ├── ReadinessGate / keyframe request
//!         └── StatsForwarder (when enabled)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Controller and connection actors
//! - [`cluster`] - In-process Worker Process Manager and Message Bus
//! - [`config`] - Configuration from environment
//! - [`engine`] - Media Engine traits
//! - [`errors`] - Error types
//! - [`keyframe`] - Publisher readiness and FIR timing

pub mod actors;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod errors;
pub mod keyframe;
pub mod observability;
pub mod stats;

pub use actors::{SessionController, SessionControllerHandle, WorkerStatus};
pub use cluster::LocalCluster;
pub use config::Config;
pub use errors::WorkerError;
