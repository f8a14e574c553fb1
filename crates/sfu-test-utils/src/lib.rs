//! # SFU Test Utilities
//!
//! Shared mocks and fixtures for the coordinator and session controller
//! tests, so neither needs a real media engine or message bus.
//!
//! ## Modules
//!
//! - `mock_engine` - Recording Media Engine whose connections tests drive by
//!   emitting engine events
//! - `mock_bus` - Recording Worker Process Manager and Message Bus
//! - `mock_stats` - Recording stats collector
//! - `fixtures` - Candidates, SDPs, SRTP material, configs
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let engine = MockEngine::new();
//!     let (worker, _task) = SessionController::spawn(test_worker_config(), engine.as_engine(), None);
//!
//!     let mut stream = worker.add_publisher("p1".into()).await.unwrap().unwrap();
//!     engine.connection(0).emit(EngineEvent::State(ConnectionState::Initial));
//!     assert_eq!(stream.recv().await, Some(SignalingMessage::Initializing));
//! }
//! ```

pub mod fixtures;
pub mod mock_bus;
pub mod mock_engine;
pub mod mock_stats;

pub use fixtures::*;
pub use mock_bus::*;
pub use mock_engine::*;
pub use mock_stats::*;

use std::time::Duration;

/// Install a test-friendly tracing subscriber honoring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs it.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds, failing the test after ~2 seconds.
///
/// Works with paused time as well: each sleep auto-advances the clock.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
