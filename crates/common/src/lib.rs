//! Common types shared across the SFU control plane components.
//!
//! Both the room-level coordinator and the per-worker session controller
//! speak in terms of the identifiers, signaling messages and collaborator
//! traits defined here.

#![warn(clippy::pedantic)]

/// Message Bus, Worker Process Manager and stats collector traits
pub mod bus;

/// Common error types
pub mod error;

/// Mailbox depth monitoring for actors
pub mod mailbox;

/// Legacy ROAP envelope conversion
pub mod roap;

/// Signaling messages, ICE candidates and migration context
pub mod signaling;

/// Identifier newtypes
pub mod types;
