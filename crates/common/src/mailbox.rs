//! Queue depth tracking for actor mailboxes.
//!
//! The monitor is shared between an actor and its handles. Handles count a
//! message in when they send it and the actor counts it out once handled, so
//! the depth includes everything still waiting in the channel. A backlog is
//! logged once it builds up:
//!
//! | Actor       | Elevated above | Critical above |
//! |-------------|----------------|----------------|
//! | Coordinator | 100            | 500            |
//! | Session     | 100            | 500            |
//! | Outbox      | 50             | 200            |
//!
//! An outbox backs up when its worker is slow to answer, so it warns earlier.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Which kind of actor a mailbox belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// Room coordinator (one per room).
    Coordinator,
    /// Session controller (one per worker).
    Session,
    /// Ordered call queue towards one worker.
    Outbox,
}

impl ActorType {
    /// Label used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Coordinator => "coordinator",
            ActorType::Session => "session",
            ActorType::Outbox => "outbox",
        }
    }

    #[must_use]
    pub const fn thresholds(&self) -> Thresholds {
        match self {
            ActorType::Coordinator | ActorType::Session => Thresholds {
                elevated: 100,
                critical: 500,
            },
            ActorType::Outbox => Thresholds {
                elevated: 50,
                critical: 200,
            },
        }
    }
}

/// Depths above which a backlog is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub elevated: usize,
    pub critical: usize,
}

impl Thresholds {
    #[must_use]
    pub const fn classify(&self, depth: usize) -> Backlog {
        if depth > self.critical {
            Backlog::Critical
        } else if depth > self.elevated {
            Backlog::Elevated
        } else {
            Backlog::Normal
        }
    }
}

/// How far behind a mailbox is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backlog {
    Normal,
    Elevated,
    Critical,
}

/// Message counters for one actor.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    actor_id: String,
    thresholds: Thresholds,
    queued: AtomicUsize,
    high_water: AtomicUsize,
    handled: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            thresholds: actor_type.thresholds(),
            queued: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            handled: AtomicU64::new(0),
        }
    }

    /// Count a message sent to the mailbox.
    ///
    /// Logs once when the backlog becomes elevated and on every message
    /// while it is critical.
    pub fn record_enqueue(&self) {
        let queued = self.queued.fetch_add(1, Ordering::Relaxed) + 1;
        self.high_water.fetch_max(queued, Ordering::Relaxed);

        match self.thresholds.classify(queued) {
            Backlog::Critical => warn!(
                target: "sfu.actor.mailbox",
                actor = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                queued,
                critical = self.thresholds.critical,
                "Mailbox backlog critical"
            ),
            Backlog::Elevated if queued == self.thresholds.elevated + 1 => debug!(
                target: "sfu.actor.mailbox",
                actor = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                queued,
                "Mailbox backlog building up"
            ),
            Backlog::Elevated | Backlog::Normal => {}
        }
    }

    /// Undo `record_enqueue` for a message the channel refused.
    pub fn record_send_failed(&self) {
        let _ = self
            .queued
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    /// Count a message as handled.
    pub fn record_dequeue(&self) {
        let _ = self
            .queued
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
        self.handled.fetch_add(1, Ordering::Relaxed);
    }

    /// Messages sent but not yet handled.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn backlog(&self) -> Backlog {
        self.thresholds.classify(self.queued())
    }
}
