//! Self-expiring, generation-based mutual exclusion for periodic jobs.
//!
//! A lock row is never released. Acquiring it bumps the generation and pushes
//! `not_before` forward; other replicas skip their run until that time passes.

mod cleanup;

pub use cleanup::{CLEANUP_LOCK, CleanupConfig, run_cleanup, spawn_cleanup_worker};

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStatus {
    pub name: String,
    pub generation: i64,
    pub not_before: DateTime<Utc>,
}

impl LockStatus {
    /// Row state for a lock that has never been taken.
    #[must_use]
    pub fn unclaimed(name: &str) -> Self {
        Self {
            name: name.to_string(),
            generation: 0,
            not_before: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    #[must_use]
    pub fn is_free(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_before
    }

    /// The row a successful acquisition writes, or `None` while held.
    #[must_use]
    pub fn acquire(&self, duration: Duration, now: DateTime<Utc>) -> Option<Self> {
        if !self.is_free(now) {
            return None;
        }
        Some(Self {
            name: self.name.clone(),
            generation: self.generation + 1,
            not_before: now + duration,
        })
    }
}
