// src/ratelimit/store.rs

//! Shared counter store abstraction.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// One member of a scored set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredEntry {
    pub member: String,
    pub score: u64,
}

impl ScoredEntry {
    /// Weight carried as a trailing `:weight` on the member, zero if absent.
    pub fn weight(&self) -> u64 {
        self.member
            .rsplit_once(':')
            .and_then(|(_, weight)| weight.parse().ok())
            .unwrap_or(0)
    }
}

/// Outcome of [`CounterStore::add_within`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAdmission {
    Added,
    /// Adding would pass capacity; `usage` is the live weight in the window
    Full { usage: u64 },
}

/// Atomic, low-latency key-value store with TTL support.
///
/// Every operation is atomic on its own; callers compose them without any
/// cross-call transaction.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment a counter, creating it at zero, and return the new value.
    async fn incr(&self, key: &str) -> Result<u64>;

    /// Expire a key (counter or scored set) after `ttl`.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Add or replace a member of a scored set.
    async fn add_entry(&self, key: &str, member: &str, score: u64) -> Result<()>;

    /// In one atomic step: drop members scored below `window_start`, sum the
    /// weights of the rest and add `entry` only if the sum plus its weight
    /// stays within `capacity`. The key expires `ttl` after a successful add.
    async fn add_within(
        &self,
        key: &str,
        entry: &ScoredEntry,
        window_start: u64,
        capacity: u64,
        ttl: Duration,
    ) -> Result<WindowAdmission>;

    /// Members with `min <= score <= max`, ordered by score.
    async fn entries(&self, key: &str, min: u64, max: u64) -> Result<Vec<ScoredEntry>>;

    /// Remove members scored strictly below `score`.
    async fn purge_before(&self, key: &str, score: u64) -> Result<()>;
}
