// src/ratelimit/memory.rs

//! Process-local counter store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::ratelimit::{Clock, CounterStore, ScoredEntry, WindowAdmission};

#[derive(Debug, Default)]
struct Counter {
    value: u64,
    expires_at: Option<u64>,
}

#[derive(Debug, Default)]
struct ScoredSet {
    entries: Vec<ScoredEntry>,
    expires_at: Option<u64>,
}

#[derive(Debug, Default)]
struct State {
    counters: HashMap<String, Counter>,
    sets: HashMap<String, ScoredSet>,
}

impl State {
    fn evict(&mut self, now: u64) {
        let live = |expires_at: Option<u64>| expires_at.is_none_or(|t| t > now);
        self.counters.retain(|_, c| live(c.expires_at));
        self.sets.retain(|_, s| live(s.expires_at));
    }
}

/// In-memory store shared by the tasks of one process.
///
/// Expired keys are dropped on every access, so the maps only hold live
/// windows.
pub struct MemoryCounterStore {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl MemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| AppError::store("memory counter store lock poisoned"))?;
        state.evict(self.clock.now_ms());
        Ok(state)
    }

    /// Number of live keys, counters and sets together.
    pub fn key_count(&self) -> usize {
        self.lock()
            .map(|s| s.counters.len() + s.sets.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr(&self, key: &str) -> Result<u64> {
        let mut state = self.lock()?;
        let counter = state.counters.entry(key.to_string()).or_default();
        counter.value += 1;
        Ok(counter.value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let expires_at = self.clock.now_ms() + ttl.as_millis() as u64;
        let mut state = self.lock()?;
        if let Some(counter) = state.counters.get_mut(key) {
            counter.expires_at = Some(expires_at);
        }
        if let Some(set) = state.sets.get_mut(key) {
            set.expires_at = Some(expires_at);
        }
        Ok(())
    }

    async fn add_entry(&self, key: &str, member: &str, score: u64) -> Result<()> {
        let mut state = self.lock()?;
        let set = state.sets.entry(key.to_string()).or_default();
        set.entries.retain(|e| e.member != member);
        let at = set.entries.partition_point(|e| e.score <= score);
        set.entries.insert(
            at,
            ScoredEntry {
                member: member.to_string(),
                score,
            },
        );
        Ok(())
    }

    async fn add_within(
        &self,
        key: &str,
        entry: &ScoredEntry,
        window_start: u64,
        capacity: u64,
        ttl: Duration,
    ) -> Result<WindowAdmission> {
        let now = self.clock.now_ms();
        let mut state = self.lock()?;
        let set = state.sets.entry(key.to_string()).or_default();
        set.entries.retain(|e| e.score >= window_start);

        let usage: u64 = set.entries.iter().map(ScoredEntry::weight).sum();
        if usage + entry.weight() > capacity {
            return Ok(WindowAdmission::Full { usage });
        }
        set.entries.retain(|e| e.member != entry.member);
        let at = set.entries.partition_point(|e| e.score <= entry.score);
        set.entries.insert(at, entry.clone());
        set.expires_at = Some(now + ttl.as_millis() as u64);
        Ok(WindowAdmission::Added)
    }

    async fn entries(&self, key: &str, min: u64, max: u64) -> Result<Vec<ScoredEntry>> {
        let state = self.lock()?;
        Ok(state
            .sets
            .get(key)
            .map(|set| {
                set.entries
                    .iter()
                    .filter(|e| e.score >= min && e.score <= max)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn purge_before(&self, key: &str, score: u64) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(set) = state.sets.get_mut(key) {
            set.entries.retain(|e| e.score >= score);
        }
        Ok(())
    }
}
