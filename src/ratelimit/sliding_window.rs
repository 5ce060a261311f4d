// src/ratelimit/sliding_window.rs

//! Sliding-window token-rate limiter.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::error::Result;
use crate::ratelimit::{Clock, CounterStore, ScoredEntry, WindowAdmission};

const BACKOFF_START: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

static RESERVATION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Outcome of [`TokenRateLimiter::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// Capacity was available and the cost is recorded
    Reserved,
    /// Larger than the whole window; recorded and admitted anyway
    Oversized,
    /// No capacity before `max_wait` elapsed
    TimedOut { usage: u64 },
    /// The counter store failed; nothing was recorded
    Unmetered,
}

impl Reservation {
    /// Whether the caller may proceed without overrunning the quota.
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Self::TimedOut { .. })
    }
}

/// Current usage and the estimated wait before `cost` more would fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Availability {
    pub usage: u64,
    pub capacity: u64,
    pub wait: Duration,
}

/// Caps tokens consumed in a trailing window, shared across workers.
///
/// Each reservation is a scored-set member `nonce:cost` scored by its
/// timestamp. The store sums the window and records the entry in one atomic
/// step, so concurrent callers never push the window past `capacity` and one
/// of them always wins while room remains.
pub struct TokenRateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    key: String,
    capacity: u64,
    window_ms: u64,
}

impl TokenRateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        key: impl Into<String>,
        capacity: u64,
        window: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            key: key.into(),
            capacity,
            window_ms: (window.as_millis() as u64).max(1),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn window_start(&self, now: u64) -> u64 {
        now.saturating_sub(self.window_ms)
    }

    async fn live_entries(&self, now: u64) -> Result<Vec<ScoredEntry>> {
        let start = self.window_start(now);
        self.store.purge_before(&self.key, start).await?;
        self.store.entries(&self.key, start, u64::MAX).await
    }

    /// Tokens reserved in the trailing window.
    pub async fn current_usage(&self) -> Result<u64> {
        let entries = self.live_entries(self.clock.now_ms()).await?;
        Ok(entries.iter().map(ScoredEntry::weight).sum())
    }

    /// Usage and estimated wait for `cost`, without reserving anything.
    pub async fn check_available(&self, cost: u64) -> Result<Availability> {
        let now = self.clock.now_ms();
        let entries = self.live_entries(now).await?;
        let usage: u64 = entries.iter().map(ScoredEntry::weight).sum();

        let mut wait = Duration::ZERO;
        if cost <= self.capacity && usage + cost > self.capacity {
            let mut remaining = usage;
            for entry in &entries {
                remaining -= entry.weight();
                if remaining + cost <= self.capacity {
                    let frees_at = entry.score + self.window_ms;
                    wait = Duration::from_millis(frees_at.saturating_sub(now));
                    break;
                }
            }
        }
        Ok(Availability {
            usage,
            capacity: self.capacity,
            wait,
        })
    }

    /// Reserve `cost` tokens, waiting up to `max_wait` for capacity.
    pub async fn reserve(&self, cost: u64, max_wait: Duration) -> Reservation {
        match self.reserve_inner(cost, max_wait).await {
            Ok(reservation) => reservation,
            Err(e) => {
                log::warn!(
                    "Token limiter {} unavailable, proceeding unmetered: {}",
                    self.key,
                    e
                );
                Reservation::Unmetered
            }
        }
    }

    async fn reserve_inner(&self, cost: u64, max_wait: Duration) -> Result<Reservation> {
        if cost > self.capacity {
            log::warn!(
                "Request of {} tokens exceeds {} capacity {}, admitting",
                cost,
                self.key,
                self.capacity
            );
            self.record(cost).await?;
            return Ok(Reservation::Oversized);
        }

        let deadline = Instant::now() + max_wait;
        let mut backoff = BACKOFF_START;
        loop {
            let now_ms = self.clock.now_ms();
            let entry = ScoredEntry {
                member: format!("{}:{}", nonce(now_ms), cost),
                score: now_ms,
            };
            let admission = self
                .store
                .add_within(
                    &self.key,
                    &entry,
                    self.window_start(now_ms),
                    self.capacity,
                    self.ttl(),
                )
                .await?;
            let usage = match admission {
                WindowAdmission::Added => return Ok(Reservation::Reserved),
                WindowAdmission::Full { usage } => usage,
            };

            let now = Instant::now();
            if now >= deadline {
                log::info!(
                    "Token limiter {} still at {}/{} after {:?}",
                    self.key,
                    usage,
                    self.capacity,
                    max_wait
                );
                return Ok(Reservation::TimedOut { usage });
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_millis(self.window_ms + 1_000)
    }

    async fn record(&self, cost: u64) -> Result<()> {
        let now = self.clock.now_ms();
        let member = format!("{}:{}", nonce(now), cost);
        self.store.add_entry(&self.key, &member, now).await?;
        self.store.expire(&self.key, self.ttl()).await
    }
}

/// Member prefix unique across processes sharing the store.
fn nonce(now: u64) -> String {
    let seq = RESERVATION_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut hasher = Sha256::new();
    hasher.update(std::process::id().to_be_bytes());
    hasher.update(now.to_be_bytes());
    hasher.update(seq.to_be_bytes());
    hasher.update(format!("{:?}", std::time::SystemTime::now()).as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::test_support::{BrokenStore, PausedClock, YieldingStore};
    use crate::ratelimit::{ManualClock, MemoryCounterStore};
    use futures::future::join_all;

    fn limiter(clock: Arc<dyn Clock>, capacity: u64) -> TokenRateLimiter {
        let store = Arc::new(MemoryCounterStore::new(clock.clone()));
        TokenRateLimiter::new(store, clock, "tokens:model", capacity, Duration::from_secs(60))
    }

    fn yielding_limiter(clock: Arc<dyn Clock>, capacity: u64) -> TokenRateLimiter {
        let store = Arc::new(YieldingStore::new(clock.clone()));
        TokenRateLimiter::new(store, clock, "tokens:model", capacity, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_reserve_within_capacity_is_immediate() {
        let limiter = limiter(Arc::new(ManualClock::new(100_000)), 1_000);
        for _ in 0..4 {
            assert_eq!(
                limiter.reserve(200, Duration::ZERO).await,
                Reservation::Reserved
            );
        }
        assert_eq!(limiter.current_usage().await.unwrap(), 800);
    }

    #[tokio::test]
    async fn test_interleaved_callers_admit_exactly_capacity() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(100_000));
        let limiter = yielding_limiter(clock, 5);
        let results = join_all((0..8).map(|_| limiter.reserve(1, Duration::ZERO))).await;

        let reserved = results
            .iter()
            .filter(|r| **r == Reservation::Reserved)
            .count();
        assert_eq!(reserved, 5);
        assert!(
            results
                .iter()
                .all(|r| matches!(r, Reservation::Reserved | Reservation::TimedOut { .. }))
        );
        assert_eq!(limiter.current_usage().await.unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_free_tokens_go_to_one_of_two_racing_callers() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(100_000));
        let limiter = yielding_limiter(clock, 5);
        assert_eq!(limiter.reserve(4, Duration::ZERO).await, Reservation::Reserved);

        let (a, b) = tokio::join!(
            limiter.reserve(1, Duration::from_secs(10)),
            limiter.reserve(1, Duration::from_secs(10))
        );
        let mut outcomes = [a, b];
        outcomes.sort_by_key(|r| *r != Reservation::Reserved);
        assert_eq!(
            outcomes,
            [Reservation::Reserved, Reservation::TimedOut { usage: 5 }]
        );
        assert_eq!(limiter.current_usage().await.unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_times_out_when_window_stays_full() {
        let limiter = limiter(Arc::new(ManualClock::new(100_000)), 10);
        assert_eq!(limiter.reserve(8, Duration::ZERO).await, Reservation::Reserved);

        let started = Instant::now();
        let outcome = limiter.reserve(5, Duration::from_secs(3)).await;
        assert_eq!(outcome, Reservation::TimedOut { usage: 8 });
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(!outcome.is_admitted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_succeeds_once_old_entries_leave_the_window() {
        let clock: Arc<dyn Clock> = Arc::new(PausedClock::starting_at(500_000));
        let limiter = limiter(clock, 10);
        assert_eq!(limiter.reserve(8, Duration::ZERO).await, Reservation::Reserved);

        let started = Instant::now();
        assert_eq!(
            limiter.reserve(5, Duration::from_secs(90)).await,
            Reservation::Reserved
        );
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(60));
        assert!(waited < Duration::from_secs(66));
    }

    #[tokio::test]
    async fn test_oversized_request_is_admitted() {
        let limiter = limiter(Arc::new(ManualClock::new(0)), 100);
        assert_eq!(
            limiter.reserve(500, Duration::ZERO).await,
            Reservation::Oversized
        );
        assert_eq!(limiter.current_usage().await.unwrap(), 500);
    }

    #[tokio::test]
    async fn test_check_available_estimates_wait() {
        let clock = Arc::new(ManualClock::new(10_000));
        let limiter = limiter(clock.clone(), 10);
        limiter.reserve(6, Duration::ZERO).await;
        clock.advance(20_000);
        limiter.reserve(4, Duration::ZERO).await;

        let availability = limiter.check_available(3).await.unwrap();
        assert_eq!(availability.usage, 10);
        assert_eq!(availability.wait, Duration::from_secs(40));

        let free = limiter.check_available(0).await.unwrap();
        assert_eq!(free.wait, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_store_failure_is_unmetered() {
        let limiter = TokenRateLimiter::new(
            Arc::new(BrokenStore),
            Arc::new(ManualClock::new(0)),
            "t",
            10,
            Duration::from_secs(60),
        );
        let outcome = limiter.reserve(1, Duration::from_secs(1)).await;
        assert_eq!(outcome, Reservation::Unmetered);
        assert!(outcome.is_admitted());
    }
}
