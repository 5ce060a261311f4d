// src/ratelimit/mod.rs

//! Distributed rate limiting over a shared counter store.
//!
//! - [`FixedWindowLimiter`]: requests per window for a paid fetch service
//! - [`TokenRateLimiter`]: model tokens in a trailing window
//!
//! Both limiters shape rate, they do not guarantee the downstream service will
//! accept a call. A degraded store never blocks callers.

mod clock;
mod fixed_window;
mod memory;
#[cfg(feature = "redis")]
mod redis_store;
mod sliding_window;
mod store;

use std::sync::Arc;
use std::time::Duration;

pub use clock::{Clock, ManualClock, SystemClock};
pub use fixed_window::{Acquired, Admission, FixedWindowLimiter};
pub use memory::MemoryCounterStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisCounterStore;
pub use sliding_window::{Availability, Reservation, TokenRateLimiter};
pub use store::{CounterStore, ScoredEntry, WindowAdmission};

use crate::models::RateLimitConfig;

/// Open the configured counter store, falling back to a process-local one.
pub async fn connect_store(
    config: &RateLimitConfig,
    clock: Arc<dyn Clock>,
) -> Arc<dyn CounterStore> {
    match &config.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => match RedisCounterStore::connect(url).await {
            Ok(store) => return Arc::new(store),
            Err(e) => log::warn!("Shared counter store unavailable, using local counters: {}", e),
        },
        #[cfg(not(feature = "redis"))]
        Some(_) => log::warn!(
            "rate_limit.redis_url is set but the redis feature is disabled, using local counters"
        ),
        None => log::debug!("No shared counter store configured, using local counters"),
    }
    Arc::new(MemoryCounterStore::new(clock))
}

/// Build the model token limiter, or `None` when the quota is disabled.
pub fn token_limiter(
    config: &RateLimitConfig,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    model: &str,
) -> Option<TokenRateLimiter> {
    if config.model_tokens_per_window == 0 {
        return None;
    }
    Some(TokenRateLimiter::new(
        store,
        clock,
        format!("{}:tokens:{}", config.key_prefix, model),
        config.model_tokens_per_window,
        Duration::from_secs(config.token_window_secs),
    ))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{Clock, CounterStore, MemoryCounterStore, ScoredEntry, WindowAdmission};
    use crate::error::{AppError, Result};

    /// Clock following tokio time, so paused-time tests can move it.
    pub struct PausedClock {
        base_ms: u64,
        started: tokio::time::Instant,
    }

    impl PausedClock {
        pub fn starting_at(base_ms: u64) -> Self {
            Self {
                base_ms,
                started: tokio::time::Instant::now(),
            }
        }
    }

    impl Clock for PausedClock {
        fn now_ms(&self) -> u64 {
            self.base_ms + self.started.elapsed().as_millis() as u64
        }
    }

    /// Memory store that yields to the scheduler before every call, so
    /// concurrent callers interleave between store operations.
    pub struct YieldingStore(pub MemoryCounterStore);

    impl YieldingStore {
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self(MemoryCounterStore::new(clock))
        }
    }

    #[async_trait]
    impl CounterStore for YieldingStore {
        async fn incr(&self, key: &str) -> Result<u64> {
            tokio::task::yield_now().await;
            self.0.incr(key).await
        }
        async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
            tokio::task::yield_now().await;
            self.0.expire(key, ttl).await
        }
        async fn add_entry(&self, key: &str, member: &str, score: u64) -> Result<()> {
            tokio::task::yield_now().await;
            self.0.add_entry(key, member, score).await
        }
        async fn add_within(
            &self,
            key: &str,
            entry: &ScoredEntry,
            window_start: u64,
            capacity: u64,
            ttl: Duration,
        ) -> Result<WindowAdmission> {
            tokio::task::yield_now().await;
            self.0
                .add_within(key, entry, window_start, capacity, ttl)
                .await
        }
        async fn entries(&self, key: &str, min: u64, max: u64) -> Result<Vec<ScoredEntry>> {
            tokio::task::yield_now().await;
            self.0.entries(key, min, max).await
        }
        async fn purge_before(&self, key: &str, score: u64) -> Result<()> {
            tokio::task::yield_now().await;
            self.0.purge_before(key, score).await
        }
    }

    /// Store whose every call fails.
    pub struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn incr(&self, _key: &str) -> Result<u64> {
            Err(AppError::store("connection refused"))
        }
        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<()> {
            Err(AppError::store("connection refused"))
        }
        async fn add_entry(&self, _key: &str, _member: &str, _score: u64) -> Result<()> {
            Err(AppError::store("connection refused"))
        }
        async fn add_within(
            &self,
            _key: &str,
            _entry: &ScoredEntry,
            _window_start: u64,
            _capacity: u64,
            _ttl: Duration,
        ) -> Result<WindowAdmission> {
            Err(AppError::store("connection refused"))
        }
        async fn entries(&self, _key: &str, _min: u64, _max: u64) -> Result<Vec<ScoredEntry>> {
            Err(AppError::store("connection refused"))
        }
        async fn purge_before(&self, _key: &str, _score: u64) -> Result<()> {
            Err(AppError::store("connection refused"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_store_without_url_is_local() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let store = connect_store(&RateLimitConfig::default(), clock.clone()).await;
        assert_eq!(store.incr("k").await.unwrap(), 1);
    }

    #[test]
    fn test_token_limiter_disabled_by_zero_quota() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new(clock.clone()));
        let config = RateLimitConfig {
            model_tokens_per_window: 0,
            ..RateLimitConfig::default()
        };
        assert!(token_limiter(&config, store.clone(), clock.clone(), "m").is_none());
        let enabled = token_limiter(&RateLimitConfig::default(), store, clock, "m");
        assert_eq!(enabled.map(|l| l.capacity()), Some(1_000_000));
    }
}
