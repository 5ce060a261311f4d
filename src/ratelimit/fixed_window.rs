// src/ratelimit/fixed_window.rs

//! Fixed-window request-rate limiter.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::ratelimit::{Clock, CounterStore};

/// Extra lifetime of a window key past its window end.
const EXPIRY_SLACK_MS: u64 = 100;

/// Result of a single admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admitted as the `count`th request of the window
    Admitted { count: u64 },
    /// Window full; the next one opens after `retry_after`
    Throttled { retry_after: Duration },
}

/// Outcome of [`FixedWindowLimiter::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Admitted { waited: Duration },
    /// The counter store failed and the request was let through
    FailedOpen,
}

/// Caps requests per window for one named bucket across all workers.
///
/// The counter key is `(bucket, window index)`; every caller increments it and
/// is admitted while the post-increment value stays within the limit. Keys
/// expire shortly after their window closes.
pub struct FixedWindowLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    bucket: String,
    limit: u64,
    window_ms: u64,
}

impl FixedWindowLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        bucket: impl Into<String>,
        limit: u64,
        window: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            bucket: bucket.into(),
            limit: limit.max(1),
            window_ms: (window.as_millis() as u64).max(1),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn key(&self, window_index: u64) -> String {
        format!("{}:{}", self.bucket, window_index)
    }

    /// Make one admission attempt. Store errors are returned to the caller.
    pub async fn try_acquire(&self) -> Result<Admission> {
        let now = self.clock.now_ms();
        let window_index = now / self.window_ms;
        let key = self.key(window_index);
        let next_window = (window_index + 1) * self.window_ms;

        let count = self.store.incr(&key).await?;
        // Set on every increment; the deadline is fixed per window.
        let expires_in = next_window + EXPIRY_SLACK_MS - now;
        self.store
            .expire(&key, Duration::from_millis(expires_in))
            .await?;

        if count <= self.limit {
            return Ok(Admission::Admitted { count });
        }
        Ok(Admission::Throttled {
            retry_after: Duration::from_millis(next_window.saturating_sub(now).max(1)),
        })
    }

    /// Wait until admitted, sleeping to each window boundary.
    ///
    /// Fails open: if the counter store errors the request is admitted.
    pub async fn acquire(&self) -> Acquired {
        let mut waited = Duration::ZERO;
        loop {
            match self.try_acquire().await {
                Ok(Admission::Admitted { .. }) => return Acquired::Admitted { waited },
                Ok(Admission::Throttled { retry_after }) => {
                    log::debug!(
                        "Rate bucket {} full, retrying in {:?}",
                        self.bucket,
                        retry_after
                    );
                    tokio::time::sleep(retry_after).await;
                    waited += retry_after;
                }
                Err(e) => {
                    log::warn!(
                        "Rate limiter for {} unavailable, admitting request: {}",
                        self.bucket,
                        e
                    );
                    return Acquired::FailedOpen;
                }
            }
        }
    }
}
