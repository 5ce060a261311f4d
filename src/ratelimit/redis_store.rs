// src/ratelimit/redis_store.rs

//! Redis-backed counter store shared across processes.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use crate::error::{AppError, Result};
use crate::ratelimit::{CounterStore, ScoredEntry, WindowAdmission};

/// Purge, sum member weights, then add if the window has room. Returns the
/// usage before the add, negated when the add was refused.
const ADD_WITHIN: &str = r"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
local usage = 0
for _, member in ipairs(redis.call('ZRANGE', KEYS[1], 0, -1)) do
    usage = usage + (tonumber(string.match(member, ':(%d+)$')) or 0)
end
local weight = tonumber(string.match(ARGV[4], ':(%d+)$')) or 0
if usage + weight > tonumber(ARGV[2]) then
    return -usage - 1
end
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[4])
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return usage
";

/// Counter store over one multiplexed Redis connection.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: MultiplexedConnection,
}

impl RedisCounterStore {
    /// Connect to `redis_url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(AppError::store)?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::store)?;
        log::info!("Connected to shared counter store at {}", redis_url);
        Ok(Self { connection })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr(&self, key: &str) -> Result<u64> {
        let mut conn = self.connection.clone();
        let value: u64 = redis::cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(AppError::store)?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(AppError::store)?;
        Ok(())
    }

    async fn add_entry(&self, key: &str, member: &str, score: u64) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(AppError::store)?;
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
        let mut conn = self.connection.clone();
        let reply: i64 = redis::Script::new(ADD_WITHIN)
            .key(key)
            .arg(window_start)
            .arg(capacity)
            .arg(entry.score)
            .arg(&entry.member)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(AppError::store)?;
        if reply < 0 {
            return Ok(WindowAdmission::Full {
                usage: (-reply - 1) as u64,
            });
        }
        Ok(WindowAdmission::Added)
    }

    async fn entries(&self, key: &str, min: u64, max: u64) -> Result<Vec<ScoredEntry>> {
        let mut conn = self.connection.clone();
        let raw: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(AppError::store)?;
        Ok(raw
            .into_iter()
            .map(|(member, score)| ScoredEntry {
                member,
                score: score as u64,
            })
            .collect())
    }

    async fn purge_before(&self, key: &str, score: u64) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: i64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(format!("({score}"))
            .query_async(&mut conn)
            .await
            .map_err(AppError::store)?;
        Ok(())
    }
}
