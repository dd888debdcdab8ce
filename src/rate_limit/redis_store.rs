//! Redis-backed counter store.
//!
//! A Lua script performs `INCRBY`, sets `PEXPIRE` only when the increment
//! created the key, and reads `PTTL`, all in one atomic server-side step. A
//! key that somehow lost its expiry gets one again so a window can never
//! become permanent.

use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use tracing::info;

use super::store::{CounterSnapshot, CounterStore, StoreError};
use crate::clock::duration_millis;

/// Prefix for every counter key written by this service.
pub const KEY_PREFIX: &str = "rl:";

const INCREMENT_SCRIPT: &str = r"
local current = redis.call('INCRBY', KEYS[1], ARGV[1])
if current == tonumber(ARGV[1]) then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  ttl = tonumber(ARGV[2])
end
return {current, ttl}
";

/// Counter store shared by every instance through Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    script: Script,
}

impl RedisCounterStore {
    /// Connect to Redis. The connection manager reconnects on its own.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the URL is invalid or the
    /// initial connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Unavailable(format!("invalid Redis URL: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to connect to Redis: {e}")))?;

        info!("Connected to Redis counter store");
        Ok(Self {
            conn,
            script: Script::new(INCREMENT_SCRIPT),
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(
        &self,
        key: &str,
        points: u32,
        ttl: Duration,
    ) -> Result<CounterSnapshot, StoreError> {
        let mut conn = self.conn.clone();
        let ttl_ms = duration_millis(ttl).max(1);

        let (count, pttl): (i64, i64) = self
            .script
            .key(format!("{KEY_PREFIX}{key}"))
            .arg(points)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let count = u64::try_from(count)
            .map_err(|_| StoreError::Backend(format!("negative counter value {count}")))?;
        let ttl_remaining = Duration::from_millis(u64::try_from(pttl).unwrap_or(ttl_ms));

        Ok(CounterSnapshot {
            count,
            ttl_remaining,
        })
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore").finish_non_exhaustive()
    }
}
