//! Redis-backed window store.
//!
//! Each limiter identity is one sorted set whose scores are admission
//! timestamps in milliseconds. Evaluation runs as a Lua script so that no
//! other client can interleave between the prune, the count and the insert.

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{RedisError, Script};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use super::{EvaluateRequest, Evaluation, StoreError, WindowEntry, WindowStore};

/// KEYS[1] = window key
/// ARGV = now, window, limit, amount, member prefix
///
/// Returns `{1, remaining}` on grant, `{0, oldest}` on denial (`oldest` is
/// -1 when the window is empty).
const EVALUATE_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local amount = tonumber(ARGV[4])
local member = ARGV[5]

redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. (now - window))
local current = redis.call('ZCARD', key)

if current + amount <= limit then
    for i = 1, amount do
        redis.call('ZADD', key, now, member .. i)
    end
    redis.call('PEXPIRE', key, window)
    return {1, limit - current - amount}
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
    return {0, tonumber(oldest[2])}
end
return {0, -1}
"#;

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

/// A window store living in Redis.
///
/// Cloning is cheap; clones share one multiplexed connection that
/// reconnects on its own after failures.
#[derive(Clone)]
pub struct RedisWindowStore {
    conn: ConnectionManager,
    script: Arc<Script>,
}

impl std::fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWindowStore")
            .field("script_hash", &self.script.get_hash())
            .finish()
    }
}

impl RedisWindowStore {
    /// Connect to the Redis server at `url`.
    ///
    /// Every command, and every connection attempt, fails with a connection
    /// error once `operation_timeout` passes without a reply.
    pub async fn connect(url: &str, operation_timeout: Duration) -> Result<Self, StoreError> {
        info!(
            url = %url,
            timeout_ms = operation_timeout.as_millis() as u64,
            "Connecting to Redis window store"
        );

        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new_with_config(client, Self::manager_config(operation_timeout))
            .await?;

        Ok(Self::with_connection(conn))
    }

    fn manager_config(operation_timeout: Duration) -> ConnectionManagerConfig {
        ConnectionManagerConfig::new()
            .set_response_timeout(operation_timeout)
            .set_connection_timeout(operation_timeout)
    }

    /// Wrap an existing connection manager.
    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            script: Arc::new(Script::new(EVALUATE_SCRIPT)),
        }
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn evaluate(&self, request: &EvaluateRequest<'_>) -> Result<Evaluation, StoreError> {
        let mut conn = self.conn.clone();

        // EVALSHA, falling back to EVAL when the script cache was flushed.
        let reply: Vec<i64> = self
            .script
            .key(request.key)
            .arg(request.now_millis)
            .arg(request.window_millis)
            .arg(request.limit)
            .arg(request.amount)
            .arg(request.member_prefix)
            .invoke_async(&mut conn)
            .await?;

        trace!(key = %request.key, reply = ?reply, "Evaluated window script");

        match reply.as_slice() {
            [1, remaining] => Ok(Evaluation::Granted {
                remaining: (*remaining).max(0) as u64,
            }),
            [0, oldest] => Ok(Evaluation::Denied {
                oldest_millis: (*oldest >= 0).then_some(*oldest as u64),
            }),
            other => Err(StoreError::Protocol(format!(
                "evaluate script returned {:?}",
                other
            ))),
        }
    }

    async fn count(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count: u64 = redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn leak(&self, key: &str, threshold_millis: i64) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(format!("({}", threshold_millis))
            .query_async(&mut conn)
            .await?;

        debug!(key = %key, removed = removed, "Leaked expired window entries");
        Ok(removed)
    }

    async fn peek(&self, key: &str, index: usize) -> Result<Option<WindowEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let position = -1 - index as i64;
        let items: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(position)
            .arg(position)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;

        Ok(items.into_iter().next().map(|(member, score)| WindowEntry {
            member,
            timestamp_millis: score as u64,
        }))
    }
}
