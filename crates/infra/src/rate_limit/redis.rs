//! Shared buckets in Redis.
//!
//! The whole check-and-increment runs as one Lua script, so concurrent
//! admissions from any number of instances serialize on the key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::ConnectionManager;

use super::{RateLimitBackend, RateLimitDecision, RateLimitError, validate};

const KEY_PREFIX: &str = "eventdesk:ratelimit:";

/// Returns `{allowed, remaining, reset_at_ms}`.
fn anchored_window() -> Script {
    Script::new(
        r#"
        local key = KEYS[1]
        local now = tonumber(ARGV[1])
        local window = tonumber(ARGV[2])
        local limit = tonumber(ARGV[3])

        local bucket = redis.call('HMGET', key, 'start', 'count')
        local start = tonumber(bucket[1])
        local count = tonumber(bucket[2]) or 0

        if start == nil or now - start >= window then
            start = now
            count = 0
        end

        if count < limit then
            count = count + 1
            redis.call('HSET', key, 'start', start, 'count', count)
            redis.call('PEXPIRE', key, start + window - now)
            return {1, limit - count, start + window}
        end

        return {0, 0, start + window}
        "#,
    )
}

#[derive(Clone)]
pub struct RedisRateLimiter {
    conn: ConnectionManager,
    script: Script,
}

impl std::fmt::Debug for RedisRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRateLimiter").finish_non_exhaustive()
    }
}

impl RedisRateLimiter {
    pub async fn connect(redis_url: &str) -> Result<Self, RateLimitError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| RateLimitError::Backend(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| RateLimitError::Backend(e.to_string()))?;
        Ok(Self {
            conn,
            script: anchored_window(),
        })
    }
}

#[async_trait]
impl RateLimitBackend for RedisRateLimiter {
    async fn admit(
        &self,
        key: &str,
        limit: u32,
        window_secs: u64,
    ) -> Result<RateLimitDecision, RateLimitError> {
        validate(limit, window_secs)?;

        let now_ms = Utc::now().timestamp_millis();
        let window_ms = window_secs.saturating_mul(1000);
        let mut conn = self.conn.clone();

        let reply: Vec<i64> = self
            .script
            .key(format!("{KEY_PREFIX}{key}"))
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RateLimitError::Backend(e.to_string()))?;

        let &[allowed, remaining, reset_ms] = reply.as_slice() else {
            return Err(RateLimitError::Backend(format!(
                "unexpected script reply: {reply:?}"
            )));
        };
        let reset_at = DateTime::from_timestamp_millis(reset_ms)
            .ok_or_else(|| RateLimitError::Backend(format!("bad reset timestamp {reset_ms}")))?;

        Ok(RateLimitDecision {
            allowed: allowed == 1,
            remaining: u32::try_from(remaining).unwrap_or(0),
            reset_at,
        })
    }
}
