//! In-process buckets behind one mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use eventdesk_core::Clock;

use super::{RateLimitBackend, RateLimitDecision, RateLimitError, validate};

#[derive(Debug, Clone)]
struct Bucket {
    window_start: DateTime<Utc>,
    window: Duration,
    count: u32,
}

impl Bucket {
    fn reset_at(&self) -> DateTime<Utc> {
        self.window_start + self.window
    }
}

#[derive(Debug)]
pub struct LocalRateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    clock: Arc<dyn Clock>,
}

impl LocalRateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Admit one request for `key` if the window has room.
    pub fn check(
        &self,
        key: &str,
        limit: u32,
        window_secs: u64,
    ) -> Result<RateLimitDecision, RateLimitError> {
        validate(limit, window_secs)?;
        let window = i64::try_from(window_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or_else(|| RateLimitError::Validation("window is too large".into()))?;
        let now = self.clock.now();

        // A poisoned map only ever holds plain counters; keep using it.
        let mut buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            window_start: now,
            window,
            count: 0,
        });

        if now >= bucket.reset_at() || bucket.window != window {
            bucket.window_start = now;
            bucket.window = window;
            bucket.count = 0;
        }

        let allowed = bucket.count < limit;
        if allowed {
            bucket.count += 1;
        }

        Ok(RateLimitDecision {
            allowed,
            remaining: limit.saturating_sub(bucket.count),
            reset_at: bucket.reset_at(),
        })
    }

    /// Drop buckets more than three windows past their anchor. Returns how many.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
        let before = buckets.len();
        buckets.retain(|_, b| now - b.window_start <= b.window * 3);
        before - buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RateLimitBackend for LocalRateLimiter {
    async fn admit(
        &self,
        key: &str,
        limit: u32,
        window_secs: u64,
    ) -> Result<RateLimitDecision, RateLimitError> {
        self.check(key, limit, window_secs)
    }
}
