//! Per-key admission control over fixed windows anchored at first use.
//!
//! `RateLimiter` prefers a shared backend (Redis) so limits hold across
//! instances, and falls back to the in-process `LocalRateLimiter` whenever
//! the shared backend errors. The fallback is logged, never surfaced.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub mod local;
#[cfg(feature = "redis")]
pub mod redis;

pub use local::LocalRateLimiter;
#[cfg(feature = "redis")]
pub use redis::RedisRateLimiter;

/// Result of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Admissions left in the current window.
    pub remaining: u32,
    /// When the current window ends.
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("invalid rate limit: {0}")]
    Validation(String),
    #[error("rate limit backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait RateLimitBackend: Send + Sync + std::fmt::Debug {
    /// Count one admission for `key` unless the window is exhausted.
    ///
    /// Denied attempts do not count.
    async fn admit(
        &self,
        key: &str,
        limit: u32,
        window_secs: u64,
    ) -> Result<RateLimitDecision, RateLimitError>;
}

pub(crate) fn validate(limit: u32, window_secs: u64) -> Result<(), RateLimitError> {
    if limit == 0 {
        return Err(RateLimitError::Validation("limit must be at least 1".into()));
    }
    if window_secs == 0 {
        return Err(RateLimitError::Validation(
            "window must be at least one second".into(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    remote: Option<Arc<dyn RateLimitBackend>>,
    local: Arc<LocalRateLimiter>,
}

impl RateLimiter {
    pub fn local(local: Arc<LocalRateLimiter>) -> Self {
        Self {
            remote: None,
            local,
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn RateLimitBackend>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub async fn admit(
        &self,
        key: &str,
        limit: u32,
        window_secs: u64,
    ) -> Result<RateLimitDecision, RateLimitError> {
        validate(limit, window_secs)?;

        if let Some(remote) = &self.remote {
            match remote.admit(key, limit, window_secs).await {
                Ok(decision) => return Ok(decision),
                Err(err) => {
                    warn!(key, error = %err, "shared rate limiter unavailable; using local buckets");
                }
            }
        }

        self.local.check(key, limit, window_secs)
    }

    /// Periodically reclaim idle local buckets.
    pub fn start_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let local = self.local.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reclaimed = local.sweep();
                if reclaimed > 0 {
                    debug!(reclaimed, "idle rate limit buckets reclaimed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventdesk_core::SystemClock;

    #[derive(Debug)]
    struct Unreachable;

    #[async_trait]
    impl RateLimitBackend for Unreachable {
        async fn admit(&self, _: &str, _: u32, _: u64) -> Result<RateLimitDecision, RateLimitError> {
            Err(RateLimitError::Backend("connection refused".into()))
        }
    }

    fn limiter() -> RateLimiter {
        RateLimiter::local(Arc::new(LocalRateLimiter::new(Arc::new(SystemClock))))
    }

    #[tokio::test]
    async fn falls_back_to_local_buckets_when_remote_fails() {
        let limiter = limiter().with_remote(Arc::new(Unreachable));

        let first = limiter.admit("admin:7:bulk-notify", 1, 60).await.unwrap();
        let second = limiter.admit("admin:7:bulk-notify", 1, 60).await.unwrap();

        assert!(first.allowed);
        assert!(!second.allowed);
    }

    #[tokio::test]
    async fn zero_limit_or_window_is_rejected() {
        let limiter = limiter();
        assert!(matches!(
            limiter.admit("k", 0, 60).await,
            Err(RateLimitError::Validation(_))
        ));
        assert!(matches!(
            limiter.admit("k", 1, 0).await,
            Err(RateLimitError::Validation(_))
        ));
    }
}
