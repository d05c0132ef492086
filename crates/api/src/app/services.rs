//! Service wiring: picks in-memory or persistent backends from config and
//! owns the background tasks they need.

use std::sync::{Arc, Mutex};

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use eventdesk_core::{Clock, SystemClock};
use eventdesk_infra::config::{AppConfig, RateLimitConfig};
use eventdesk_infra::jobs::{
    JobArchiveError, JobExecutor, JobService, PostgresJobArchive, StatusStreamer, TracingNotifier,
};
use eventdesk_infra::{
    CheckpointLedger, InMemoryCheckpointLedger, LedgerError, LocalRateLimiter,
    PostgresCheckpointLedger, RateLimiter,
};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to connect to Postgres: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to prepare ledger schema: {0}")]
    Ledger(#[from] LedgerError),
    #[error("failed to prepare job archive schema: {0}")]
    Archive(#[from] JobArchiveError),
    #[error("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")]
    MissingDatabaseUrl,
}

/// Everything the handlers need, shared behind one `Arc`.
#[derive(Debug)]
pub struct AppServices {
    pub jobs: Arc<JobService>,
    pub streamer: StatusStreamer,
    pub ledger: Arc<dyn CheckpointLedger>,
    pub rate_limiter: RateLimiter,
    pub limits: RateLimitConfig,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl AppServices {
    /// In-memory wiring around a caller-provided ledger.
    pub fn in_memory(config: &AppConfig, ledger: Arc<dyn CheckpointLedger>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let executor = JobExecutor::new(Arc::new(TracingNotifier::new()), clock.clone());
        let jobs = JobService::new(executor, clock.clone(), config.jobs.clone());
        let rate_limiter = RateLimiter::local(Arc::new(LocalRateLimiter::new(clock)));
        Self::assemble(config, jobs, ledger, rate_limiter)
    }

    fn assemble(
        config: &AppConfig,
        jobs: JobService,
        ledger: Arc<dyn CheckpointLedger>,
        rate_limiter: RateLimiter,
    ) -> Self {
        let jobs = Arc::new(jobs);
        let streamer = StatusStreamer::new(jobs.clone(), config.stream.heartbeat);
        Self {
            jobs,
            streamer,
            ledger,
            rate_limiter,
            limits: config.rate_limit.clone(),
            background: Mutex::new(Vec::new()),
        }
    }

    /// Start retention and bucket sweepers. Requires a tokio runtime.
    pub fn start_background_tasks(&self) {
        self.jobs.start_sweeper();
        let handle = self.rate_limiter.start_sweeper(self.limits.sweep_interval);
        if let Ok(mut background) = self.background.lock() {
            background.push(handle);
        }
    }

    pub async fn shutdown(&self) {
        if let Ok(mut background) = self.background.lock() {
            for handle in background.drain(..) {
                handle.abort();
            }
        }
        self.jobs.shutdown().await;
    }
}

pub async fn build_services(config: &AppConfig) -> Result<AppServices, StartupError> {
    let services = if config.storage.use_persistent_stores {
        build_persistent_services(config).await?
    } else {
        info!("using in-memory stores");
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        AppServices::in_memory(config, Arc::new(InMemoryCheckpointLedger::new(clock)))
    };
    services.start_background_tasks();
    Ok(services)
}

async fn build_persistent_services(config: &AppConfig) -> Result<AppServices, StartupError> {
    let database_url = config
        .storage
        .database_url
        .as_deref()
        .ok_or(StartupError::MissingDatabaseUrl)?;

    let pool = PgPool::connect(database_url).await?;

    let ledger = PostgresCheckpointLedger::new(pool.clone());
    ledger.ensure_schema().await?;
    let archive = PostgresJobArchive::new(pool);
    archive.ensure_schema().await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let executor = JobExecutor::new(Arc::new(TracingNotifier::new()), clock.clone());
    let jobs = JobService::new(executor, clock.clone(), config.jobs.clone())
        .with_archive(Arc::new(archive));

    let rate_limiter = RateLimiter::local(Arc::new(LocalRateLimiter::new(clock)));
    let rate_limiter = attach_shared_rate_limiter(rate_limiter, config).await;

    info!("using Postgres-backed ledger and job archive");
    Ok(AppServices::assemble(config, jobs, Arc::new(ledger), rate_limiter))
}

#[cfg(feature = "redis")]
async fn attach_shared_rate_limiter(limiter: RateLimiter, config: &AppConfig) -> RateLimiter {
    let Some(redis_url) = config.storage.redis_url.as_deref() else {
        return limiter;
    };
    match eventdesk_infra::rate_limit::RedisRateLimiter::connect(redis_url).await {
        Ok(redis) => {
            info!("rate limits shared through Redis");
            limiter.with_remote(Arc::new(redis))
        }
        Err(err) => {
            warn!(error = %err, "Redis unavailable; rate limits are per-instance");
            limiter
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn attach_shared_rate_limiter(limiter: RateLimiter, config: &AppConfig) -> RateLimiter {
    if config.storage.redis_url.is_some() {
        warn!("REDIS_URL is set but the `redis` feature is disabled; rate limits are per-instance");
    }
    limiter
}
