//! Environment-driven configuration.
//!
//! Every knob has a default so a bare `cargo run` starts an in-memory
//! instance. Malformed values are rejected rather than silently replaced.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

pub use eventdesk_observability::LogFormat;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StorageConfig {
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobsConfig {
    /// Items processed in parallel within one job.
    pub concurrency: usize,
    /// How long a terminal job stays in memory.
    pub retention: Duration,
    pub sweep_interval: Duration,
    /// Per-job broadcast capacity.
    pub event_buffer: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            retention: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub heartbeat: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub bulk_notify_limit: u32,
    pub bulk_notify_window_secs: u64,
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            bulk_notify_limit: 5,
            bulk_notify_window_secs: 60,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub jobs: JobsConfig,
    pub stream: StreamConfig,
    pub rate_limit: RateLimitConfig,
    pub log_format: LogFormat,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            },
            storage: StorageConfig::default(),
            jobs: JobsConfig::default(),
            stream: StreamConfig::default(),
            rate_limit: RateLimitConfig::default(),
            log_format: LogFormat::default(),
        }
    }
}

impl AppConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let storage = StorageConfig {
            use_persistent_stores: parse_or(&get, "USE_PERSISTENT_STORES", false)?,
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL"),
        };
        if storage.use_persistent_stores && storage.database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let jobs = JobsConfig {
            concurrency: positive(&get, "JOB_CONCURRENCY", defaults.jobs.concurrency)?,
            retention: secs(&get, "JOB_RETENTION_SECS", defaults.jobs.retention)?,
            sweep_interval: secs(&get, "JOB_SWEEP_INTERVAL_SECS", defaults.jobs.sweep_interval)?,
            event_buffer: positive(&get, "JOB_EVENT_BUFFER", defaults.jobs.event_buffer)?,
        };

        let rate_limit = RateLimitConfig {
            bulk_notify_limit: positive(
                &get,
                "BULK_NOTIFY_LIMIT",
                defaults.rate_limit.bulk_notify_limit,
            )?,
            bulk_notify_window_secs: positive(
                &get,
                "BULK_NOTIFY_WINDOW_SECS",
                defaults.rate_limit.bulk_notify_window_secs,
            )?,
            sweep_interval: secs(
                &get,
                "RATE_LIMIT_SWEEP_SECS",
                defaults.rate_limit.sweep_interval,
            )?,
        };

        Ok(Self {
            server: ServerConfig {
                bind_addr: parse_or(&get, "BIND_ADDR", defaults.server.bind_addr)?,
            },
            storage,
            jobs,
            stream: StreamConfig {
                heartbeat: secs(&get, "STREAM_HEARTBEAT_SECS", defaults.stream.heartbeat)?,
            },
            rate_limit,
            log_format: parse_or(&get, "LOG_FORMAT", defaults.log_format)?,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn positive<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    let value = parse_or(get, key, default)?;
    if value == T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: "0".into(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(value)
}

fn secs<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    positive(get, key, default.as_secs()).map(Duration::from_secs)
}
