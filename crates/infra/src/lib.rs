//! Infrastructure layer: job engine, attendance ledger storage, rate
//! limiting and configuration.

pub mod checkpoints;
pub mod config;
pub mod jobs;
pub mod rate_limit;

pub use checkpoints::{
    CheckpointLedger, InMemoryCheckpointLedger, LedgerError, PostgresCheckpointLedger,
};
pub use config::{AppConfig, ConfigError, LogFormat};
pub use rate_limit::{LocalRateLimiter, RateLimitDecision, RateLimitError, RateLimiter};
