//! Background jobs for bulk per-recipient work.
//!
//! ## Components
//!
//! - `Job`: state, counters and per-item outcomes
//! - `InMemoryJobStore` / `JobSlot`: registry with a cancel flag and a
//!   broadcast bus per job
//! - `JobExecutor`: drives a job through an `ItemProcessor`
//! - `JobService`: create, cancel, retry-failed, lookup, retention
//! - `StatusStreamer`: snapshot-then-events frames for live status
//! - `JobArchive`: optional home for terminal snapshots

pub mod archive;
pub mod events;
pub mod executor;
pub mod service;
pub mod store;
pub mod stream;
pub mod types;

pub use archive::{InMemoryJobArchive, JobArchive, JobArchiveError, PostgresJobArchive};
pub use events::{JobEvent, JobEventKind, JobSubscription};
pub use executor::{ItemProcessor, JobExecutor, TracingNotifier};
pub use service::{JobError, JobService};
pub use store::{InMemoryJobStore, JobSlot, JobStoreError};
pub use stream::{StatusStreamer, StreamFrame};
pub use types::{ItemOutcome, Job, JobId, JobKind, JobStatus};
