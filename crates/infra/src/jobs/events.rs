//! Per-job progress events and subscriptions.
//!
//! Each job owns a broadcast channel. Every subscriber gets its own copy of
//! each event (fan-out); a subscriber that falls behind loses events rather
//! than slowing the executor down, and is expected to re-read the job
//! snapshot (see `RecvError::Lagged`).
//!
//! Events are idempotent to re-apply: each carries the job `version` it
//! produced plus absolute counters, never deltas.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::types::{ItemOutcome, Job, JobId, JobStatus};

/// One incremental change to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub version: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: JobEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEventKind {
    Started {
        total: u64,
    },
    Progress {
        total: u64,
        processed: u64,
        succeeded: u64,
        failed: u64,
        item: ItemOutcome,
    },
    Finished {
        status: JobStatus,
        processed: u64,
        succeeded: u64,
        failed: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl JobEvent {
    pub(crate) fn started(job: &Job) -> Self {
        Self::from_job(job, JobEventKind::Started { total: job.total })
    }

    pub(crate) fn progress(job: &Job, item: ItemOutcome) -> Self {
        Self::from_job(
            job,
            JobEventKind::Progress {
                total: job.total,
                processed: job.processed,
                succeeded: job.succeeded,
                failed: job.failed,
                item,
            },
        )
    }

    pub(crate) fn finished(job: &Job) -> Self {
        Self::from_job(
            job,
            JobEventKind::Finished {
                status: job.status,
                processed: job.processed,
                succeeded: job.succeeded,
                failed: job.failed,
                error: job.error.clone(),
            },
        )
    }

    fn from_job(job: &Job, kind: JobEventKind) -> Self {
        Self {
            job_id: job.id,
            version: job.version,
            at: job.updated_at,
            kind,
        }
    }

    /// Whether this is the last event the job will ever publish.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, JobEventKind::Finished { .. })
    }
}

/// A live subscription to one job: the receiver was registered *before* the
/// snapshot was taken, so nothing newer than `snapshot.version` can be missed.
#[derive(Debug)]
pub struct JobSubscription {
    pub snapshot: Job,
    pub receiver: broadcast::Receiver<JobEvent>,
}
