//! Core job types and the job state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Job kind; determines the item schema and retry semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    /// Per-recipient notification dispatch. Items are recipient addresses.
    #[serde(rename = "bulk-notify")]
    BulkNotify,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::BulkNotify => "bulk-notify",
        }
    }

    /// Whether a job of this kind can spawn a retry of its failed subset.
    pub fn supports_retry_failed(&self) -> bool {
        matches!(self, JobKind::BulkNotify)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bulk-notify" => Ok(JobKind::BulkNotify),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// Job execution status.
///
/// `queued -> running -> {completed | failed | canceled}`; nothing leaves a
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    /// Every item was attempted (individual items may still have failed).
    Completed,
    /// A run-level fault aborted the job before all items were attempted.
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

/// Outcome of a single item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub target: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemOutcome {
    pub fn succeeded(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ok: true,
            error: None,
        }
    }

    pub fn failed(target: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// A tracked unit of asynchronous bulk work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Outcomes in processing order; append-only while running.
    pub items: Vec<ItemOutcome>,
    /// Targets the job was created with.
    pub targets: Vec<String>,
    /// Opaque data shared by every item (e.g. message subject/template ref).
    pub payload: serde_json::Value,
    /// Run-level fault message, set when the job ends `failed`.
    pub error: Option<String>,
    /// Bumped on every mutation; carried by every published event.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub parent_job_id: Option<JobId>,
}

impl Job {
    /// Create a new queued job.
    pub fn new(kind: JobKind, targets: Vec<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            kind,
            status: JobStatus::Queued,
            total: targets.len() as u64,
            processed: 0,
            succeeded: 0,
            failed: 0,
            items: Vec::with_capacity(targets.len()),
            targets,
            payload,
            error: None,
            version: 0,
            created_at: now,
            updated_at: now,
            canceled_at: None,
            finished_at: None,
            parent_job_id: None,
        }
    }

    /// Mark this job as the retry of another job's failures.
    pub fn with_parent(mut self, parent: JobId) -> Self {
        self.parent_job_id = Some(parent);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Targets whose outcome was a failure, in processing order.
    pub fn failed_targets(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|i| !i.ok)
            .map(|i| i.target.clone())
            .collect()
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }

    /// `queued -> running`. Returns `false` (and changes nothing) from any other state.
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Queued {
            return false;
        }
        self.status = JobStatus::Running;
        self.touch(now);
        true
    }

    /// Append one item outcome and update counters.
    pub fn record_outcome(&mut self, outcome: ItemOutcome, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Running || self.processed >= self.total {
            return false;
        }
        self.processed += 1;
        if outcome.ok {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.items.push(outcome);
        self.touch(now);
        true
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> bool {
        self.finish(JobStatus::Completed, now)
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> bool {
        if !self.finish(JobStatus::Failed, now) {
            return false;
        }
        self.error = Some(error.into());
        true
    }

    pub fn mark_canceled(&mut self, now: DateTime<Utc>) -> bool {
        if !self.finish(JobStatus::Canceled, now) {
            return false;
        }
        self.canceled_at = Some(now);
        true
    }

    fn finish(&mut self, status: JobStatus, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        self.status = status;
        self.finished_at = Some(now);
        self.touch(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("user{i}@example.org")).collect()
    }

    #[test]
    fn job_lifecycle() {
        let mut job = Job::new(JobKind::BulkNotify, targets(2), serde_json::json!({}));
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.total, 2);

        let now = Utc::now();
        assert!(job.mark_running(now));
        assert!(job.record_outcome(ItemOutcome::succeeded("user1@example.org"), now));
        assert!(job.record_outcome(ItemOutcome::failed("user2@example.org", "bounced"), now));
        assert!(job.mark_completed(now));

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!((job.processed, job.succeeded, job.failed), (2, 1, 1));
        assert_eq!(job.failed_targets(), vec!["user2@example.org".to_string()]);
        assert_eq!(job.version, 4);
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn terminal_states_are_final() {
        let now = Utc::now();
        let mut job = Job::new(JobKind::BulkNotify, targets(1), serde_json::json!({}));
        job.mark_running(now);
        assert!(job.mark_canceled(now));
        let version = job.version;

        assert!(!job.mark_running(now));
        assert!(!job.mark_completed(now));
        assert!(!job.mark_failed("late", now));
        assert!(!job.record_outcome(ItemOutcome::succeeded("x"), now));
        assert_eq!(job.status, JobStatus::Canceled);
        assert_eq!(job.version, version);
        assert!(job.canceled_at.is_some());
    }

    #[test]
    fn queued_job_cannot_finish_without_running() {
        let mut job = Job::new(JobKind::BulkNotify, targets(1), serde_json::json!({}));
        assert!(!job.mark_completed(Utc::now()));
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn outcomes_never_exceed_total() {
        let now = Utc::now();
        let mut job = Job::new(JobKind::BulkNotify, targets(1), serde_json::json!({}));
        job.mark_running(now);
        assert!(job.record_outcome(ItemOutcome::succeeded("a"), now));
        assert!(!job.record_outcome(ItemOutcome::succeeded("b"), now));
        assert_eq!(job.processed, 1);
    }

    #[test]
    fn kind_and_status_use_wire_names() {
        assert_eq!(
            serde_json::to_value(JobKind::BulkNotify).unwrap(),
            serde_json::json!("bulk-notify")
        );
        assert_eq!(
            serde_json::to_value(JobStatus::Canceled).unwrap(),
            serde_json::json!("canceled")
        );
        assert_eq!("bulk-notify".parse::<JobKind>().unwrap(), JobKind::BulkNotify);
    }
}
