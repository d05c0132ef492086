//! Job service: the one owner of the job registry.
//!
//! Constructed once at startup and shared behind an `Arc`. Creating a job
//! registers it and spawns its executor on the runtime; everything else is
//! a read or a cooperative signal.

use std::sync::{Arc, Mutex};

use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use eventdesk_core::Clock;

use super::archive::{JobArchive, JobArchiveError};
use super::events::JobSubscription;
use super::executor::JobExecutor;
use super::store::{InMemoryJobStore, JobSlot, JobStoreError};
use super::types::{Job, JobId, JobKind};
use crate::config::JobsConfig;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("{0}")]
    Validation(String),
    #[error("job {0} has not finished yet")]
    NotTerminal(JobId),
    #[error("job kind {0} does not support retrying failed items")]
    RetryUnsupported(JobKind),
    #[error("job service is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Archive(#[from] JobArchiveError),
}

#[derive(Debug)]
pub struct JobService {
    store: Arc<InMemoryJobStore>,
    executor: JobExecutor,
    archive: Option<Arc<dyn JobArchive>>,
    clock: Arc<dyn Clock>,
    config: JobsConfig,
    running: Mutex<Option<JoinSet<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl JobService {
    pub fn new(executor: JobExecutor, clock: Arc<dyn Clock>, config: JobsConfig) -> Self {
        let executor = executor.with_concurrency(config.concurrency);
        Self {
            store: InMemoryJobStore::arc(config.event_buffer),
            executor,
            archive: None,
            clock,
            config,
            running: Mutex::new(Some(JoinSet::new())),
            sweeper: Mutex::new(None),
        }
    }

    /// Write terminal snapshots to `archive` and consult it on lookups.
    pub fn with_archive(mut self, archive: Arc<dyn JobArchive>) -> Self {
        self.executor = self.executor.with_archive(archive.clone());
        self.archive = Some(archive);
        self
    }

    pub fn store(&self) -> &Arc<InMemoryJobStore> {
        &self.store
    }

    /// Register a queued job and start executing it in the background.
    pub fn create_job(
        &self,
        kind: JobKind,
        targets: Vec<String>,
        payload: serde_json::Value,
    ) -> Result<JobId, JobError> {
        self.launch(Job::new(kind, targets, payload))
    }

    fn launch(&self, job: Job) -> Result<JobId, JobError> {
        if job.targets.is_empty() {
            return Err(JobError::Validation("targets must not be empty".into()));
        }
        if job.targets.iter().any(|t| t.trim().is_empty()) {
            return Err(JobError::Validation("targets must not contain blank entries".into()));
        }

        let mut running = self.running.lock().map_err(|_| JobStoreError::Poisoned)?;
        let Some(tasks) = running.as_mut() else {
            return Err(JobError::ShuttingDown);
        };
        // Reap finished runs so the set does not grow without bound.
        while tasks.try_join_next().is_some() {}

        let id = job.id;
        let kind = job.kind;
        let total = job.total;
        let parent = job.parent_job_id;
        let slot = self.store.insert(job)?;
        let executor = self.executor.clone();
        tasks.spawn(async move {
            executor.run(slot).await;
        });

        info!(
            job_id = %id,
            kind = kind.as_str(),
            total,
            parent_job_id = parent.map(|p| p.to_string()),
            "job created"
        );
        Ok(id)
    }

    /// Snapshot from the in-memory registry only.
    pub fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobError> {
        Ok(self.store.get(job_id)?)
    }

    /// Registry first, then the archive (if configured).
    pub async fn get_job_async(&self, job_id: JobId) -> Result<Option<Job>, JobError> {
        if let Some(job) = self.store.get(job_id)? {
            return Ok(Some(job));
        }
        match &self.archive {
            Some(archive) => Ok(archive.load(job_id).await?),
            None => Ok(None),
        }
    }

    /// Jobs still held in memory, newest first.
    pub fn list_jobs(&self) -> Result<Vec<Job>, JobError> {
        Ok(self.store.list()?)
    }

    /// Ask a job to stop. `Ok(false)` when it already reached a terminal state.
    pub fn cancel_job(&self, job_id: JobId) -> Result<bool, JobError> {
        let slot = self.live_slot(job_id)?;
        if slot.snapshot()?.is_terminal() {
            return Ok(false);
        }
        slot.request_cancel();
        info!(job_id = %job_id, "job cancellation requested");
        Ok(true)
    }

    /// The finished job a retry would start from, or the reason it can't be retried.
    pub async fn retry_candidate(&self, job_id: JobId) -> Result<Job, JobError> {
        let original = self
            .get_job_async(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))?;

        if !original.kind.supports_retry_failed() {
            return Err(JobError::RetryUnsupported(original.kind));
        }
        if !original.is_terminal() {
            return Err(JobError::NotTerminal(job_id));
        }
        Ok(original)
    }

    /// Start a new job over exactly the failed targets of a finished job.
    ///
    /// Returns `None` when nothing failed. The original job is left as is.
    pub async fn retry_failed_emails(&self, job_id: JobId) -> Result<Option<JobId>, JobError> {
        let original = self.retry_candidate(job_id).await?;

        let failed = original.failed_targets();
        if failed.is_empty() {
            debug!(job_id = %job_id, "retry requested but no items failed");
            return Ok(None);
        }

        let retry = Job::new(original.kind, failed, original.payload.clone()).with_parent(job_id);
        self.launch(retry).map(Some)
    }

    /// Subscribe to a live job's bus. The snapshot is taken after the
    /// receiver is registered.
    pub fn subscribe(&self, job_id: JobId) -> Result<JobSubscription, JobError> {
        Ok(self.live_slot(job_id)?.subscribe()?)
    }

    fn live_slot(&self, job_id: JobId) -> Result<Arc<JobSlot>, JobError> {
        self.store.slot(job_id)?.ok_or(JobError::NotFound(job_id))
    }

    /// Drop terminal jobs older than the retention window. Returns the count.
    pub fn sweep_expired(&self) -> Result<usize, JobError> {
        let cutoff = retention_cutoff(self.clock.now(), self.config.retention);
        Ok(self.store.evict_finished_before(cutoff)?)
    }

    /// Spawn the periodic retention sweeper. Calling this twice is a no-op.
    pub fn start_sweeper(&self) {
        let Ok(mut sweeper) = self.sweeper.lock() else {
            return;
        };
        if sweeper.is_some() {
            return;
        }

        let store = self.store.clone();
        let clock = self.clock.clone();
        let retention = self.config.retention;
        let period = self.config.sweep_interval;
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let cutoff = retention_cutoff(clock.now(), retention);
                match store.evict_finished_before(cutoff) {
                    Ok(0) => {}
                    Ok(evicted) => debug!(evicted, "expired jobs evicted"),
                    Err(err) => warn!(error = %err, "job retention sweep failed"),
                }
            }
        }));
    }

    /// Cancel every active job, stop the sweeper and wait for running
    /// executors to settle. New jobs are refused afterwards.
    pub async fn shutdown(&self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }

        match self.store.active_slots() {
            Ok(active) => {
                for slot in &active {
                    slot.request_cancel();
                }
                info!(active = active.len(), "job service shutting down");
            }
            Err(err) => warn!(error = %err, "could not enumerate active jobs on shutdown"),
        }

        let tasks = match self.running.lock() {
            Ok(mut running) => running.take(),
            Err(_) => None,
        };
        if let Some(mut tasks) = tasks {
            while let Some(result) = tasks.join_next().await {
                if let Err(err) = result {
                    warn!(error = %err, "job task ended abnormally");
                }
            }
        }
    }
}

fn retention_cutoff(
    now: chrono::DateTime<chrono::Utc>,
    retention: std::time::Duration,
) -> chrono::DateTime<chrono::Utc> {
    let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
    now.checked_sub_signed(retention)
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::archive::InMemoryJobArchive;
    use crate::jobs::executor::TracingNotifier;
    use crate::jobs::types::JobStatus;
    use eventdesk_core::{ManualClock, SystemClock};
    use std::time::Duration;

    fn service() -> JobService {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let executor = JobExecutor::new(Arc::new(TracingNotifier::new()), clock.clone());
        JobService::new(executor, clock, JobsConfig::default())
    }

    async fn wait_terminal(service: &JobService, id: JobId) -> Job {
        for _ in 0..200 {
            let job = service.get_job(id).unwrap().unwrap();
            if job.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {id} did not finish");
    }

    fn five_with_two_bad() -> Vec<String> {
        vec![
            "a@example.org".into(),
            "broken-address".into(),
            "c@example.org".into(),
            "also-broken".into(),
            "e@example.org".into(),
        ]
    }

    #[tokio::test]
    async fn create_rejects_empty_targets() {
        let svc = service();
        let err = svc
            .create_job(JobKind::BulkNotify, vec![], serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }

    #[tokio::test]
    async fn retry_creates_job_with_exactly_the_failed_targets() {
        let svc = service();
        let id = svc
            .create_job(JobKind::BulkNotify, five_with_two_bad(), serde_json::json!({"subject": "hi"}))
            .unwrap();
        let original = wait_terminal(&svc, id).await;
        assert_eq!(original.status, JobStatus::Completed);
        assert_eq!((original.processed, original.succeeded, original.failed), (5, 3, 2));

        let retry_id = svc.retry_failed_emails(id).await.unwrap().unwrap();
        let retry = wait_terminal(&svc, retry_id).await;
        assert_eq!(retry.total, 2);
        assert_eq!(retry.targets, vec!["broken-address", "also-broken"]);
        assert_eq!(retry.parent_job_id, Some(id));
        assert_eq!(retry.payload, serde_json::json!({"subject": "hi"}));

        assert_eq!(svc.get_job(id).unwrap().unwrap(), original);
    }

    #[tokio::test]
    async fn retry_without_failures_returns_none() {
        let svc = service();
        let id = svc
            .create_job(JobKind::BulkNotify, vec!["a@example.org".into()], serde_json::json!({}))
            .unwrap();
        wait_terminal(&svc, id).await;
        assert_eq!(svc.retry_failed_emails(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn retry_of_unknown_job_is_not_found() {
        let svc = service();
        let err = svc.retry_failed_emails(JobId::new()).await.unwrap_err();
        assert!(matches!(err, JobError::NotFound(_)));
    }

    #[tokio::test]
    async fn cancel_semantics() {
        let svc = service();
        assert!(matches!(svc.cancel_job(JobId::new()), Err(JobError::NotFound(_))));

        let id = svc
            .create_job(JobKind::BulkNotify, vec!["a@example.org".into()], serde_json::json!({}))
            .unwrap();
        let done = wait_terminal(&svc, id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert!(!svc.cancel_job(id).unwrap());
    }

    #[tokio::test]
    async fn archive_serves_evicted_jobs() {
        let clock = Arc::new(ManualClock::default());
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let archive = InMemoryJobArchive::arc();
        let executor = JobExecutor::new(Arc::new(TracingNotifier::new()), dyn_clock.clone());
        let svc = JobService::new(executor, dyn_clock, JobsConfig::default())
            .with_archive(archive.clone());

        let id = svc
            .create_job(JobKind::BulkNotify, vec!["a@example.org".into()], serde_json::json!({}))
            .unwrap();
        wait_terminal(&svc, id).await;
        // Archive write happens right after the terminal transition.
        for _ in 0..200 {
            if archive.load(id).await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        clock.advance(chrono::Duration::hours(2));
        assert_eq!(svc.sweep_expired().unwrap(), 1);
        assert!(svc.get_job(id).unwrap().is_none());

        let archived = svc.get_job_async(id).await.unwrap().unwrap();
        assert_eq!(archived.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_jobs() {
        let svc = service();
        svc.start_sweeper();
        svc.shutdown().await;
        let err = svc
            .create_job(JobKind::BulkNotify, vec!["a@example.org".into()], serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, JobError::ShuttingDown));
    }
}
