//! Drives one job from `queued` to a terminal state.
//!
//! Items run through an [`ItemProcessor`] with bounded concurrency. Each
//! outcome is recorded on the job slot and published to the job's bus in a
//! single critical section. Cancellation is cooperative: the flag is checked
//! before each item is started, items already in flight finish normally.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tracing::{debug, error, info, warn};

use eventdesk_core::Clock;

use super::archive::JobArchive;
use super::events::JobEvent;
use super::store::{JobSlot, JobStoreError};
use super::types::{ItemOutcome, Job, JobStatus};

/// Performs the per-item work of a job.
///
/// Errors are returned as plain messages; they end up verbatim in the
/// item outcome.
#[async_trait]
pub trait ItemProcessor: Send + Sync + std::fmt::Debug {
    /// Run once before any item. A failure here fails the whole job.
    async fn prepare(&self, _job: &Job) -> Result<(), String> {
        Ok(())
    }

    async fn process(&self, job: &Job, target: &str) -> Result<(), String>;
}

/// Notification processor that logs each dispatch.
///
/// Delivery channels are external; this one only rejects recipients that
/// cannot be addresses.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier {
    delay: Option<Duration>,
}

impl TracingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long per item (useful to observe progress).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl ItemProcessor for TracingNotifier {
    async fn process(&self, job: &Job, target: &str) -> Result<(), String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let valid = target
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
        if !valid {
            return Err(format!("invalid recipient address: {target}"));
        }
        debug!(job_id = %job.id, recipient = target, "notification dispatched");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct JobExecutor {
    processor: Arc<dyn ItemProcessor>,
    archive: Option<Arc<dyn JobArchive>>,
    clock: Arc<dyn Clock>,
    concurrency: usize,
}

impl JobExecutor {
    pub fn new(processor: Arc<dyn ItemProcessor>, clock: Arc<dyn Clock>) -> Self {
        Self {
            processor,
            archive: None,
            clock,
            concurrency: 1,
        }
    }

    pub fn with_archive(mut self, archive: Arc<dyn JobArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Run the job held by `slot` to completion and return its final snapshot.
    ///
    /// Never panics on item failures; store faults end the job `failed` when
    /// the slot can still be written.
    pub async fn run(&self, slot: Arc<JobSlot>) -> Option<Job> {
        match self.drive(&slot).await {
            Ok(job) => {
                info!(
                    job_id = %job.id,
                    status = job.status.as_str(),
                    processed = job.processed,
                    succeeded = job.succeeded,
                    failed = job.failed,
                    "job finished"
                );
                self.archive(&job).await;
                Some(job)
            }
            Err(err) => {
                error!(error = %err, "job run aborted");
                let now = self.clock.now();
                let failed = slot.update(|job| {
                    let message = format!("job store failure: {err}");
                    job.mark_failed(message, now)
                        .then(|| JobEvent::finished(job))
                });
                match (failed, slot.snapshot()) {
                    (Ok(_), Ok(job)) => {
                        self.archive(&job).await;
                        Some(job)
                    }
                    _ => None,
                }
            }
        }
    }

    async fn drive(&self, slot: &JobSlot) -> Result<Job, JobStoreError> {
        let now = self.clock.now();
        let started = slot.update(|job| job.mark_running(now).then(|| JobEvent::started(job)))?;
        if started.is_none() {
            // Someone else already moved it out of `queued`.
            return slot.snapshot();
        }

        let job = slot.snapshot()?;
        info!(job_id = %job.id, kind = job.kind.as_str(), total = job.total, "job started");

        if let Err(message) = self.processor.prepare(&job).await {
            warn!(job_id = %job.id, error = %message, "job preparation failed");
            let now = self.clock.now();
            slot.update(|job| {
                job.mark_failed(message, now)
                    .then(|| JobEvent::finished(job))
            })?;
            return slot.snapshot();
        }

        let job = Arc::new(job);
        let mut pending = job.targets.clone().into_iter();
        let mut in_flight = FuturesUnordered::new();
        loop {
            while in_flight.len() < self.concurrency && !slot.is_cancel_requested() {
                let Some(target) = pending.next() else {
                    break;
                };
                in_flight.push(process_item(self.processor.clone(), job.clone(), target));
            }
            let Some(outcome) = in_flight.next().await else {
                break;
            };
            debug!(
                job_id = %job.id,
                target = %outcome.target,
                ok = outcome.ok,
                "item processed"
            );
            let now = self.clock.now();
            slot.update(|job| {
                job.record_outcome(outcome.clone(), now)
                    .then(|| JobEvent::progress(job, outcome))
            })?;
        }

        let now = self.clock.now();
        slot.update(|job| {
            let finished = if job.processed < job.total && slot.is_cancel_requested() {
                job.mark_canceled(now)
            } else {
                job.mark_completed(now)
            };
            finished.then(|| JobEvent::finished(job))
        })?;

        slot.snapshot()
    }

    async fn archive(&self, job: &Job) {
        let Some(archive) = &self.archive else {
            return;
        };
        if job.status == JobStatus::Queued || job.status == JobStatus::Running {
            return;
        }
        if let Err(err) = archive.save(job).await {
            warn!(job_id = %job.id, error = %err, "failed to archive job snapshot");
        }
    }
}

/// Runs one item, folding errors and panics into its outcome.
async fn process_item(
    processor: Arc<dyn ItemProcessor>,
    job: Arc<Job>,
    target: String,
) -> ItemOutcome {
    let result = AssertUnwindSafe(processor.process(&job, &target))
        .catch_unwind()
        .await;
    match result {
        Ok(Ok(())) => ItemOutcome::succeeded(target),
        Ok(Err(message)) => ItemOutcome::failed(target, message),
        Err(panic) => {
            let message = format!("item processor panicked: {}", panic_message(panic.as_ref()));
            ItemOutcome::failed(target, message)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::archive::InMemoryJobArchive;
    use crate::jobs::events::JobEventKind;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::JobKind;
    use eventdesk_core::SystemClock;
    use std::collections::HashSet;

    /// Fails a fixed set of targets, panics on `boom@example.org`.
    #[derive(Debug, Default)]
    struct ScriptedProcessor {
        failing: HashSet<String>,
        fail_prepare: bool,
    }

    #[async_trait]
    impl ItemProcessor for ScriptedProcessor {
        async fn prepare(&self, _job: &Job) -> Result<(), String> {
            if self.fail_prepare {
                Err("template not found".into())
            } else {
                Ok(())
            }
        }

        async fn process(&self, _job: &Job, target: &str) -> Result<(), String> {
            if target == "boom@example.org" {
                panic!("smtp client exploded");
            }
            if self.failing.contains(target) {
                Err("mailbox unavailable".into())
            } else {
                Ok(())
            }
        }
    }

    fn targets(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("r{i}@example.org")).collect()
    }

    fn executor(processor: ScriptedProcessor) -> JobExecutor {
        JobExecutor::new(Arc::new(processor), Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn items_two_and_four_fail_job_still_completes() {
        let store = InMemoryJobStore::new(64);
        let slot = store
            .insert(Job::new(JobKind::BulkNotify, targets(5), serde_json::json!({})))
            .unwrap();
        let processor = ScriptedProcessor {
            failing: ["r2@example.org", "r4@example.org"]
                .into_iter()
                .map(String::from)
                .collect(),
            ..Default::default()
        };

        let job = executor(processor).run(slot).await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!((job.processed, job.succeeded, job.failed), (5, 3, 2));
        assert_eq!(job.failed_targets(), vec!["r2@example.org", "r4@example.org"]);
        assert!(job.finished_at.is_some());
    }

    #[tokio::test]
    async fn progress_events_are_monotonic_and_consistent() {
        let store = InMemoryJobStore::new(64);
        let slot = store
            .insert(Job::new(JobKind::BulkNotify, targets(8), serde_json::json!({})))
            .unwrap();
        let mut sub = slot.subscribe().unwrap();
        let processor = ScriptedProcessor {
            failing: ["r3@example.org".to_string()].into_iter().collect(),
            ..Default::default()
        };

        executor(processor).with_concurrency(3).run(slot).await.unwrap();

        let mut last_version = sub.snapshot.version;
        let mut last_processed = 0;
        let mut saw_finished = false;
        while let Ok(event) = sub.receiver.try_recv() {
            assert!(event.version > last_version);
            last_version = event.version;
            if let JobEventKind::Progress {
                processed,
                succeeded,
                failed,
                ..
            } = event.kind
            {
                assert!(processed > last_processed);
                assert_eq!(succeeded + failed, processed);
                last_processed = processed;
            }
            saw_finished = event.is_terminal();
        }
        assert_eq!(last_processed, 8);
        assert!(saw_finished);
    }

    #[tokio::test]
    async fn panicking_item_is_recorded_as_failure() {
        let store = InMemoryJobStore::new(16);
        let slot = store
            .insert(Job::new(
                JobKind::BulkNotify,
                vec!["ok@example.org".into(), "boom@example.org".into()],
                serde_json::json!({}),
            ))
            .unwrap();

        let job = executor(ScriptedProcessor::default()).run(slot).await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.failed, 1);
        let failure = job.items.iter().find(|i| !i.ok).unwrap();
        assert!(failure.error.as_deref().unwrap().contains("smtp client exploded"));
    }

    #[tokio::test]
    async fn prepare_failure_fails_the_job() {
        let store = InMemoryJobStore::new(16);
        let slot = store
            .insert(Job::new(JobKind::BulkNotify, targets(3), serde_json::json!({})))
            .unwrap();
        let processor = ScriptedProcessor {
            fail_prepare: true,
            ..Default::default()
        };

        let job = executor(processor).run(slot).await.unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.processed, 0);
        assert_eq!(job.error.as_deref(), Some("template not found"));
    }

    #[tokio::test]
    async fn cancel_before_start_yields_canceled_without_items() {
        let store = InMemoryJobStore::new(16);
        let slot = store
            .insert(Job::new(JobKind::BulkNotify, targets(3), serde_json::json!({})))
            .unwrap();
        slot.request_cancel();

        let job = executor(ScriptedProcessor::default()).run(slot).await.unwrap();

        assert_eq!(job.status, JobStatus::Canceled);
        assert_eq!(job.processed, 0);
        assert!(job.canceled_at.is_some());
    }

    #[tokio::test]
    async fn cancel_mid_run_stops_within_one_item() {
        let store = InMemoryJobStore::new(64);
        let slot = store
            .insert(Job::new(JobKind::BulkNotify, targets(50), serde_json::json!({})))
            .unwrap();
        let mut sub = slot.subscribe().unwrap();
        let exec = JobExecutor::new(
            Arc::new(TracingNotifier::new().with_delay(Duration::from_millis(5))),
            Arc::new(SystemClock),
        );
        let handle = tokio::spawn({
            let slot = slot.clone();
            async move { exec.run(slot).await }
        });

        // Wait for the first progress event, then cancel.
        loop {
            let event = sub.receiver.recv().await.unwrap();
            if matches!(event.kind, JobEventKind::Progress { .. }) {
                break;
            }
        }
        slot.request_cancel();
        let observed = slot.snapshot().unwrap().processed;

        let job = handle.await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert!(job.processed <= observed + 1);
        assert!(job.processed < 50);
    }

    #[tokio::test]
    async fn terminal_snapshot_is_archived() {
        let store = InMemoryJobStore::new(16);
        let archive = InMemoryJobArchive::arc();
        let slot = store
            .insert(Job::new(JobKind::BulkNotify, targets(2), serde_json::json!({})))
            .unwrap();
        let id = slot.id().unwrap();

        executor(ScriptedProcessor::default())
            .with_archive(archive.clone())
            .run(slot)
            .await
            .unwrap();

        let archived = archive.load(id).await.unwrap().unwrap();
        assert_eq!(archived.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn run_can_be_spawned_with_parallel_items() {
        let store = InMemoryJobStore::new(64);
        let slot = store
            .insert(Job::new(JobKind::BulkNotify, targets(12), serde_json::json!({})))
            .unwrap();
        let processor = ScriptedProcessor {
            failing: ["r5@example.org".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let exec = executor(processor).with_concurrency(4);

        let mut set = tokio::task::JoinSet::new();
        set.spawn(async move { exec.run(slot).await });
        let job = set.join_next().await.unwrap().unwrap().unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!((job.processed, job.succeeded, job.failed), (12, 11, 1));
        assert_eq!(job.items.len(), 12);
    }

    #[tokio::test]
    async fn tracing_notifier_rejects_malformed_recipients() {
        let job = Job::new(JobKind::BulkNotify, vec![], serde_json::json!({}));
        let notifier = TracingNotifier::new();
        assert!(notifier.process(&job, "ada@example.org").await.is_ok());
        assert!(notifier.process(&job, "not-an-address").await.is_err());
    }
}
