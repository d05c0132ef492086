//! In-memory job registry.
//!
//! Holds every live job together with its cancellation flag and event bus.
//! Job state is ephemeral: it lives for the process lifetime (bounded by the
//! retention sweeper) and is not persisted here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use super::events::{JobEvent, JobSubscription};
use super::types::{Job, JobId};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job state lock poisoned")]
    Poisoned,
}

/// A registered job: state, cooperative cancel flag and event bus.
#[derive(Debug)]
pub struct JobSlot {
    job: RwLock<Job>,
    cancel_requested: AtomicBool,
    events: broadcast::Sender<JobEvent>,
}

impl JobSlot {
    fn new(job: Job, event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            job: RwLock::new(job),
            cancel_requested: AtomicBool::new(false),
            events,
        }
    }

    pub fn id(&self) -> Result<JobId, JobStoreError> {
        Ok(self.job.read().map_err(|_| JobStoreError::Poisoned)?.id)
    }

    pub fn snapshot(&self) -> Result<Job, JobStoreError> {
        Ok(self.job.read().map_err(|_| JobStoreError::Poisoned)?.clone())
    }

    /// Apply a mutation and publish the event it yields.
    ///
    /// Publishing happens under the write lock so bus order always equals
    /// version order.
    pub fn update<F>(&self, mutate: F) -> Result<Option<JobEvent>, JobStoreError>
    where
        F: FnOnce(&mut Job) -> Option<JobEvent>,
    {
        let mut job = self.job.write().map_err(|_| JobStoreError::Poisoned)?;
        let event = mutate(&mut job);
        if let Some(ref ev) = event {
            // No subscribers is fine.
            let _ = self.events.send(ev.clone());
        }
        Ok(event)
    }

    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Subscribe first, then snapshot.
    pub fn subscribe(&self) -> Result<JobSubscription, JobStoreError> {
        let receiver = self.events.subscribe();
        let snapshot = self.snapshot()?;
        Ok(JobSubscription { snapshot, receiver })
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }
}

/// In-memory job store (one per process, owned by `JobService`).
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Arc<JobSlot>>>,
    event_buffer: usize,
}

impl InMemoryJobStore {
    pub fn new(event_buffer: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            event_buffer,
        }
    }

    pub fn arc(event_buffer: usize) -> Arc<Self> {
        Arc::new(Self::new(event_buffer))
    }

    /// Register a new job.
    pub fn insert(&self, job: Job) -> Result<Arc<JobSlot>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| JobStoreError::Poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        let slot = Arc::new(JobSlot::new(job, self.event_buffer));
        jobs.insert(id, slot.clone());
        Ok(slot)
    }

    pub fn slot(&self, job_id: JobId) -> Result<Option<Arc<JobSlot>>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| JobStoreError::Poisoned)?;
        Ok(jobs.get(&job_id).cloned())
    }

    /// Snapshot of a job, if it is still registered.
    pub fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        match self.slot(job_id)? {
            Some(slot) => Ok(Some(slot.snapshot()?)),
            None => Ok(None),
        }
    }

    /// All registered jobs, newest first.
    pub fn list(&self) -> Result<Vec<Job>, JobStoreError> {
        let slots: Vec<Arc<JobSlot>> = {
            let jobs = self.jobs.read().map_err(|_| JobStoreError::Poisoned)?;
            jobs.values().cloned().collect()
        };
        let mut result = slots
            .iter()
            .map(|s| s.snapshot())
            .collect::<Result<Vec<_>, _>>()?;
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    /// Slots of every job that has not reached a terminal state.
    pub fn active_slots(&self) -> Result<Vec<Arc<JobSlot>>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| JobStoreError::Poisoned)?;
        let mut active = Vec::new();
        for slot in jobs.values() {
            if !slot.snapshot()?.is_terminal() {
                active.push(slot.clone());
            }
        }
        Ok(active)
    }

    /// Drop terminal jobs that finished before `cutoff`. Returns how many were evicted.
    ///
    /// A slot whose state can't be read is kept.
    pub fn evict_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| JobStoreError::Poisoned)?;
        let before = jobs.len();
        jobs.retain(|_, slot| match slot.snapshot() {
            Ok(job) => !(job.is_terminal() && job.finished_at.is_some_and(|t| t < cutoff)),
            Err(_) => true,
        });
        Ok(before - jobs.len())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|j| j.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{ItemOutcome, JobKind};

    fn job(n: usize) -> Job {
        let targets = (0..n).map(|i| format!("t{i}@example.org")).collect();
        Job::new(JobKind::BulkNotify, targets, serde_json::json!({}))
    }

    #[test]
    fn insert_and_get() {
        let store = InMemoryJobStore::new(16);
        let job = job(2);
        let id = job.id;
        store.insert(job.clone()).unwrap();

        assert_eq!(store.get(id).unwrap().unwrap().id, id);
        assert!(matches!(
            store.insert(job),
            Err(JobStoreError::AlreadyExists(_))
        ));
        assert!(store.get(JobId::new()).unwrap().is_none());
    }

    #[test]
    fn update_publishes_to_subscribers_in_version_order() {
        let store = InMemoryJobStore::new(16);
        let slot = store.insert(job(2)).unwrap();
        let mut sub = slot.subscribe().unwrap();
        assert_eq!(sub.snapshot.version, 0);

        let now = Utc::now();
        slot.update(|j| j.mark_running(now).then(|| JobEvent::started(j)))
            .unwrap();
        slot.update(|j| {
            let item = ItemOutcome::succeeded("t0@example.org");
            j.record_outcome(item.clone(), now)
                .then(|| JobEvent::progress(j, item))
        })
        .unwrap();

        assert_eq!(sub.receiver.try_recv().unwrap().version, 1);
        assert_eq!(sub.receiver.try_recv().unwrap().version, 2);
    }

    #[test]
    fn eviction_only_removes_old_terminal_jobs() {
        let store = InMemoryJobStore::new(4);
        let finished = store.insert(job(0)).unwrap();
        let running = store.insert(job(1)).unwrap();
        let now = Utc::now();
        finished
            .update(|j| {
                j.mark_running(now);
                j.mark_completed(now);
                None
            })
            .unwrap();
        running.update(|j| {
            j.mark_running(now);
            None
        })
        .unwrap();

        let evicted = store
            .evict_finished_before(now + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(evicted, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.active_slots().unwrap().len(), 1);
    }

    #[test]
    fn eviction_keeps_jobs_around_an_unreadable_slot() {
        let store = InMemoryJobStore::new(4);
        let now = Utc::now();
        let finished = store.insert(job(0)).unwrap();
        finished
            .update(|j| {
                j.mark_running(now);
                j.mark_completed(now);
                None
            })
            .unwrap();
        let queued = store.insert(job(1)).unwrap();
        let broken = store.insert(job(1)).unwrap();
        let broken_id = broken.id().unwrap();
        let poisoned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            broken.update(|_| panic!("mutation blew up"))
        }));
        assert!(poisoned.is_err());
        assert!(matches!(broken.snapshot(), Err(JobStoreError::Poisoned)));

        let evicted = store
            .evict_finished_before(now + chrono::Duration::seconds(1))
            .unwrap();

        assert_eq!(evicted, 1);
        assert_eq!(store.len(), 2);
        assert!(store.get(queued.id().unwrap()).unwrap().is_some());
        assert!(store.slot(broken_id).unwrap().is_some());
    }

    #[test]
    fn list_is_newest_first() {
        let store = InMemoryJobStore::new(4);
        let mut older = job(1);
        older.created_at -= chrono::Duration::minutes(5);
        let newer = job(1);
        let newer_id = newer.id;
        store.insert(older).unwrap();
        store.insert(newer).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed[0].id, newer_id);
    }
}
