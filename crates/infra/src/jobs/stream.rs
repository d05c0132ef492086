//! Bridges a job's event bus to a per-connection frame channel.
//!
//! The HTTP layer turns frames into SSE; this module only decides what to
//! send and when to stop. The forwarding task owns the bus subscription and
//! the heartbeat timer, so both are released the moment the consumer side of
//! the channel goes away.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::events::{JobEvent, JobSubscription};
use super::service::{JobError, JobService};
use super::types::{Job, JobId};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// Full snapshot. Always the first frame; re-sent after a lag.
    Status(Job),
    Message(JobEvent),
    Heartbeat,
}

#[derive(Debug, Clone)]
pub struct StatusStreamer {
    service: Arc<JobService>,
    heartbeat: Duration,
    buffer: usize,
}

impl StatusStreamer {
    pub fn new(service: Arc<JobService>, heartbeat: Duration) -> Self {
        Self {
            service,
            heartbeat,
            buffer: 32,
        }
    }

    /// Open a stream for `job_id`.
    ///
    /// Live jobs get a forwarding task. Jobs only known to the archive get
    /// their snapshot and an immediately closed channel.
    pub async fn open(&self, job_id: JobId) -> Result<mpsc::Receiver<StreamFrame>, JobError> {
        let (tx, rx) = mpsc::channel(self.buffer);

        match self.service.subscribe(job_id) {
            Ok(subscription) => {
                let service = self.service.clone();
                let heartbeat = self.heartbeat;
                tokio::spawn(forward(subscription, service, tx, heartbeat));
            }
            Err(JobError::NotFound(_)) => {
                let job = self
                    .service
                    .get_job_async(job_id)
                    .await?
                    .ok_or(JobError::NotFound(job_id))?;
                // Fresh channel, capacity >= 1.
                let _ = tx.try_send(StreamFrame::Status(job));
            }
            Err(err) => return Err(err),
        }

        Ok(rx)
    }
}

async fn forward(
    subscription: JobSubscription,
    service: Arc<JobService>,
    tx: mpsc::Sender<StreamFrame>,
    heartbeat: Duration,
) {
    let JobSubscription {
        snapshot,
        mut receiver,
    } = subscription;
    let job_id = snapshot.id;
    let mut last_version = snapshot.version;
    let finished = snapshot.is_terminal();

    if tx.send(StreamFrame::Status(snapshot)).await.is_err() || finished {
        return;
    }

    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tx.closed() => {
                debug!(job_id = %job_id, "status stream consumer disconnected");
                return;
            }
            _ = ticker.tick() => {
                if tx.send(StreamFrame::Heartbeat).await.is_err() {
                    return;
                }
            }
            received = receiver.recv() => match received {
                Ok(event) => {
                    if event.version <= last_version {
                        continue;
                    }
                    last_version = event.version;
                    let terminal = event.is_terminal();
                    if tx.send(StreamFrame::Message(event)).await.is_err() || terminal {
                        return;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(job_id = %job_id, skipped, "status stream lagged; resending snapshot");
                    let Ok(Some(job)) = service.get_job(job_id) else {
                        return;
                    };
                    if job.version <= last_version {
                        continue;
                    }
                    last_version = job.version;
                    let terminal = job.is_terminal();
                    if tx.send(StreamFrame::Status(job)).await.is_err() || terminal {
                        return;
                    }
                }
                Err(RecvError::Closed) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobsConfig;
    use crate::jobs::events::JobEventKind;
    use crate::jobs::executor::{JobExecutor, TracingNotifier};
    use crate::jobs::types::{JobKind, JobStatus};
    use eventdesk_core::{Clock, SystemClock};

    fn slow_service(per_item: Duration, event_buffer: usize) -> Arc<JobService> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let notifier = TracingNotifier::new().with_delay(per_item);
        let executor = JobExecutor::new(Arc::new(notifier), clock.clone());
        let config = JobsConfig {
            event_buffer,
            ..JobsConfig::default()
        };
        Arc::new(JobService::new(executor, clock, config))
    }

    fn recipients(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("guest{i}@example.org")).collect()
    }

    #[tokio::test]
    async fn snapshot_first_then_ordered_messages_until_terminal() {
        let service = slow_service(Duration::from_millis(2), 64);
        let id = service
            .create_job(JobKind::BulkNotify, recipients(6), serde_json::json!({}))
            .unwrap();
        let streamer = StatusStreamer::new(service, Duration::from_secs(15));

        let mut rx = streamer.open(id).await.unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }

        let StreamFrame::Status(first) = &frames[0] else {
            panic!("first frame must be a status snapshot");
        };
        let mut last = first.version;
        for frame in &frames[1..] {
            if let StreamFrame::Message(event) = frame {
                assert!(event.version > last);
                last = event.version;
            }
        }
        match frames.last() {
            Some(StreamFrame::Message(event)) => {
                assert!(matches!(
                    event.kind,
                    JobEventKind::Finished {
                        status: JobStatus::Completed,
                        processed: 6,
                        ..
                    }
                ));
            }
            Some(StreamFrame::Status(job)) => assert!(job.is_terminal()),
            other => panic!("unexpected last frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn terminal_job_yields_single_snapshot() {
        let service = slow_service(Duration::ZERO, 16);
        let id = service
            .create_job(JobKind::BulkNotify, recipients(1), serde_json::json!({}))
            .unwrap();
        for _ in 0..200 {
            if service.get_job(id).unwrap().unwrap().is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let streamer = StatusStreamer::new(service, Duration::from_secs(15));
        let mut rx = streamer.open(id).await.unwrap();
        assert!(matches!(rx.recv().await, Some(StreamFrame::Status(job)) if job.is_terminal()));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn heartbeat_frames_are_emitted_while_idle() {
        let service = slow_service(Duration::from_millis(200), 16);
        let id = service
            .create_job(JobKind::BulkNotify, recipients(3), serde_json::json!({}))
            .unwrap();
        let streamer = StatusStreamer::new(service, Duration::from_millis(20));

        let mut rx = streamer.open(id).await.unwrap();
        let mut saw_heartbeat = false;
        for _ in 0..10 {
            if let Some(StreamFrame::Heartbeat) = rx.recv().await {
                saw_heartbeat = true;
                break;
            }
        }
        assert!(saw_heartbeat);
    }

    #[tokio::test]
    async fn dropping_the_consumer_releases_the_subscription() {
        let service = slow_service(Duration::from_millis(50), 16);
        let id = service
            .create_job(JobKind::BulkNotify, recipients(20), serde_json::json!({}))
            .unwrap();
        let streamer = StatusStreamer::new(service.clone(), Duration::from_secs(15));
        let slot = service.store().slot(id).unwrap().unwrap();

        let mut rx = streamer.open(id).await.unwrap();
        assert!(matches!(rx.recv().await, Some(StreamFrame::Status(_))));
        assert_eq!(slot.subscriber_count(), 1);

        drop(rx);
        for _ in 0..100 {
            if slot.subscriber_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(slot.subscriber_count(), 0);
        service.cancel_job(id).unwrap();
    }

    fn frame_version(frame: &StreamFrame) -> Option<u64> {
        match frame {
            StreamFrame::Status(job) => Some(job.version),
            StreamFrame::Message(event) => Some(event.version),
            StreamFrame::Heartbeat => None,
        }
    }

    #[tokio::test]
    async fn lagging_consumer_gets_fresh_snapshot_and_still_ends_terminal() {
        let service = slow_service(Duration::from_millis(1), 2);
        let id = service
            .create_job(JobKind::BulkNotify, recipients(500), serde_json::json!({}))
            .unwrap();
        let streamer = StatusStreamer::new(service.clone(), Duration::from_secs(15));

        let mut slow = streamer.open(id).await.unwrap();
        let mut fast = streamer.open(id).await.unwrap();
        let fast_reader = tokio::spawn(async move {
            let mut last = None;
            while let Some(frame) = fast.recv().await {
                last = Some(frame);
            }
            last
        });

        assert!(matches!(slow.recv().await, Some(StreamFrame::Status(_))));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut frames = Vec::new();
        while let Some(frame) = slow.recv().await {
            frames.push(frame);
        }

        let versions: Vec<u64> = frames.iter().filter_map(frame_version).collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
        assert!(
            frames
                .iter()
                .any(|frame| matches!(frame, StreamFrame::Status(_))),
            "a lagged consumer is resynchronised with a snapshot"
        );
        let terminal = match frames.last() {
            Some(StreamFrame::Status(job)) => job.is_terminal(),
            Some(StreamFrame::Message(event)) => event.is_terminal(),
            _ => false,
        };
        assert!(terminal);

        // The other consumer was never held back by the slow one.
        let fast_last = fast_reader.await.unwrap();
        assert!(matches!(
            fast_last,
            Some(StreamFrame::Message(ref event)) if event.is_terminal()
        ) || matches!(fast_last, Some(StreamFrame::Status(ref job)) if job.is_terminal()));
        let job = service.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.processed, 500);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let service = slow_service(Duration::ZERO, 16);
        let streamer = StatusStreamer::new(service, Duration::from_secs(15));
        assert!(matches!(
            streamer.open(JobId::new()).await,
            Err(JobError::NotFound(_))
        ));
    }
}
