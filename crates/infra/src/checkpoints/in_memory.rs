//! In-memory ledger.
//!
//! All state sits behind one `tokio::sync::RwLock`; writes take the write
//! lock for the whole check-and-insert, so duplicate scans cannot race.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use eventdesk_checkpoints::{
    CheckpointScan, CheckpointStats, CheckpointType, EventRecord, HistoryPage, HistoryQuery,
    RecordOutcome, Rsvp, ScanKey,
};
use eventdesk_core::{Clock, EventId, OperatorId, RsvpId};

use super::{CheckpointLedger, LedgerError};

#[derive(Debug, Default)]
struct LedgerState {
    events: HashMap<EventId, EventRecord>,
    rsvps: HashMap<RsvpId, Rsvp>,
    /// Value carries an insertion sequence to break `scanned_at` ties.
    scans: HashMap<ScanKey, (u64, CheckpointScan)>,
    next_seq: u64,
}

#[derive(Debug)]
pub struct InMemoryCheckpointLedger {
    state: RwLock<LedgerState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCheckpointLedger {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(LedgerState::default()),
            clock,
        }
    }

    pub async fn upsert_event(&self, event: EventRecord) {
        self.state.write().await.events.insert(event.id, event);
    }

    /// Registrants must point at a known event, like the foreign key in Postgres.
    pub async fn upsert_rsvp(&self, rsvp: Rsvp) -> Result<(), LedgerError> {
        let mut state = self.state.write().await;
        if !state.events.contains_key(&rsvp.event_id) {
            return Err(LedgerError::EventNotFound(rsvp.event_id));
        }
        state.rsvps.insert(rsvp.id, rsvp);
        Ok(())
    }

    pub async fn rsvp(&self, rsvp_id: RsvpId) -> Option<Rsvp> {
        self.state.read().await.rsvps.get(&rsvp_id).cloned()
    }
}

#[async_trait]
impl CheckpointLedger for InMemoryCheckpointLedger {
    async fn record_scan(
        &self,
        event_id: EventId,
        rsvp_id: RsvpId,
        checkpoint_type: CheckpointType,
        operator: &OperatorId,
    ) -> Result<RecordOutcome, LedgerError> {
        let now = self.clock.now();
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let Some(rsvp) = state.rsvps.get_mut(&rsvp_id).filter(|r| r.event_id == event_id) else {
            return Err(LedgerError::RsvpNotFound { event_id, rsvp_id });
        };

        let scan = CheckpointScan {
            event_id,
            rsvp_id,
            checkpoint_type,
            scanned_at: now,
            scanned_by: operator.clone(),
        };
        let key = scan.key();
        if state.scans.contains_key(&key) {
            return Ok(RecordOutcome { created: false });
        }

        if checkpoint_type == CheckpointType::Entry {
            rsvp.checked_in = true;
            rsvp.checked_in_at.get_or_insert(now);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.scans.insert(key, (seq, scan));
        debug!(%event_id, %rsvp_id, checkpoint = checkpoint_type.as_str(), "scan recorded");
        Ok(RecordOutcome { created: true })
    }

    async fn delete_scan(
        &self,
        rsvp_id: RsvpId,
        event_id: EventId,
        checkpoint_type: CheckpointType,
    ) -> Result<bool, LedgerError> {
        let mut state = self.state.write().await;
        let removed = state
            .scans
            .remove(&ScanKey::new(event_id, rsvp_id, checkpoint_type))
            .is_some();

        if checkpoint_type == CheckpointType::Entry {
            if let Some(rsvp) = state
                .rsvps
                .get_mut(&rsvp_id)
                .filter(|r| r.event_id == event_id)
            {
                rsvp.checked_in = false;
                rsvp.checked_in_at = None;
            }
        }
        Ok(removed)
    }

    async fn stats(&self, event_id: EventId) -> Result<CheckpointStats, LedgerError> {
        let state = self.state.read().await;
        let event = state
            .events
            .get(&event_id)
            .ok_or(LedgerError::EventNotFound(event_id))?;

        let counts = state
            .scans
            .keys()
            .filter(|k| k.event_id == event_id)
            .map(|k| (k.checkpoint_type, 1));
        Ok(CheckpointStats::from_counts(event.capacity, counts))
    }

    async fn history(
        &self,
        event_id: EventId,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, LedgerError> {
        let state = self.state.read().await;
        if !state.events.contains_key(&event_id) {
            return Err(LedgerError::EventNotFound(event_id));
        }

        let mut matching: Vec<&(u64, CheckpointScan)> = state
            .scans
            .values()
            .filter(|(_, scan)| {
                scan.event_id == event_id
                    && query.checkpoint_type.is_none_or(|t| t == scan.checkpoint_type)
            })
            .collect();
        matching.sort_by(|(a_seq, a), (b_seq, b)| {
            b.scanned_at.cmp(&a.scanned_at).then(b_seq.cmp(a_seq))
        });

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .map(|(_, scan)| scan.clone())
            .collect();
        Ok(HistoryPage::new(items, total, query))
    }
}
