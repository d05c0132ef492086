//! Attendance ledger storage.
//!
//! One async trait, two implementations: `InMemoryCheckpointLedger` (tests,
//! single-node dev) and `PostgresCheckpointLedger`. Both guarantee at most
//! one record per (event, rsvp, checkpoint type) under concurrent scans.

use async_trait::async_trait;

use eventdesk_checkpoints::{
    CheckpointStats, CheckpointType, HistoryPage, HistoryQuery, RecordOutcome,
};
use eventdesk_core::{EventId, OperatorId, RsvpId};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryCheckpointLedger;
pub use postgres::PostgresCheckpointLedger;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("event not found: {0}")]
    EventNotFound(EventId),
    #[error("rsvp {rsvp_id} not found for event {event_id}")]
    RsvpNotFound { event_id: EventId, rsvp_id: RsvpId },
    #[error("ledger storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait CheckpointLedger: Send + Sync + std::fmt::Debug {
    /// Record a scan. Re-recording an existing tuple succeeds with
    /// `created = false`. An `entry` scan also sets the legacy
    /// `checked_in` flag on the RSVP.
    async fn record_scan(
        &self,
        event_id: EventId,
        rsvp_id: RsvpId,
        checkpoint_type: CheckpointType,
        operator: &OperatorId,
    ) -> Result<RecordOutcome, LedgerError>;

    /// Remove one scan. Returns whether a record existed. Deleting `entry`
    /// clears the legacy flag either way.
    async fn delete_scan(
        &self,
        rsvp_id: RsvpId,
        event_id: EventId,
        checkpoint_type: CheckpointType,
    ) -> Result<bool, LedgerError>;

    async fn stats(&self, event_id: EventId) -> Result<CheckpointStats, LedgerError>;

    /// Newest first; `total` counts every match, not just the page.
    async fn history(
        &self,
        event_id: EventId,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, LedgerError>;
}
