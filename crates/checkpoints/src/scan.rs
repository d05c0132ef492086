use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use eventdesk_core::{DomainError, EventId, OperatorId, RsvpId};

/// A physical touchpoint where a badge gets scanned.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    Entry,
    Refreshment,
    Swag,
}

impl CheckpointType {
    pub const ALL: [CheckpointType; 3] = [
        CheckpointType::Entry,
        CheckpointType::Refreshment,
        CheckpointType::Swag,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointType::Entry => "entry",
            CheckpointType::Refreshment => "refreshment",
            CheckpointType::Swag => "swag",
        }
    }
}

impl core::fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "entry" => Ok(CheckpointType::Entry),
            "refreshment" => Ok(CheckpointType::Refreshment),
            "swag" => Ok(CheckpointType::Swag),
            other => Err(DomainError::validation(format!(
                "checkpoint_type must be one of: entry, refreshment, swag (got '{other}')"
            ))),
        }
    }
}

/// Natural key of a scan: at most one live record per tuple.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScanKey {
    pub event_id: EventId,
    pub rsvp_id: RsvpId,
    pub checkpoint_type: CheckpointType,
}

impl ScanKey {
    pub fn new(event_id: EventId, rsvp_id: RsvpId, checkpoint_type: CheckpointType) -> Self {
        Self {
            event_id,
            rsvp_id,
            checkpoint_type,
        }
    }
}

/// One recorded badge scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointScan {
    pub event_id: EventId,
    pub rsvp_id: RsvpId,
    pub checkpoint_type: CheckpointType,
    pub scanned_at: DateTime<Utc>,
    pub scanned_by: OperatorId,
}

impl CheckpointScan {
    pub fn key(&self) -> ScanKey {
        ScanKey::new(self.event_id, self.rsvp_id, self.checkpoint_type)
    }
}

/// Result of an idempotent scan recording.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutcome {
    /// `false` when the tuple was already recorded (still a success).
    pub created: bool,
}

/// The slice of an event the ledger needs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub capacity: u32,
}

/// A registrant of one event, including the legacy single-flag check-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rsvp {
    pub id: RsvpId,
    pub event_id: EventId,
    pub checked_in: bool,
    pub checked_in_at: Option<DateTime<Utc>>,
}

impl Rsvp {
    pub fn new(id: RsvpId, event_id: EventId) -> Self {
        Self {
            id,
            event_id,
            checked_in: false,
            checked_in_at: None,
        }
    }
}
