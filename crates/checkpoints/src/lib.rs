//! Attendance checkpoint domain.
//!
//! Pure types and arithmetic for the multi-checkpoint attendance ledger:
//! checkpoint kinds, scan records, statistics and history paging. Storage
//! lives in `eventdesk-infra`.

pub mod history;
pub mod scan;
pub mod stats;

pub use history::{HistoryPage, HistoryQuery};
pub use scan::{CheckpointScan, CheckpointType, EventRecord, RecordOutcome, Rsvp, ScanKey};
pub use stats::{CheckpointCount, CheckpointStats, percentage};
