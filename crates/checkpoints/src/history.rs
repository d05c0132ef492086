//! Paginated scan history (audit trail).

use serde::{Deserialize, Serialize};

use eventdesk_core::DomainError;

use crate::scan::{CheckpointScan, CheckpointType};

/// Validated history query.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub checkpoint_type: Option<CheckpointType>,
    pub limit: u32,
    pub offset: u32,
}

impl HistoryQuery {
    pub const DEFAULT_LIMIT: u32 = 50;
    pub const MAX_LIMIT: u32 = 100;

    /// Validate raw pagination input; `None` picks the defaults.
    pub fn new(
        checkpoint_type: Option<CheckpointType>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Self, DomainError> {
        let limit = match limit {
            None => Self::DEFAULT_LIMIT,
            Some(l) if (1..=i64::from(Self::MAX_LIMIT)).contains(&l) => l as u32,
            Some(l) => {
                return Err(DomainError::validation(format!(
                    "limit must be between 1 and {} (got {l})",
                    Self::MAX_LIMIT
                )));
            }
        };
        let offset = match offset {
            None => 0,
            Some(o) if (0..=i64::from(u32::MAX)).contains(&o) => o as u32,
            Some(o) => {
                return Err(DomainError::validation(format!(
                    "offset must be a non-negative integer (got {o})"
                )));
            }
        };
        Ok(Self {
            checkpoint_type,
            limit,
            offset,
        })
    }
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            checkpoint_type: None,
            limit: Self::DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

/// One page of history plus pagination metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPage {
    /// Newest first.
    pub items: Vec<CheckpointScan>,
    /// Matching records across all pages, counted independently of the page.
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
    pub has_more: bool,
}

impl HistoryPage {
    pub fn new(items: Vec<CheckpointScan>, total: u64, query: &HistoryQuery) -> Self {
        let has_more = total > u64::from(query.offset) + u64::from(query.limit);
        Self {
            items,
            total,
            limit: query.limit,
            offset: query.offset,
            has_more,
        }
    }
}
