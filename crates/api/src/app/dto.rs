use std::str::FromStr;

use serde::Deserialize;

use eventdesk_checkpoints::{CheckpointType, HistoryQuery};
use eventdesk_core::{EventId, RsvpId};
use eventdesk_infra::jobs::{Job, JobId};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub kind: String,
    pub targets: Vec<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct RecordScanRequest {
    pub rsvp_id: String,
    pub checkpoint_type: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub checkpoint_type: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl HistoryParams {
    pub fn into_query(self) -> Result<HistoryQuery, axum::response::Response> {
        let checkpoint_type = self
            .checkpoint_type
            .as_deref()
            .map(parse_checkpoint_type)
            .transpose()?;
        HistoryQuery::new(checkpoint_type, self.limit, self.offset)
            .map_err(errors::domain_error_to_response)
    }
}

// -------------------------
// Response mapping
// -------------------------

/// Listing view: counters without per-item detail.
pub fn job_summary_to_json(job: &Job) -> serde_json::Value {
    serde_json::json!({
        "id": job.id.to_string(),
        "kind": job.kind,
        "status": job.status,
        "total": job.total,
        "processed": job.processed,
        "succeeded": job.succeeded,
        "failed": job.failed,
        "parent_job_id": job.parent_job_id.map(|p| p.to_string()),
        "created_at": job.created_at,
        "updated_at": job.updated_at,
        "finished_at": job.finished_at,
    })
}

// -------------------------
// Path/query parsing
// -------------------------

pub fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    JobId::from_str(raw).map_err(|e| {
        errors::json_error(
            axum::http::StatusCode::BAD_REQUEST,
            "invalid_id",
            format!("JobId: {e}"),
        )
    })
}

pub fn parse_event_id(raw: &str) -> Result<EventId, axum::response::Response> {
    EventId::from_str(raw).map_err(errors::domain_error_to_response)
}

pub fn parse_rsvp_id(raw: &str) -> Result<RsvpId, axum::response::Response> {
    RsvpId::from_str(raw).map_err(errors::domain_error_to_response)
}

pub fn parse_checkpoint_type(raw: &str) -> Result<CheckpointType, axum::response::Response> {
    CheckpointType::from_str(raw).map_err(errors::domain_error_to_response)
}
