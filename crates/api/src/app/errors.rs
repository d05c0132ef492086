use axum::http::{HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use serde_json::json;

use eventdesk_core::DomainError;
use eventdesk_infra::jobs::JobError;
use eventdesk_infra::{LedgerError, RateLimitDecision, RateLimitError};

pub fn job_error_to_response(err: JobError) -> axum::response::Response {
    match err {
        JobError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        JobError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        e @ JobError::NotTerminal(_) => json_error(StatusCode::CONFLICT, "job_not_finished", e.to_string()),
        e @ JobError::RetryUnsupported(_) => {
            json_error(StatusCode::CONFLICT, "retry_unsupported", e.to_string())
        }
        e @ JobError::ShuttingDown => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "shutting_down", e.to_string())
        }
        e @ (JobError::Store(_) | JobError::Archive(_)) => {
            tracing::error!(error = %e, "job storage failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}

pub fn ledger_error_to_response(err: LedgerError) -> axum::response::Response {
    match err {
        e @ (LedgerError::EventNotFound(_) | LedgerError::RsvpNotFound { .. }) => {
            json_error(StatusCode::NOT_FOUND, "not_found", e.to_string())
        }
        e @ LedgerError::Storage(_) => {
            tracing::error!(error = %e, "ledger storage failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
    }
}

pub fn rate_limit_error_to_response(err: RateLimitError) -> axum::response::Response {
    match err {
        RateLimitError::Validation(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "rate_limit_misconfigured", msg)
        }
        RateLimitError::Backend(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "rate_limit_unavailable", msg)
        }
    }
}

pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Attach the caller's remaining quota to an admitted response.
pub fn with_quota(
    mut response: axum::response::Response,
    decision: &RateLimitDecision,
) -> axum::response::Response {
    response.headers_mut().insert(
        RATE_LIMIT_REMAINING_HEADER,
        HeaderValue::from(decision.remaining),
    );
    response
}

/// 429 with the window reset time and remaining quota, plus `Retry-After`.
pub fn rate_limited(decision: &RateLimitDecision) -> axum::response::Response {
    let retry_after = (decision.reset_at - chrono::Utc::now()).num_seconds().max(1);
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        axum::Json(json!({
            "error": "rate_limited",
            "message": "too many requests; try again later",
            "reset_at": decision.reset_at,
            "remaining": decision.remaining,
        })),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    with_quota(response, decision)
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
