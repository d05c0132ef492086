use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tracing::info;

use eventdesk_infra::RateLimitDecision;
use eventdesk_infra::jobs::JobKind;

use crate::app::routes::job_stream;
use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::OperatorContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_job).get(list_jobs))
        .route("/:id", get(get_job))
        .route("/:id/cancel", post(cancel_job))
        .route("/:id/retry-failed", post(retry_failed))
        .route("/:id/stream", get(job_stream::stream_job))
}

/// Admit one `operation` for the calling operator or produce the 429.
async fn enforce_rate_limit(
    services: &AppServices,
    operator: &OperatorContext,
    operation: &str,
) -> Result<RateLimitDecision, axum::response::Response> {
    let decision = services
        .rate_limiter
        .admit(
            &operator.rate_limit_key(operation),
            services.limits.bulk_notify_limit,
            services.limits.bulk_notify_window_secs,
        )
        .await
        .map_err(errors::rate_limit_error_to_response)?;

    if !decision.allowed {
        info!(
            operator = %operator.operator_id(),
            operation,
            reset_at = %decision.reset_at,
            "request rate limited"
        );
        return Err(errors::rate_limited(&decision));
    }
    Ok(decision)
}

pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(operator): Extension<OperatorContext>,
    Json(body): Json<dto::CreateJobRequest>,
) -> axum::response::Response {
    let kind = match JobKind::from_str(&body.kind) {
        Ok(k) => k,
        Err(msg) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_kind", msg),
    };

    let decision = match enforce_rate_limit(&services, &operator, kind.as_str()).await {
        Ok(decision) => decision,
        Err(resp) => return resp,
    };

    let payload = body.payload.unwrap_or_else(|| serde_json::json!({}));
    let response = match services.jobs.create_job(kind, body.targets, payload) {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "job_id": job_id.to_string() })),
        )
            .into_response(),
        Err(e) => errors::job_error_to_response(e),
    };
    errors::with_quota(response, &decision)
}

pub async fn list_jobs(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.jobs.list_jobs() {
        Ok(jobs) => {
            let items = jobs.iter().map(dto::job_summary_to_json).collect::<Vec<_>>();
            (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
        }
        Err(e) => errors::job_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.jobs.get_job_async(job_id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(job)).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job {job_id} not found")),
        Err(e) => errors::job_error_to_response(e),
    }
}

pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(operator): Extension<OperatorContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.jobs.cancel_job(job_id) {
        Ok(true) => {
            info!(job_id = %job_id, operator = %operator.operator_id(), "job cancel requested");
            (StatusCode::OK, Json(serde_json::json!({ "canceled": true }))).into_response()
        }
        Ok(false) => errors::json_error(
            StatusCode::CONFLICT,
            "cannot_cancel",
            format!("job {job_id} already finished"),
        ),
        Err(e) => errors::job_error_to_response(e),
    }
}

pub async fn retry_failed(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(operator): Extension<OperatorContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    // Unknown or unfinished jobs are rejected before they cost an admission.
    if let Err(e) = services.jobs.retry_candidate(job_id).await {
        return errors::job_error_to_response(e);
    }

    let decision = match enforce_rate_limit(&services, &operator, "retry-failed").await {
        Ok(decision) => decision,
        Err(resp) => return resp,
    };

    let response = match services.jobs.retry_failed_emails(job_id).await {
        Ok(Some(new_id)) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "job_id": new_id.to_string() })),
        )
            .into_response(),
        Ok(None) => (StatusCode::OK, Json(serde_json::json!({ "job_id": null }))).into_response(),
        Err(e) => errors::job_error_to_response(e),
    };
    errors::with_quota(response, &decision)
}
