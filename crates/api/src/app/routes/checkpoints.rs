use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::OperatorContext;

pub fn router() -> Router {
    Router::new()
        .route("/events/:event_id/checkpoints", post(record_scan))
        .route("/events/:event_id/checkpoints/stats", get(stats))
        .route("/events/:event_id/checkpoints/history", get(history))
        .route(
            "/events/:event_id/checkpoints/:rsvp_id/:checkpoint_type",
            delete(delete_scan),
        )
}

pub async fn record_scan(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(operator): Extension<OperatorContext>,
    Path(event_id): Path<String>,
    Json(body): Json<dto::RecordScanRequest>,
) -> axum::response::Response {
    let parsed = dto::parse_event_id(&event_id).and_then(|event_id| {
        let rsvp_id = dto::parse_rsvp_id(&body.rsvp_id)?;
        let kind = dto::parse_checkpoint_type(&body.checkpoint_type)?;
        Ok((event_id, rsvp_id, kind))
    });
    let (event_id, rsvp_id, kind) = match parsed {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services
        .ledger
        .record_scan(event_id, rsvp_id, kind, operator.operator_id())
        .await
    {
        Ok(outcome) => {
            let status = if outcome.created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            (status, Json(serde_json::json!({ "created": outcome.created }))).into_response()
        }
        Err(e) => errors::ledger_error_to_response(e),
    }
}

pub async fn delete_scan(
    Extension(services): Extension<Arc<AppServices>>,
    Path((event_id, rsvp_id, checkpoint_type)): Path<(String, String, String)>,
) -> axum::response::Response {
    let parsed = dto::parse_event_id(&event_id).and_then(|event_id| {
        let rsvp_id = dto::parse_rsvp_id(&rsvp_id)?;
        let kind = dto::parse_checkpoint_type(&checkpoint_type)?;
        Ok((event_id, rsvp_id, kind))
    });
    let (event_id, rsvp_id, kind) = match parsed {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.ledger.delete_scan(rsvp_id, event_id, kind).await {
        Ok(deleted) => (StatusCode::OK, Json(serde_json::json!({ "deleted": deleted }))).into_response(),
        Err(e) => errors::ledger_error_to_response(e),
    }
}

pub async fn stats(
    Extension(services): Extension<Arc<AppServices>>,
    Path(event_id): Path<String>,
) -> axum::response::Response {
    let event_id = match dto::parse_event_id(&event_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.ledger.stats(event_id).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => errors::ledger_error_to_response(e),
    }
}

pub async fn history(
    Extension(services): Extension<Arc<AppServices>>,
    Path(event_id): Path<String>,
    Query(params): Query<dto::HistoryParams>,
) -> axum::response::Response {
    let event_id = match dto::parse_event_id(&event_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let query = match params.into_query() {
        Ok(q) => q,
        Err(resp) => return resp,
    };

    match services.ledger.history(event_id, &query).await {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(e) => errors::ledger_error_to_response(e),
    }
}
