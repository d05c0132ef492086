use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::context::OperatorContext;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn whoami(Extension(operator): Extension<OperatorContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "operator_id": operator.operator_id().as_str(),
    }))
}
