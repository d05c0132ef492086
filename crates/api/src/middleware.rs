use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use eventdesk_core::OperatorId;

use crate::context::OperatorContext;

pub const OPERATOR_HEADER: &str = "x-operator-id";

pub async fn operator_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let operator_id = extract_operator(req.headers())?;

    req.extensions_mut()
        .insert(OperatorContext::new(operator_id));

    Ok(next.run(req).await)
}

fn extract_operator(headers: &HeaderMap) -> Result<OperatorId, StatusCode> {
    let header = headers
        .get(OPERATOR_HEADER)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let header = header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;

    OperatorId::new(header).map_err(|_| StatusCode::UNAUTHORIZED)
}
