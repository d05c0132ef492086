//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: backend selection and background tasks
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request DTOs, response mapping, path/query parsing
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::{build_services, AppServices, StartupError};

/// Build the full HTTP router around already-constructed services.
pub fn build_app(services: Arc<AppServices>) -> Router {
    // Operator-scoped routes: require the operator header.
    let protected = routes::router()
        .layer(Extension(services))
        .layer(axum::middleware::from_fn(middleware::operator_middleware));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
        .layer(ServiceBuilder::new())
}
