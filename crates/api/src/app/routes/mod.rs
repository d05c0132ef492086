use axum::{routing::get, Router};

pub mod checkpoints;
pub mod job_stream;
pub mod jobs;
pub mod system;

/// Router for all operator-scoped endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .nest("/jobs", jobs::router())
        .merge(checkpoints::router())
}
