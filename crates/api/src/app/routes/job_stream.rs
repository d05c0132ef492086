//! Live job status over Server-Sent Events.
//!
//! Frames map to SSE as: snapshot -> `status`, incremental change ->
//! `message`, heartbeat -> comment line. The stream ends after the terminal
//! event; a dropped connection tears the forwarding task down.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    response::{
        sse::{Event as SseEvent, Sse},
        IntoResponse,
    },
};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};

use eventdesk_infra::jobs::StreamFrame;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// GET /jobs/:id/stream
pub async fn stream_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let frames = match services.streamer.open(job_id).await {
        Ok(rx) => rx,
        Err(e) => return errors::job_error_to_response(e),
    };

    let stream = ReceiverStream::new(frames).map(frame_to_event);
    Sse::new(stream).into_response()
}

fn frame_to_event(frame: StreamFrame) -> Result<SseEvent, axum::Error> {
    match frame {
        StreamFrame::Status(job) => SseEvent::default().event("status").json_data(job),
        StreamFrame::Message(event) => SseEvent::default().event("message").json_data(event),
        StreamFrame::Heartbeat => Ok(SseEvent::default().comment("keep-alive")),
    }
}
