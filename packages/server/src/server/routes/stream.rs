//! SSE streaming endpoint for live job status.
//!
//! GET /api/jobs/:job_id/stream
//!
//! Subscribes to the status hub for one job and forwards every
//! `job_update` envelope as an SSE event. Auth is the same shared-secret
//! middleware as the rest of `/api/*`.

use std::convert::Infallible;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{self, StreamExt};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::server::app::AxumAppState;

/// SSE stream handler.
///
/// Emits a `connected` event, then one `job_update` per hub publish. A
/// consumer that falls behind the channel buffer gets a `lagged` event with
/// the number of missed messages instead of silently dropping them.
pub async fn job_stream_handler(
    Extension(state): Extension<AxumAppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    // Unknown jobs get a 404 rather than an empty stream.
    state
        .deps
        .store
        .load_job(job_id)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;

    let rx = state.deps.status_hub.subscribe(job_id).await;

    let connected =
        stream::once(async { Ok::<_, Infallible>(Event::default().event("connected").data("ok")) });

    let events = BroadcastStream::new(rx).filter_map(|result| async {
        match result {
            Ok(value) => Event::default()
                .event("job_update")
                .json_data(&value)
                .ok()
                .map(Ok),
            Err(BroadcastStreamRecvError::Lagged(n)) => Event::default()
                .event("lagged")
                .json_data(&serde_json::json!({"missed": n}))
                .ok()
                .map(Ok),
        }
    });

    Ok(Sse::new(connected.chain(events)).keep_alive(KeepAlive::default()))
}
