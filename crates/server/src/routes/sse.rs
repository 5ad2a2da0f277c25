use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use events::ProgressEvent;
use futures::stream::{Stream, StreamExt};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

fn progress_to_sse_event(event: &ProgressEvent) -> Result<Event, Infallible> {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());

    Ok(Event::default()
        .id(event.sequence.to_string())
        .event(event.event_name())
        .data(data))
}

/// Sequence number from a reconnecting client's `Last-Event-ID` header.
fn last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("Last-Event-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

#[utoipa::path(
    get,
    path = "/api/runs/{id}/events",
    params(
        ("id" = Uuid, Path, description = "Run ID"),
    ),
    responses(
        (status = 200, description = "SSE progress stream, closed after the terminal event"),
        (status = 404, description = "Run not found"),
    ),
    tag = "events"
)]
pub async fn run_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let resume_after = last_event_id(&headers).unwrap_or(0);
    let stream = state.orchestrator.subscribe(id)?;
    tracing::debug!(run_id = %id, resume_after, "SSE subscriber attached");

    let stream = stream
        .filter(move |event| std::future::ready(event.sequence > resume_after))
        .map(|event| progress_to_sse_event(&event));

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.keep_alive)
            .text("keep-alive"),
    ))
}
