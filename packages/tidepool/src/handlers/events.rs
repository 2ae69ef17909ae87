use axum::{
    body::Body,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use std::convert::Infallible;

use crate::AppState;
use crate::auth::AuthUser;

/// `GET /api/todos/events` — the live event stream.
///
/// Registers an authenticated connection with the registry and serves its
/// frames as `text/event-stream`. When the client goes away, axum drops the
/// body stream and the registry deregisters the connection through the
/// stream's guard.
pub async fn todo_events(State(state): State<AppState>, user: AuthUser) -> Response {
    let Some(stream) = state.events.subscribe(&user.user_id).await else {
        // registry already shut down; nothing to stream
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let body = Body::from_stream(stream.map(Ok::<_, Infallible>));
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}
