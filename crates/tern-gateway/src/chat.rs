use std::convert::Infallible;

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use tern_agents::{ChatEvent, ChatRequestInput};
use tern_common::CancellationToken;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::api::AuthUser;
use crate::state::SharedState;

/// Upper bound on one typed message. Attachments ride in the same body and
/// get generous headroom from the router's body limit instead.
const MAX_MESSAGE_BYTES: usize = 32 * 1024;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Cancels the request token when the response body is dropped, which is
/// how a client disconnect becomes the shared cancellation signal.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// POST /api/chat: the streaming endpoint. Events are written as they
/// occur, one `marker{json}` line each; exactly one of `done`/`error`
/// terminates the stream.
pub async fn chat(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Json(input): Json<ChatRequestInput>,
) -> Response {
    if input.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "message": "message must not be empty" })),
        )
            .into_response();
    }
    if input.message.len() > MAX_MESSAGE_BYTES {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "status": "error",
                "message": format!("message exceeds the {MAX_MESSAGE_BYTES} byte limit"),
            })),
        )
            .into_response();
    }

    let (tx, rx) = mpsc::channel::<ChatEvent>(EVENT_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();

    let orchestrator = state.orchestrator();
    let request_cancel = cancel.clone();
    tokio::spawn(async move {
        orchestrator.run(&user, input, tx, request_cancel).await;
        debug!("chat request task finished");
    });

    let guard = CancelOnDrop(cancel);
    let body = ReceiverStream::new(rx).map(move |event| {
        // Keeps the guard alive for the life of the stream; dropping the
        // body cancels the in-flight request.
        let _ = &guard;
        Ok::<_, Infallible>(Bytes::from(format!("{}\n", event.encode())))
    });

    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}
