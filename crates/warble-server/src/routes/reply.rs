use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::{
    convert::Infallible,
    pin::Pin,
    task::{Context, Poll},
};
use tokio_stream::wrappers::ReceiverStream;
use warble::agent::TurnRequest;
use warble::events::TurnEvent;

/// Turn events framed as server-sent events, one `data:` frame per event
pub struct SseResponse {
    rx: ReceiverStream<TurnEvent>,
}

impl SseResponse {
    fn new(rx: ReceiverStream<TurnEvent>) -> Self {
        Self { rx }
    }

    fn frame(event: &TurnEvent) -> Bytes {
        match serde_json::to_string(event) {
            Ok(json) => Bytes::from(format!("data: {}\n\n", json)),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode turn event");
                Bytes::new()
            }
        }
    }
}

impl Stream for SseResponse {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx).map(|opt| {
            opt.map(|event| {
                if event.is_terminal() {
                    tracing::info!("reply finished");
                }
                Ok(Self::frame(&event))
            })
        })
    }
}

impl IntoResponse for SseResponse {
    fn into_response(self) -> Response {
        let body = axum::body::Body::from_stream(self);
        (
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
                (header::CONNECTION, "keep-alive"),
            ],
            body,
        )
            .into_response()
    }
}

async fn handler(
    State(state): State<AppState>,
    Json(request): Json<TurnRequest>,
) -> Result<SseResponse, ApiError> {
    let handle = state.agent.submit(request).await?;
    tracing::info!(conversation = %handle.conversation_id, "reply started");
    Ok(SseResponse::new(handle.events))
}

#[derive(Debug, Deserialize, Serialize)]
struct CancelRequest {
    conversation_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct CancelResponse {
    /// False when the conversation had no running turn
    cancelled: bool,
}

async fn cancel_handler(
    State(state): State<AppState>,
    Json(request): Json<CancelRequest>,
) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.agent.cancel(&request.conversation_id),
    })
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/reply", post(handler))
        .route("/reply/cancel", post(cancel_handler))
        .with_state(state)
}
