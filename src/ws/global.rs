//! Global Events Channel (SPEC_FULL §4.8/§6.3).
//!
//! A single `/api/events` WebSocket endpoint broadcasting session lifecycle
//! events (`session.created`, `session.destroyed`, `session.renamed`, ...) to
//! every connected client. Ordering here is independent of any per-session
//! event stream — this channel only carries lifecycle notifications, never
//! turn content.

use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tracing::info;

use crate::AppState;

/// `GET /api/events` — global lifecycle event stream.
pub async fn global_ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_global_ws(socket, state))
}

async fn handle_global_ws(socket: axum::extract::ws::WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let mut rx = state.session_events.subscribe();
    info!("global events client connected");

    loop {
        tokio::select! {
            msg = ws_stream.next() => {
                // This endpoint is output-only; any inbound traffic (including
                // the close frame) just needs to keep the read half draining.
                if !matches!(msg, Some(Ok(_))) {
                    break;
                }
            }
            event = rx.recv() => {
                match event {
                    Ok(value) => {
                        let Ok(text) = serde_json::to_string(&value) else { continue };
                        if ws_sink.send(axum::extract::ws::Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("global events client lagged, skipped {skipped} message(s)");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    info!("global events client disconnected");
}
