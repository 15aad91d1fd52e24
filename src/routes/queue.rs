//! REST endpoints for a session's queued-message FIFO (SPEC_FULL §4.6/§6.4).
//!
//! Submitting a prompt normally happens over the per-session WebSocket, but a
//! client that isn't connected yet (or wants to queue ahead) can push onto
//! the same FIFO the actor drains between turns.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::SessionError;
use crate::sessions::store::QueuedMessage;
use crate::util::{new_session_id, now_ms};
use crate::AppState;

#[derive(Deserialize)]
pub struct QueueRequest {
    pub message: String,
    #[serde(default)]
    pub image_ids: Vec<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub prompt_id: String,
}

fn default_client_id() -> String {
    "rest".to_string()
}

/// `GET /api/sessions/{id}/queue` — list queued, not-yet-submitted messages.
pub async fn list_queue(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, SessionError> {
    let messages = state.session_manager.session_queue(&id).await?;
    Ok(Json(json!({ "messages": messages })))
}

/// `POST /api/sessions/{id}/queue` — append a message to the FIFO.
pub async fn push_queue(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<QueueRequest>,
) -> Result<Json<Value>, SessionError> {
    let queued = QueuedMessage {
        id: new_session_id(),
        message: req.message,
        image_ids: req.image_ids,
        queued_at: now_ms(),
        client_id: req.client_id,
        prompt_id: req.prompt_id,
    };
    state.session_manager.queue_push(&id, queued.clone()).await?;
    Ok(Json(json!({ "ok": true, "queued": queued })))
}

/// `DELETE /api/sessions/{id}/queue/{queue_id}` — remove one queued message.
pub async fn remove_queue_item(
    State(state): State<AppState>,
    Path((id, queue_id)): Path<(String, String)>,
) -> Result<Json<Value>, SessionError> {
    let removed = state.session_manager.queue_remove(&id, &queue_id).await?;
    if !removed {
        return Err(SessionError::NotFound(format!(
            "queued message {queue_id} not found in session {id}"
        )));
    }
    Ok(Json(json!({ "ok": true })))
}
