//! REST endpoints for session management.
//!
//! - `POST   /api/sessions`           — create a session
//! - `GET    /api/sessions`           — list all sessions
//! - `GET    /api/sessions/{id}`      — session metadata + live state
//! - `PATCH  /api/sessions/{id}`      — rename
//! - `DELETE /api/sessions/{id}`      — kill and delete
//! - `POST   /api/sessions/{id}/cancel` — cancel the in-flight turn

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::SessionError;
use crate::sessions::background::SessionState;
use crate::AppState;

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub working_dir: String,
    pub name: Option<String>,
}

/// `POST /api/sessions` — create and start a new session.
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<Value>, SessionError> {
    let handle = state
        .session_manager
        .create_session(&req.working_dir, req.name)
        .await?;

    let _ = state.session_events.send(json!({
        "type": "session.created",
        "session_id": handle.session_id(),
        "working_dir": req.working_dir,
    }));

    Ok(Json(json!({
        "session_id": handle.session_id(),
        "state": handle.state(),
    })))
}

/// `GET /api/sessions` — list all sessions, disk metadata merged with live state.
pub async fn list_sessions(State(state): State<AppState>) -> Result<Json<Value>, SessionError> {
    let metas = state.session_manager.list_sessions().await?;
    let mut sessions_json = Vec::with_capacity(metas.len());
    for meta in metas {
        let live_state = match state.session_manager.get_session(&meta.session_id).await {
            Ok(h) => h.state(),
            Err(_) => SessionState::Terminated,
        };
        sessions_json.push(json!({
            "session_id": meta.session_id,
            "acp_server": meta.acp_server,
            "working_dir": meta.working_dir,
            "name": meta.name,
            "created_at": meta.created_at,
            "updated_at": meta.updated_at,
            "event_count": meta.event_count,
            "status": meta.status,
            "state": live_state,
        }));
    }
    Ok(Json(json!({ "sessions": sessions_json })))
}

/// `GET /api/sessions/{id}` — session metadata plus live actor state.
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, SessionError> {
    let handle = state.session_manager.get_session(&id).await;
    let metas = state.session_manager.list_sessions().await?;
    let meta = metas
        .into_iter()
        .find(|m| m.session_id == id)
        .ok_or_else(|| SessionError::NotFound(format!("session {id} not found")))?;

    let live_state = handle.as_ref().map(|h| h.state()).unwrap_or(SessionState::Terminated);
    Ok(Json(json!({
        "session_id": meta.session_id,
        "acp_server": meta.acp_server,
        "working_dir": meta.working_dir,
        "name": meta.name,
        "created_at": meta.created_at,
        "updated_at": meta.updated_at,
        "event_count": meta.event_count,
        "max_seq": meta.max_seq,
        "status": meta.status,
        "state": live_state,
    })))
}

#[derive(Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

/// `PATCH /api/sessions/{id}` — rename a session.
pub async fn rename_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RenameRequest>,
) -> Result<Json<Value>, SessionError> {
    let handle = state.session_manager.get_session(&id).await?;
    handle.rename(req.name.clone()).await?;

    let _ = state.session_events.send(json!({
        "type": "session.renamed",
        "session_id": id,
        "name": req.name,
    }));

    Ok(Json(json!({ "ok": true, "session_id": id })))
}

/// `DELETE /api/sessions/{id}` — kill the agent process (if running) and
/// remove the session's persisted state.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, SessionError> {
    state.session_manager.delete_session(&id).await?;

    let _ = state.session_events.send(json!({
        "type": "session.destroyed",
        "session_id": id,
        "reason": "deleted",
    }));

    Ok(Json(json!({ "ok": true, "session_id": id })))
}

/// `POST /api/sessions/{id}/cancel` — cancel the in-flight prompt turn.
pub async fn cancel_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, SessionError> {
    let handle = state.session_manager.get_session(&id).await?;
    handle.cancel().await?;
    Ok(Json(json!({ "ok": true, "session_id": id })))
}
