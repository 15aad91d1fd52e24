//! REST endpoints for the working-dir → agent-command table (SPEC_FULL §4.6).
//!
//! Registering a workspace lets a client create sessions against a
//! `working_dir` without repeating the agent command on every request.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::SessionError;
use crate::sessions::WorkspaceConfig;
use crate::AppState;

#[derive(Deserialize)]
pub struct RegisterWorkspaceRequest {
    pub working_dir: String,
    pub agent_command: Vec<String>,
    #[serde(default = "default_agent_name")]
    pub agent_name: String,
}

fn default_agent_name() -> String {
    "default".to_string()
}

/// `POST /api/workspaces` — register (or overwrite) a workspace's agent command.
pub async fn register_workspace(
    State(state): State<AppState>,
    Json(req): Json<RegisterWorkspaceRequest>,
) -> Result<Json<Value>, SessionError> {
    if req.agent_command.is_empty() {
        return Err(SessionError::BadRequest("agent_command must not be empty".into()));
    }
    state
        .session_manager
        .register_workspace(
            &req.working_dir,
            WorkspaceConfig {
                agent_command: req.agent_command,
                agent_name: req.agent_name,
            },
        )
        .await;
    Ok(Json(json!({ "ok": true, "working_dir": req.working_dir })))
}

/// `GET /api/workspaces` — list all registered workspaces.
pub async fn list_workspaces(State(state): State<AppState>) -> Json<Value> {
    let workspaces = state.session_manager.list_workspaces().await;
    let items: Vec<Value> = workspaces
        .into_iter()
        .map(|(working_dir, cfg)| {
            json!({
                "working_dir": working_dir,
                "agent_command": cfg.agent_command,
                "agent_name": cfg.agent_name,
            })
        })
        .collect();
    Json(json!({ "workspaces": items }))
}

/// `DELETE /api/workspaces/{working_dir}` — unregister a workspace.
///
/// `working_dir` arrives URL-encoded since it's a filesystem path.
pub async fn remove_workspace(
    State(state): State<AppState>,
    Path(working_dir): Path<String>,
) -> Result<Json<Value>, SessionError> {
    let removed = state.session_manager.remove_workspace(&working_dir).await;
    if !removed {
        return Err(SessionError::NotFound(format!(
            "workspace {working_dir} not registered"
        )));
    }
    Ok(Json(json!({ "ok": true })))
}
