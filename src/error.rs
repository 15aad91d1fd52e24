//! Crate-wide error taxonomy (SPEC_FULL §4.10, §7).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Errors surfaced at component boundaries and translated to REST/WS responses.
#[derive(Debug, Clone)]
pub enum SessionError {
    /// Referenced session, message, or workspace does not exist.
    NotFound(String),
    /// Operation is invalid for the session's current state (e.g. prompt while prompting).
    InvalidState(String),
    /// The agent subprocess failed or exited unexpectedly.
    AgentFailure(String),
    /// The event store failed to read or write.
    StoreFailure(String),
    /// A bounded wait (e.g. permission response) timed out.
    Timeout(String),
    /// Malformed input from a client.
    BadRequest(String),
}

impl SessionError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::AgentFailure(_) => "AGENT_FAILURE",
            Self::StoreFailure(_) => "STORE_FAILURE",
            Self::Timeout(_) => "TIMEOUT",
            Self::BadRequest(_) => "BAD_REQUEST",
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(m)
            | Self::InvalidState(m)
            | Self::AgentFailure(m)
            | Self::StoreFailure(m)
            | Self::Timeout(m)
            | Self::BadRequest(m) => m,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidState(_) => StatusCode::CONFLICT,
            Self::AgentFailure(_) | Self::StoreFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Render as the flat `{"type":"error", ...}` frame sent over a session WebSocket.
    #[must_use]
    pub fn to_ws_frame(&self) -> serde_json::Value {
        json!({
            "type": "error",
            "code": self.code(),
            "message": self.message(),
        })
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for SessionError {}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.message(),
            "code": self.code(),
        }));
        (status, body).into_response()
    }
}
