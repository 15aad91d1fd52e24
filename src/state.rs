//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::sessions::SessionManager;

/// Shared application state for the session server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Manages the pool of active agent sessions.
    pub session_manager: SessionManager,
    /// Broadcast channel for session lifecycle events (created/destroyed/
    /// renamed). Every `/api/events` client subscribes to this.
    pub session_events: broadcast::Sender<Value>,
}
