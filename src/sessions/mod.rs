//! Session lifecycle management (SPEC_FULL §4.6).
//!
//! [`SessionManager`] is the single authority for creating, looking up, and
//! destroying agent sessions. It enforces `max_sessions` and holds the
//! write lock across the whole check-and-insert in [`Self::create_session`]
//! to prevent TOCTOU races.
//!
//! ## Concurrency
//!
//! The registry and workspace table are each behind an `RwLock`. Read
//! operations (lookup, list) take a read lock; mutations take a write lock.

pub mod agent;
pub mod background;
pub mod store;
pub mod stream_buffer;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::SessionError;
use crate::util::new_session_id;
use background::{BackgroundSessionHandle, SessionState};
use store::{EventStore, SessionMetadata};

/// Agent command + display name associated with a working directory, so a
/// client can create a session by `working_dir` alone after registering it
/// once.
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    pub agent_command: Vec<String>,
    pub agent_name: String,
}

/// Manages the pool of active agent sessions.
///
/// Cloneable — all clones share the same inner `Arc<RwLock<...>>`.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<tokio::sync::RwLock<HashMap<String, BackgroundSessionHandle>>>,
    workspaces: Arc<tokio::sync::RwLock<HashMap<String, WorkspaceConfig>>>,
    store: EventStore,
    config: Arc<Config>,
}

impl SessionManager {
    #[must_use]
    pub fn new(store: EventStore, config: Arc<Config>) -> Self {
        Self {
            sessions: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            workspaces: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            store,
            config,
        }
    }

    /// Register (or overwrite) the agent command used for sessions created
    /// against `working_dir` without an explicit agent override.
    pub async fn register_workspace(&self, working_dir: &str, cfg: WorkspaceConfig) {
        self.workspaces
            .write()
            .await
            .insert(working_dir.to_string(), cfg);
    }

    pub async fn get_workspace(&self, working_dir: &str) -> Option<WorkspaceConfig> {
        self.workspaces.read().await.get(working_dir).cloned()
    }

    pub async fn list_workspaces(&self) -> HashMap<String, WorkspaceConfig> {
        self.workspaces.read().await.clone()
    }

    pub async fn remove_workspace(&self, working_dir: &str) -> bool {
        self.workspaces.write().await.remove(working_dir).is_some()
    }

    /// Create and start a new session. Holds the write lock across the
    /// limit-check and insert to prevent two concurrent callers from both
    /// squeezing past `max_sessions`.
    pub async fn create_session(
        &self,
        working_dir: &str,
        name: Option<String>,
    ) -> Result<BackgroundSessionHandle, SessionError> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.config.server.max_sessions {
            return Err(SessionError::BadRequest(format!(
                "session limit reached (max {})",
                self.config.server.max_sessions
            )));
        }

        let workspace = self.workspaces.read().await.get(working_dir).cloned();
        let (agent_command, agent_name) = match workspace {
            Some(w) => (w.agent_command, w.agent_name),
            None => (self.config.agent.command.clone(), self.config.agent.name.clone()),
        };

        let session_id = new_session_id();
        let handle_store = self
            .store
            .create(&session_id, &agent_name, working_dir, name)
            .await?;

        let handle = background::spawn(
            session_id.clone(),
            agent_command,
            working_dir.to_string(),
            Arc::new(handle_store),
            self.config.server.buffer_soft_timeout_ms,
            self.config.server.buffer_hard_limit_bytes,
            self.config.server.observer_channel_capacity,
            self.config.permission.timeout_secs,
        )
        .await?;

        sessions.insert(session_id, handle.clone());
        info!(
            "session {} created (agent={agent_name}, total: {})",
            handle.session_id(),
            sessions.len()
        );
        Ok(handle)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<BackgroundSessionHandle, SessionError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(format!("session {session_id} not found")))
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// List metadata for every session persisted to disk, including ones
    /// whose in-memory actor has already terminated and been swept.
    pub async fn list_sessions(&self) -> Result<Vec<SessionMetadata>, SessionError> {
        self.store.list_sessions().await
    }

    /// List a session's queued, not-yet-submitted messages. Reopens the
    /// on-disk handle rather than routing through the actor, since
    /// `queue.json` is the durable source of truth and its atomic-rewrite
    /// reads/writes are independent of whatever turn the actor is running.
    pub async fn session_queue(&self, session_id: &str) -> Result<Vec<store::QueuedMessage>, SessionError> {
        self.store.open(session_id).await?.queue_list().await
    }

    pub async fn queue_push(
        &self,
        session_id: &str,
        msg: store::QueuedMessage,
    ) -> Result<(), SessionError> {
        self.store.open(session_id).await?.queue_push(msg).await
    }

    pub async fn queue_remove(&self, session_id: &str, queue_id: &str) -> Result<bool, SessionError> {
        self.store.open(session_id).await?.queue_remove(queue_id).await
    }

    /// Fetch a session's on-disk metadata summary (status, `max_seq`,
    /// `event_count`, ...), reopening the handle rather than routing through
    /// the actor for the same reason as [`Self::session_queue`].
    pub async fn session_metadata(&self, session_id: &str) -> Result<SessionMetadata, SessionError> {
        Ok(self.store.open(session_id).await?.metadata().await)
    }

    /// The most recently persisted `user_prompt` event's `prompt_id`/`seq`,
    /// for a fresh connection's `connected` frame (SPEC_FULL §4.7).
    pub async fn last_user_prompt(
        &self,
        session_id: &str,
    ) -> Result<Option<(String, u64)>, SessionError> {
        self.store.open(session_id).await?.last_user_prompt().await
    }

    /// Read the newest `limit` events with `seq < before_seq` (0 = newest),
    /// for a fresh connection's initial catch-up.
    pub async fn read_last_events(
        &self,
        session_id: &str,
        limit: usize,
        before_seq: u64,
    ) -> Result<(Vec<store::Event>, bool), SessionError> {
        self.store.open(session_id).await?.read_last(limit, before_seq).await
    }

    /// Read events with `seq > after_seq`, for reconnect resync and
    /// broadcast-lag recovery.
    pub async fn read_events_from(
        &self,
        session_id: &str,
        after_seq: u64,
        limit: usize,
    ) -> Result<(Vec<store::Event>, bool), SessionError> {
        self.store.open(session_id).await?.read_from(after_seq, limit).await
    }

    /// Shut down (if running) and delete a session's persisted state.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), SessionError> {
        if let Some(handle) = self.sessions.write().await.remove(session_id) {
            handle.shutdown();
        }
        self.store.delete_session(session_id).await
    }

    /// Gracefully shut down every running session (used during server
    /// shutdown).
    pub async fn kill_all(&self) {
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        if count == 0 {
            return;
        }
        for (id, handle) in sessions.iter() {
            handle.shutdown();
            info!("session {id}: shutdown requested (server stopping)");
        }
        drop(sessions);

        // Each actor runs its own SIGTERM→grace→SIGKILL sequence on the agent
        // subprocess; give them the same window to finish before we exit.
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        self.sessions.write().await.clear();
        info!("shut down {count} session(s)");
    }

    /// Periodic sweep: drop registry entries whose actor has terminated so
    /// the in-memory map doesn't grow without bound. The on-disk record
    /// (and its terminal status) is left untouched.
    pub async fn sweep(&self) -> Vec<String> {
        {
            let sessions = self.sessions.read().await;
            if sessions.is_empty() {
                return Vec::new();
            }
        }

        let mut sessions = self.sessions.write().await;
        let terminated: Vec<String> = sessions
            .iter()
            .filter(|(_, h)| h.state() == SessionState::Terminated)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &terminated {
            sessions.remove(id);
            info!(
                "session {id}: removed from registry (terminated), remaining: {}",
                sessions.len()
            );
        }
        terminated
    }

    /// Load session metadata from disk and warn about sessions that were
    /// active when the server last stopped — their agent processes are gone
    /// and they won't auto-resume. Called once at startup.
    pub async fn reconcile_on_startup(&self) {
        match self.store.list_sessions().await {
            Ok(metas) => {
                let active = metas
                    .iter()
                    .filter(|m| m.status == store::SessionStatus::Active)
                    .count();
                if active > 0 {
                    warn!(
                        "{active} session(s) were active at last shutdown; their agent \
                         processes are gone and they will not auto-resume"
                    );
                }
            }
            Err(e) => warn!("failed to list sessions during startup reconciliation: {e}"),
        }
    }
}
