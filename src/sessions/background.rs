//! BackgroundSession: the per-session actor (SPEC_FULL §4.5).
//!
//! Owns one [`AgentConnection`], one [`SessionHandle`], and the
//! [`StreamBuffer`] for the turn currently in flight. All mutation funnels
//! through a single command channel so the actor never needs internal
//! locking — the channel itself is the serialization point, mirroring the
//! teacher's `ManagedSession` background-task idiom.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::SessionError;
use crate::sessions::agent::{AgentConnection, AgentMessage};
use crate::sessions::store::{Event, QueuedMessage, SessionHandle, SessionStatus};
use crate::sessions::stream_buffer::StreamBuffer;
use crate::util::now_ms;

/// Where the session currently sits in its turn lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Prompting,
    AwaitingPermission,
    Terminated,
}

type StreamPeek = (u64, String, String);

enum Command {
    SubmitPrompt {
        text: String,
        image_ids: Vec<String>,
        client_id: String,
        prompt_id: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    AnswerPermission {
        outcome: Value,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Rename {
        name: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    /// A new observer wants the in-flight coalescing text, if any, without
    /// waiting for the next flush (SPEC_FULL §4.5, mid-stream join).
    PeekStream {
        reply: oneshot::Sender<Option<StreamPeek>>,
    },
    Shutdown,
    // Internal: the spawned prompt-await task reports back on this channel too.
    PromptComplete {
        result: Result<Value, SessionError>,
    },
    // Internal: the permission timer fires if nobody answered in time.
    PermissionTimeout {
        request_id: String,
    },
}

/// A cheaply cloneable handle to a running session actor.
#[derive(Clone)]
pub struct BackgroundSessionHandle {
    session_id: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
    events_tx: broadcast::Sender<Event>,
    notify_tx: broadcast::Sender<Value>,
    state_rx: watch::Receiver<SessionState>,
}

impl BackgroundSessionHandle {
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    /// Subscribe to ephemeral, non-persisted observer notifications
    /// (`prompt_complete`, `ui_prompt`, `ui_prompt_dismiss`) that carry no
    /// `seq` of their own and are never written to the event store.
    #[must_use]
    pub fn subscribe_notify(&self) -> broadcast::Receiver<Value> {
        self.notify_tx.subscribe()
    }

    /// Peek the currently open coalescing group's accumulated text, if any —
    /// used to catch a newly attached observer up on in-flight content
    /// before the next flush.
    pub async fn peek_stream(&self) -> Option<StreamPeek> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::PeekStream { reply: tx }).ok()?;
        rx.await.ok().flatten()
    }

    async fn call<F>(&self, make: F) -> Result<(), SessionError>
    where
        F: FnOnce(oneshot::Sender<Result<(), SessionError>>) -> Command,
    {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .map_err(|_| SessionError::InvalidState("session actor has shut down".into()))?;
        rx.await
            .map_err(|_| SessionError::InvalidState("session actor dropped the reply".into()))?
    }

    pub async fn submit_prompt(
        &self,
        text: String,
        image_ids: Vec<String>,
        client_id: String,
        prompt_id: String,
    ) -> Result<(), SessionError> {
        self.call(|reply| Command::SubmitPrompt {
            text,
            image_ids,
            client_id,
            prompt_id,
            reply,
        })
        .await
    }

    pub async fn cancel(&self) -> Result<(), SessionError> {
        self.call(|reply| Command::Cancel { reply }).await
    }

    pub async fn answer_permission(&self, outcome: Value) -> Result<(), SessionError> {
        self.call(|reply| Command::AnswerPermission { outcome, reply })
            .await
    }

    pub async fn rename(&self, name: String) -> Result<(), SessionError> {
        self.call(|reply| Command::Rename { name, reply }).await
    }

    /// Request termination; does not wait for the actor to finish tearing
    /// down the agent subprocess.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

const TICK_INTERVAL: Duration = Duration::from_millis(50);
const PERMISSION_EVENT: &str = "permission_request";

struct Actor {
    session_id: String,
    agent: Arc<AgentConnection>,
    agent_session_id: String,
    store: Arc<SessionHandle>,
    events_tx: broadcast::Sender<Event>,
    notify_tx: broadcast::Sender<Value>,
    state_tx: watch::Sender<SessionState>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    stream: StreamBuffer,
    pending_permission_id: Option<Value>,
    pending_permission_request_id: Option<String>,
    pending_permission_timer: Option<JoinHandle<()>>,
    permission_timeout: Duration,
}

impl Actor {
    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: SessionState) {
        let _ = self.state_tx.send(state);
    }

    async fn persist_and_broadcast(&self, kind: &str, data: Value) {
        match self.store.append(kind, data).await {
            Ok(event) => {
                let _ = self.events_tx.send(event);
            }
            Err(e) => error!(session_id = %self.session_id, "failed to persist {kind}: {e}"),
        }
    }

    async fn persist_with_seq(&self, seq: u64, kind: &str, data: Value) {
        match self.store.append_with_seq(seq, kind, data).await {
            Ok(event) => {
                let _ = self.events_tx.send(event);
            }
            Err(e) => error!(session_id = %self.session_id, "failed to persist {kind}: {e}"),
        }
    }

    async fn flush_emitted(&self, emitted: Vec<crate::sessions::stream_buffer::Emitted>) {
        for e in emitted {
            self.persist_with_seq(e.seq, &e.kind, e.data).await;
        }
    }

    fn notify(&self, value: Value) {
        let _ = self.notify_tx.send(value);
    }

    async fn start_prompt(
        &mut self,
        text: String,
        image_ids: Vec<String>,
        client_id: String,
        prompt_id: String,
    ) {
        self.set_state(SessionState::Prompting);
        self.persist_and_broadcast(
            "user_prompt",
            json!({
                "text": text,
                "image_ids": image_ids,
                "client_id": client_id,
                "prompt_id": prompt_id,
            }),
        )
        .await;

        let agent = self.agent.clone();
        let agent_session_id = self.agent_session_id.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = agent.prompt(&agent_session_id, &text, &image_ids).await;
            let _ = cmd_tx.send(Command::PromptComplete { result });
        });
    }

    async fn on_prompt_complete(&mut self, result: Result<Value, SessionError>) {
        let emitted = self.stream.flush_all();
        self.flush_emitted(emitted).await;

        if let Err(e) = result {
            warn!(session_id = %self.session_id, "prompt turn failed: {e}");
            self.persist_and_broadcast("error", json!({ "message": e.message() }))
                .await;
        }

        let meta = self.store.metadata().await;
        self.notify(json!({
            "type": "prompt_complete",
            "event_count": meta.event_count,
            "max_seq": meta.max_seq,
        }));

        self.advance_queue_or_idle().await;
    }

    async fn advance_queue_or_idle(&mut self) {
        match self.store.queue_pop_front().await {
            Ok(Some(QueuedMessage {
                message,
                image_ids,
                client_id,
                prompt_id,
                ..
            })) => {
                self.start_prompt(message, image_ids, client_id, prompt_id).await;
            }
            Ok(None) => self.set_state(SessionState::Idle),
            Err(e) => {
                error!(session_id = %self.session_id, "failed to read queue: {e}");
                self.set_state(SessionState::Idle);
            }
        }
    }

    async fn on_notification(&mut self, msg: Value) {
        let Some(update) = msg.get("params").and_then(|p| p.get("update")) else {
            return;
        };
        let Some(tag) = update.get("sessionUpdate").and_then(Value::as_str) else {
            return;
        };

        let store = &self.store;
        let emitted = match tag {
            "agent_message_chunk" => {
                let text = update["content"]["text"].as_str().unwrap_or("");
                self.stream
                    .ingest_chunk("agent_message", text, || store.next_seq())
            }
            "agent_thought_chunk" => {
                let text = update["content"]["text"].as_str().unwrap_or("");
                self.stream
                    .ingest_chunk("agent_thought", text, || store.next_seq())
            }
            other => {
                let seq = self.store.next_seq();
                self.stream.ingest_event(seq, other, update.clone())
            }
        };
        self.flush_emitted(emitted).await;
    }

    async fn on_permission_request(&mut self, id: Value, params: Value) {
        let request_id = crate::util::new_session_id();
        self.pending_permission_id = Some(id);
        self.pending_permission_request_id = Some(request_id.clone());
        self.set_state(SessionState::AwaitingPermission);
        self.persist_and_broadcast(PERMISSION_EVENT, params.clone()).await;
        self.notify(json!({
            "type": "ui_prompt",
            "request_id": request_id,
            "data": params,
        }));

        let cmd_tx = self.cmd_tx.clone();
        let timeout = self.permission_timeout;
        let timer_request_id = request_id;
        self.pending_permission_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = cmd_tx.send(Command::PermissionTimeout {
                request_id: timer_request_id,
            });
        }));
    }

    async fn on_permission_timeout(&mut self, request_id: String) {
        if self.pending_permission_request_id.as_deref() != Some(request_id.as_str()) {
            return;
        }
        self.pending_permission_request_id = None;
        self.pending_permission_timer = None;
        if let Some(id) = self.pending_permission_id.take() {
            if let Err(e) = self.agent.respond_permission(id, json!({ "outcome": "denied" })).await {
                warn!(session_id = %self.session_id, "failed to deny timed-out permission request: {e}");
            }
        }
        self.notify(json!({
            "type": "ui_prompt_dismiss",
            "request_id": request_id,
            "reason": "timeout",
        }));
        self.set_state(SessionState::Prompting);
    }

    async fn answer_permission(&mut self, outcome: Value) -> Result<(), SessionError> {
        let id = self
            .pending_permission_id
            .take()
            .ok_or_else(|| SessionError::InvalidState("no permission request pending".into()))?;
        self.pending_permission_request_id = None;
        if let Some(timer) = self.pending_permission_timer.take() {
            timer.abort();
        }
        self.agent.respond_permission(id, outcome).await?;
        self.set_state(SessionState::Prompting);
        Ok(())
    }

    async fn cancel(&mut self) -> Result<(), SessionError> {
        if self.state() == SessionState::Idle {
            return Err(SessionError::InvalidState("session is not running a turn".into()));
        }
        self.agent.cancel(&self.agent_session_id).await;
        Ok(())
    }

    async fn on_agent_exited(&mut self, code: Option<i32>) {
        warn!(session_id = %self.session_id, ?code, "agent process exited");
        self.set_state(SessionState::Terminated);
        let status = if code.unwrap_or(1) == 0 {
            SessionStatus::Completed
        } else {
            SessionStatus::Error
        };
        if let Err(e) = self.store.set_status(status).await {
            error!(session_id = %self.session_id, "failed to persist terminal status: {e}");
        }
        self.persist_and_broadcast("session_end", json!({ "exit_code": code }))
            .await;
    }
}

/// Spawn the agent subprocess, perform the handshake, record `session_start`,
/// and start the actor loop. Returns a handle once the session is ready to
/// accept commands.
pub async fn spawn(
    session_id: String,
    agent_argv: Vec<String>,
    working_dir: String,
    store: Arc<SessionHandle>,
    soft_timeout_ms: u64,
    hard_limit_bytes: usize,
    events_capacity: usize,
    permission_timeout_secs: u64,
) -> Result<BackgroundSessionHandle, SessionError> {
    let (agent, agent_rx) = AgentConnection::spawn(&agent_argv, &working_dir).await?;
    agent.initialize().await?;
    let agent_session_id = agent.new_session(&working_dir).await?;

    store
        .append(
            "session_start",
            json!({ "working_dir": working_dir, "agent_command": agent_argv }),
        )
        .await?;

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (events_tx, _) = broadcast::channel(events_capacity);
    let (notify_tx, _) = broadcast::channel(events_capacity);
    let (state_tx, state_rx) = watch::channel(SessionState::Idle);

    let actor = Actor {
        session_id: session_id.clone(),
        agent: Arc::new(agent),
        agent_session_id,
        store,
        events_tx: events_tx.clone(),
        notify_tx: notify_tx.clone(),
        state_tx,
        cmd_tx: cmd_tx.clone(),
        stream: StreamBuffer::new(soft_timeout_ms, hard_limit_bytes),
        pending_permission_id: None,
        pending_permission_request_id: None,
        pending_permission_timer: None,
        permission_timeout: Duration::from_secs(permission_timeout_secs),
    };

    let _join: JoinHandle<()> = tokio::spawn(run(actor, cmd_rx, agent_rx));

    Ok(BackgroundSessionHandle {
        session_id,
        cmd_tx,
        events_tx,
        notify_tx,
        state_rx,
    })
}

async fn run(
    mut actor: Actor,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut agent_rx: mpsc::UnboundedReceiver<AgentMessage>,
) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    info!(session_id = %actor.session_id, "session actor started");

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::SubmitPrompt { text, image_ids, client_id, prompt_id, reply }) => {
                        let res = if actor.state() == SessionState::Idle {
                            actor.start_prompt(text, image_ids, client_id, prompt_id).await;
                            Ok(())
                        } else {
                            let queued = QueuedMessage {
                                id: crate::util::new_session_id(),
                                message: text,
                                image_ids,
                                queued_at: now_ms(),
                                client_id,
                                prompt_id,
                            };
                            actor.store.queue_push(queued).await
                        };
                        let _ = reply.send(res);
                    }
                    Some(Command::Cancel { reply }) => {
                        let res = actor.cancel().await;
                        let _ = reply.send(res);
                    }
                    Some(Command::AnswerPermission { outcome, reply }) => {
                        let res = actor.answer_permission(outcome).await;
                        let _ = reply.send(res);
                    }
                    Some(Command::Rename { name, reply }) => {
                        let res = actor.store.rename(&name).await;
                        let _ = reply.send(res);
                    }
                    Some(Command::PeekStream { reply }) => {
                        let peek = actor
                            .stream
                            .peek()
                            .map(|(seq, kind, text)| (seq, kind.to_string(), text.to_string()));
                        let _ = reply.send(peek);
                    }
                    Some(Command::PromptComplete { result }) => {
                        actor.on_prompt_complete(result).await;
                    }
                    Some(Command::PermissionTimeout { request_id }) => {
                        actor.on_permission_timeout(request_id).await;
                    }
                    Some(Command::Shutdown) | None => {
                        actor.agent.shutdown().await;
                        actor.set_state(SessionState::Terminated);
                        break;
                    }
                }
            }
            msg = agent_rx.recv() => {
                match msg {
                    Some(AgentMessage::Notification(v)) => actor.on_notification(v).await,
                    Some(AgentMessage::PermissionRequest { id, params }) => {
                        actor.on_permission_request(id, params).await;
                    }
                    Some(AgentMessage::Exited(code)) => {
                        actor.on_agent_exited(code).await;
                        break;
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                let emitted = actor.stream.tick(Instant::now());
                actor.flush_emitted(emitted).await;
            }
        }
    }

    info!(session_id = %actor.session_id, "session actor stopped");
}
