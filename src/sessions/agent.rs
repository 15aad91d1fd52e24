//! Agent Connection: subprocess lifecycle and line-delimited JSON-RPC framing
//! (SPEC_FULL §4.4).
//!
//! Grounded on the ACP process manager pattern (pending-oneshot map keyed by
//! request id, a single background reader dispatching by message shape) and
//! on the teacher's process-group spawning and graceful-kill idiom so the
//! whole subprocess tree can be torn down with one signal.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::error::SessionError;

const GRACEFUL_KILL_TIMEOUT: Duration = Duration::from_secs(3);
const GRACEFUL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Messages the reader task hands up to the owning `BackgroundSession`.
pub enum AgentMessage {
    /// A `session/update` (or other) notification from the agent.
    Notification(Value),
    /// The agent is asking the user to approve/deny a tool call; the caller
    /// must eventually call [`AgentConnection::respond_permission`] with the
    /// same `id`.
    PermissionRequest { id: Value, params: Value },
    /// The subprocess exited.
    Exited(Option<i32>),
}

/// A live connection to one agent subprocess.
pub struct AgentConnection {
    stdin: Arc<Mutex<ChildStdin>>,
    pid: i32,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
}

impl AgentConnection {
    /// Spawn `argv[0] argv[1..]` as a process-group leader in `cwd`, wire up
    /// the background reader, and return the connection plus a channel of
    /// [`AgentMessage`]s.
    pub async fn spawn(
        argv: &[String],
        cwd: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AgentMessage>), SessionError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SessionError::BadRequest("agent command must not be empty".into()))?;

        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .current_dir(cwd)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        // SAFETY: setpgid(0, 0) only touches the about-to-exec child process's
        // own process group, making it (and anything it forks) killable as a
        // unit via the negative pid in `send_signal`.
        unsafe {
            command.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|e| SessionError::AgentFailure(format!("spawn {program}: {e}")))?;

        let pid = child
            .id()
            .ok_or_else(|| SessionError::AgentFailure("child has no pid".into()))?
            as i32;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::AgentFailure("no stdin on child".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::AgentFailure("no stdout on child".into()))?;
        let stderr = child.stderr.take();

        let stdin = Arc::new(Mutex::new(stdin));
        let alive = Arc::new(AtomicBool::new(true));
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(stderr) = stderr {
            tokio::spawn(drain_stderr(stderr, pid));
        }

        tokio::spawn(reader_task(
            stdout,
            stdin.clone(),
            pending.clone(),
            alive.clone(),
            tx.clone(),
            pid,
        ));

        tokio::spawn(exit_watcher(child, alive.clone(), pending.clone(), tx));

        Ok((
            Self {
                stdin,
                pid,
                pending,
                next_id: AtomicU64::new(1),
                alive,
            },
            rx,
        ))
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn pid(&self) -> i32 {
        self.pid
    }

    async fn write_line(&self, value: &Value) -> Result<(), SessionError> {
        let mut line = serde_json::to_vec(value)
            .map_err(|e| SessionError::AgentFailure(format!("serialize request: {e}")))?;
        line.push(b'\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(&line)
            .await
            .map_err(|e| SessionError::AgentFailure(format!("write to agent stdin: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| SessionError::AgentFailure(format!("flush agent stdin: {e}")))
    }

    /// Send a JSON-RPC request and wait for the correlated response.
    pub async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, SessionError> {
        if !self.is_alive() {
            return Err(SessionError::AgentFailure("agent process is not alive".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(e) = self.write_line(&request).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(msg))) => Err(SessionError::AgentFailure(msg)),
            Ok(Err(_)) => Err(SessionError::AgentFailure(format!(
                "{method} channel closed (id={id})"
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(SessionError::Timeout(format!(
                    "{method} timed out after {:?} (id={id})",
                    timeout
                )))
            }
        }
    }

    /// `initialize` handshake.
    pub async fn initialize(&self) -> Result<Value, SessionError> {
        self.send_request(
            "initialize",
            json!({
                "protocolVersion": 1,
                "clientInfo": { "name": "acp-sessiond", "version": env!("CARGO_PKG_VERSION") },
            }),
            Duration::from_secs(15),
        )
        .await
    }

    /// `session/new`, returns the agent's own session id.
    pub async fn new_session(&self, cwd: &str) -> Result<String, SessionError> {
        let result = self
            .send_request(
                "session/new",
                json!({ "cwd": cwd, "mcpServers": [] }),
                Duration::from_secs(15),
            )
            .await?;
        result["sessionId"]
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| SessionError::AgentFailure("no sessionId in session/new response".into()))
    }

    /// `session/prompt`, 5-minute timeout matching the grace a long agent turn needs.
    pub async fn prompt(
        &self,
        agent_session_id: &str,
        text: &str,
        image_ids: &[String],
    ) -> Result<Value, SessionError> {
        let mut content = vec![json!({ "type": "text", "text": text })];
        for id in image_ids {
            content.push(json!({ "type": "image", "imageId": id }));
        }
        self.send_request(
            "session/prompt",
            json!({ "sessionId": agent_session_id, "prompt": content }),
            Duration::from_secs(300),
        )
        .await
    }

    /// `session/cancel` notification (fire-and-forget, no response expected).
    pub async fn cancel(&self, agent_session_id: &str) {
        let msg = json!({
            "jsonrpc": "2.0",
            "method": "session/cancel",
            "params": { "sessionId": agent_session_id },
        });
        let _ = self.write_line(&msg).await;
    }

    /// Reply to an agent-originated `session/request_permission` call.
    pub async fn respond_permission(&self, id: Value, outcome: Value) -> Result<(), SessionError> {
        let reply = json!({ "jsonrpc": "2.0", "id": id, "result": { "outcome": outcome } });
        self.write_line(&reply).await
    }

    /// SIGTERM the process group, wait up to the grace period, then SIGKILL.
    pub async fn shutdown(&self) {
        if !self.is_alive() {
            return;
        }
        info!(pid = self.pid, "sending SIGTERM to agent process group");
        self.send_signal(libc::SIGTERM);

        let deadline = tokio::time::Instant::now() + GRACEFUL_KILL_TIMEOUT;
        while self.is_alive() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(GRACEFUL_POLL_INTERVAL).await;
        }

        if self.is_alive() {
            warn!(pid = self.pid, "agent did not exit in time, sending SIGKILL");
            self.send_signal(libc::SIGKILL);
        }

        for (_, tx) in self.pending.lock().await.drain() {
            let _ = tx.send(Err("agent connection shut down".to_string()));
        }
    }

    fn send_signal(&self, signal: i32) {
        // Negative pid targets the whole process group (SPEC_FULL §4.4).
        unsafe {
            libc::kill(-self.pid, signal);
        }
    }
}

async fn drain_stderr(stderr: tokio::process::ChildStderr, pid: i32) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            debug!(pid, "agent stderr: {line}");
        }
    }
}

async fn exit_watcher(
    mut child: Child,
    alive: Arc<AtomicBool>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>,
    tx: mpsc::UnboundedSender<AgentMessage>,
) {
    let status = child.wait().await;
    alive.store(false, Ordering::SeqCst);
    let code = status.ok().and_then(|s| s.code());
    for (_, reply) in pending.lock().await.drain() {
        let _ = reply.send(Err("agent process exited".to_string()));
    }
    let _ = tx.send(AgentMessage::Exited(code));
}

async fn reader_task(
    stdout: tokio::process::ChildStdout,
    stdin: Arc<Mutex<ChildStdin>>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>,
    alive: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<AgentMessage>,
    pid: i32,
) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let msg: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => match try_parse_embedded_json(line) {
                Some(v) => v,
                None => {
                    debug!(pid, "non-JSON agent stdout: {}", &line[..line.len().min(200)]);
                    continue;
                }
            },
        };

        let has_id = msg.get("id").is_some_and(|v| !v.is_null());
        let has_result = msg.get("result").is_some();
        let has_error = msg.get("error").is_some();
        let method = msg.get("method").and_then(Value::as_str);

        if has_id && (has_result || has_error) {
            let id = msg["id"].as_u64().unwrap_or(0);
            if let Some(reply) = pending.lock().await.remove(&id) {
                if has_error {
                    let err_msg = msg["error"]["message"].as_str().unwrap_or("unknown error");
                    let _ = reply.send(Err(err_msg.to_string()));
                } else {
                    let _ = reply.send(Ok(msg["result"].clone()));
                }
            }
        } else if let (true, Some(method)) = (has_id, method) {
            match method {
                "session/request_permission" => {
                    if tx
                        .send(AgentMessage::PermissionRequest {
                            id: msg["id"].clone(),
                            params: msg["params"].clone(),
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                _ => {
                    let result = handle_stub_request(method, &msg["params"]).await;
                    let reply = json!({ "jsonrpc": "2.0", "id": msg["id"], "result": result });
                    let mut line = match serde_json::to_vec(&reply) {
                        Ok(l) => l,
                        Err(_) => continue,
                    };
                    line.push(b'\n');
                    let mut stdin = stdin.lock().await;
                    let _ = stdin.write_all(&line).await;
                    let _ = stdin.flush().await;
                }
            }
        } else if method.is_some() {
            if tx.send(AgentMessage::Notification(msg)).is_err() {
                break;
            }
        } else {
            debug!(pid, "unhandled agent message: {}", &line[..line.len().min(200)]);
        }
    }
    alive.store(false, Ordering::SeqCst);
}

/// Answer the non-permission agent→client calls inline so a real ACP agent
/// doesn't stall waiting on filesystem/terminal plumbing we don't implement.
async fn handle_stub_request(method: &str, params: &Value) -> Value {
    match method {
        "fs/read_text_file" => {
            let path = params["path"].as_str().unwrap_or("");
            match tokio::fs::read_to_string(path).await {
                Ok(content) => json!({ "content": content }),
                Err(e) => json!({ "error": format!("failed to read file: {e}") }),
            }
        }
        "fs/write_text_file" => {
            let path = params["path"].as_str().unwrap_or("");
            let content = params["content"].as_str().unwrap_or("");
            if let Some(parent) = std::path::Path::new(path).parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            match tokio::fs::write(path, content).await {
                Ok(()) => json!({}),
                Err(e) => json!({ "error": format!("failed to write file: {e}") }),
            }
        }
        "terminal/create" => json!({ "terminalId": uuid::Uuid::new_v4().to_string() }),
        "terminal/output" => json!({ "output": "" }),
        "terminal/wait_for_exit" => json!({ "exitCode": 0 }),
        "terminal/kill" | "terminal/release" => json!({}),
        _ => {
            warn!("unknown agent request: {method}");
            json!({})
        }
    }
}

/// Fallback for agents that emit non-conforming lines with JSON embedded in
/// surrounding text (observed in the wild from some stdio-bridge shims).
fn try_parse_embedded_json(line: &str) -> Option<Value> {
    let mut depth = 0i32;
    let mut start = None;
    for (i, ch) in line.char_indices() {
        match ch {
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start {
                        if let Ok(v) = serde_json::from_str::<Value>(&line[s..=i]) {
                            return Some(v);
                        }
                    }
                    start = None;
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_json_is_extracted() {
        let line = "garbage prefix {\"method\":\"session/update\",\"params\":{}} trailing";
        let parsed = try_parse_embedded_json(line).unwrap();
        assert_eq!(parsed["method"], "session/update");
    }

    #[test]
    fn embedded_json_returns_none_for_plain_text() {
        assert!(try_parse_embedded_json("just some log output").is_none());
    }
}
