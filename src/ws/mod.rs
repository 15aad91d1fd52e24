//! Per-session WebSocket transport — the Observer of SPEC_FULL §4.7.
//!
//! ## Connection lifecycle
//!
//! `GET /api/sessions/{id}/ws` upgrades to a socket scoped to one session.
//! Every inbound message is a JSON object with a `"type"` field; an optional
//! `"request_id"` is echoed back on the matching response so a multiplexing
//! client can correlate replies.
//!
//! ## Message types (client → server)
//!
//! | Type              | Fields                                  | Response            |
//! |-------------------|------------------------------------------|---------------------|
//! | `load_events`     | `before_seq?`, `after_seq?`, `limit?`    | `events_loaded`      |
//! | `prompt`          | `text`, `image_ids?`, `prompt_id?`       | `prompt_received`    |
//! | `cancel`          | —                                         | `ack` or `error`     |
//! | `ui_prompt_answer`| `outcome`                                 | `ack` or `error`     |
//! | `rename_session`  | `name`                                    | `ack` or `error`     |
//! | `keepalive`       | `client_time?`                            | `keepalive_ack`      |
//!
//! ## Message types (server → client)
//!
//! | Type           | Fields                                                  |
//! |----------------|----------------------------------------------------------|
//! | `connected`    | `last_user_prompt_id`, `last_user_prompt_seq`, `max_seq` |
//! | `event`        | `seq`, `max_seq`, `event_type`, `data`, `is_mine?`       |
//! | `events_loaded`| `events[]`, `has_more`, `first_seq`, `last_seq`, `max_seq`, `prepend`, `is_prompting` |
//! | `prompt_received` | `prompt_id`, (echoes `request_id`)                    |
//! | `prompt_complete` | `event_count`, `max_seq`                              |
//! | `ui_prompt`    | `request_id`, `data`                                     |
//! | `ui_prompt_dismiss` | `request_id`, `reason`                               |
//! | `ack`          | (echoes `request_id`)                                     |
//! | `keepalive_ack`| `client_time`, `server_time`, `max_seq`, `is_prompting`, `is_running`, `queue_length`, `status` |
//! | `error`        | `code`, `message`                                         |

pub mod global;

use std::time::{Duration, Instant};

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::error::SessionError;
use crate::sessions::background::SessionState;
use crate::sessions::store::Event;
use crate::util::now_ms;
use crate::AppState;

/// How long a connection may go without a `keepalive` before it's considered
/// a zombie and dropped.
const ZOMBIE_TIMEOUT: Duration = Duration::from_secs(60);
const ZOMBIE_CHECK_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_LOAD_LIMIT: usize = 200;

/// `GET /api/sessions/{id}/ws` — per-session WebSocket upgrade.
pub async fn session_ws_upgrade(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.session_manager.get_session(&session_id).await {
        Ok(handle) => ws.on_upgrade(move |socket| handle_session_ws(socket, state, session_id, handle)),
        Err(e) => e.into_response(),
    }
}

fn event_to_frame(event: &Event, max_seq: u64, client_id: &str) -> Value {
    let mut frame = json!({
        "type": "event",
        "seq": event.seq,
        "max_seq": max_seq,
        "event_type": event.kind,
        "timestamp": event.timestamp,
        "data": event.data,
    });
    if event.kind == "user_prompt" {
        let is_mine = event.data.get("client_id").and_then(Value::as_str) == Some(client_id);
        frame["is_mine"] = json!(is_mine);
    }
    frame
}

fn error_frame(request_id: Option<&str>, e: &SessionError) -> Value {
    let mut frame = e.to_ws_frame();
    if let Some(rid) = request_id {
        frame["request_id"] = json!(rid);
    }
    frame
}

fn ack_frame(request_id: Option<&str>) -> Value {
    let mut frame = json!({ "type": "ack" });
    if let Some(rid) = request_id {
        frame["request_id"] = json!(rid);
    }
    frame
}

#[allow(clippy::too_many_lines)]
async fn handle_session_ws(
    socket: axum::extract::ws::WebSocket,
    state: AppState,
    session_id: String,
    handle: crate::sessions::background::BackgroundSessionHandle,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Value>(256);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    error!("ws send: failed to serialize message: {e}");
                    continue;
                }
            };
            if ws_sink
                .send(axum::extract::ws::Message::Text(text.into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let client_id = crate::util::new_session_id();
    let mut events_rx = handle.subscribe();
    let mut notify_rx = handle.subscribe_notify();
    let mut last_sent_seq: u64 = 0;
    let mut last_keepalive = Instant::now();
    let mut zombie_check = tokio::time::interval(ZOMBIE_CHECK_INTERVAL);

    let mut max_seq = state
        .session_manager
        .session_metadata(&session_id)
        .await
        .map(|m| m.max_seq)
        .unwrap_or(0);

    let last_user_prompt = state
        .session_manager
        .last_user_prompt(&session_id)
        .await
        .ok()
        .flatten();
    let (last_user_prompt_id, last_user_prompt_seq) = match &last_user_prompt {
        Some((id, seq)) => (Some(id.clone()), Some(*seq)),
        None => (None, None),
    };
    let _ = tx.send(json!({
        "type": "connected",
        "last_user_prompt_id": last_user_prompt_id,
        "last_user_prompt_seq": last_user_prompt_seq,
        "max_seq": max_seq,
    })).await;

    if matches!(handle.state(), SessionState::Prompting | SessionState::AwaitingPermission) {
        if let Some((seq, kind, text)) = handle.peek_stream().await {
            max_seq = max_seq.max(seq);
            last_sent_seq = last_sent_seq.max(seq);
            let _ = tx.send(json!({
                "type": "event",
                "seq": seq,
                "max_seq": max_seq,
                "event_type": kind,
                "data": { "text": text },
                "partial": true,
            })).await;
        }
    }

    info!(session_id, "observer connected");

    loop {
        tokio::select! {
            ws_msg = ws_stream.next() => {
                let Some(Ok(msg)) = ws_msg else { break };
                let axum::extract::ws::Message::Text(text) = msg else { continue };
                let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
                    let _ = tx.send(json!({
                        "type": "error",
                        "code": "BAD_REQUEST",
                        "message": "failed to parse JSON message",
                    })).await;
                    continue;
                };
                let msg_type = parsed["type"].as_str().unwrap_or("");
                let request_id = parsed["request_id"].as_str().map(ToString::to_string);
                let request_id = request_id.as_deref();

                match msg_type {
                    "keepalive" => {
                        last_keepalive = Instant::now();
                        let client_time = parsed.get("client_time").cloned().unwrap_or(Value::Null);
                        let is_prompting = matches!(handle.state(), SessionState::Prompting | SessionState::AwaitingPermission);
                        let is_running = handle.state() != SessionState::Terminated;
                        let queue_length = state
                            .session_manager
                            .session_queue(&session_id)
                            .await
                            .map(|q| q.len())
                            .unwrap_or(0);
                        let status = state
                            .session_manager
                            .session_metadata(&session_id)
                            .await
                            .map(|m| json!(m.status))
                            .unwrap_or(Value::Null);
                        let _ = tx.send(json!({
                            "type": "keepalive_ack",
                            "client_time": client_time,
                            "server_time": now_ms(),
                            "max_seq": max_seq,
                            "is_prompting": is_prompting,
                            "is_running": is_running,
                            "queue_length": queue_length,
                            "status": status,
                        })).await;
                    }
                    "load_events" => {
                        let before_seq = parsed.get("before_seq").and_then(Value::as_u64);
                        let after_seq = parsed.get("after_seq").and_then(Value::as_u64);
                        let limit = parsed["limit"].as_u64().unwrap_or(DEFAULT_LOAD_LIMIT as u64) as usize;
                        let prepend = before_seq.is_some();

                        let result = if let Some(after) = after_seq {
                            state.session_manager.read_events_from(&session_id, after, limit).await
                        } else {
                            state.session_manager.read_last_events(&session_id, limit, before_seq.unwrap_or(0)).await
                        };

                        match result {
                            Ok((events, has_more)) => {
                                if let Some(max) = events.iter().map(|e| e.seq).max() {
                                    max_seq = max_seq.max(max);
                                    if !prepend {
                                        last_sent_seq = last_sent_seq.max(max);
                                    }
                                }
                                let first_seq = events.first().map(|e| e.seq);
                                let last_seq = events.last().map(|e| e.seq);
                                let is_prompting = matches!(handle.state(), SessionState::Prompting | SessionState::AwaitingPermission);
                                let _ = tx.send(json!({
                                    "type": "events_loaded",
                                    "events": events.iter().map(|e| event_to_frame(e, max_seq, &client_id)).collect::<Vec<_>>(),
                                    "has_more": has_more,
                                    "first_seq": first_seq,
                                    "last_seq": last_seq,
                                    "max_seq": max_seq,
                                    "prepend": prepend,
                                    "is_prompting": is_prompting,
                                })).await;
                            }
                            Err(e) => { let _ = tx.send(error_frame(request_id, &e)).await; }
                        }
                    }
                    "prompt" => {
                        let text_val = parsed["text"].as_str().unwrap_or("").to_string();
                        let image_ids: Vec<String> = parsed.get("image_ids")
                            .and_then(|v| serde_json::from_value(v.clone()).ok())
                            .unwrap_or_default();
                        let prompt_id = parsed.get("prompt_id")
                            .and_then(Value::as_str)
                            .map(ToString::to_string)
                            .unwrap_or_else(crate::util::new_session_id);
                        if text_val.is_empty() {
                            let e = SessionError::BadRequest("text must not be empty".into());
                            let _ = tx.send(error_frame(request_id, &e)).await;
                            continue;
                        }
                        match handle.submit_prompt(text_val, image_ids, client_id.clone(), prompt_id.clone()).await {
                            Ok(()) => {
                                let mut frame = json!({
                                    "type": "prompt_received",
                                    "prompt_id": prompt_id,
                                });
                                if let Some(rid) = request_id {
                                    frame["request_id"] = json!(rid);
                                }
                                let _ = tx.send(frame).await;
                            }
                            Err(e) => { let _ = tx.send(error_frame(request_id, &e)).await; }
                        }
                    }
                    "cancel" => {
                        match handle.cancel().await {
                            Ok(()) => { let _ = tx.send(ack_frame(request_id)).await; }
                            Err(e) => { let _ = tx.send(error_frame(request_id, &e)).await; }
                        }
                    }
                    "ui_prompt_answer" => {
                        let outcome = parsed.get("outcome").cloned().unwrap_or(Value::Null);
                        match handle.answer_permission(outcome).await {
                            Ok(()) => { let _ = tx.send(ack_frame(request_id)).await; }
                            Err(e) => { let _ = tx.send(error_frame(request_id, &e)).await; }
                        }
                    }
                    "rename_session" => {
                        let name = parsed["name"].as_str().unwrap_or("").to_string();
                        if name.is_empty() {
                            let e = SessionError::BadRequest("name must not be empty".into());
                            let _ = tx.send(error_frame(request_id, &e)).await;
                            continue;
                        }
                        match handle.rename(name.clone()).await {
                            Ok(()) => {
                                let _ = tx.send(ack_frame(request_id)).await;
                                let _ = state.session_events.send(json!({
                                    "type": "session.renamed",
                                    "session_id": session_id,
                                    "name": name,
                                }));
                            }
                            Err(e) => { let _ = tx.send(error_frame(request_id, &e)).await; }
                        }
                    }
                    other => {
                        let e = SessionError::BadRequest(format!("unknown message type: {other}"));
                        let _ = tx.send(error_frame(request_id, &e)).await;
                    }
                }
            }
            event = events_rx.recv() => {
                match event {
                    Ok(event) => {
                        if event.seq < last_sent_seq {
                            continue;
                        }
                        last_sent_seq = event.seq;
                        max_seq = max_seq.max(event.seq);
                        if tx.send(event_to_frame(&event, max_seq, &client_id)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Catch up from disk rather than dropping events.
                        if let Ok((events, _)) = state
                            .session_manager
                            .read_events_from(&session_id, last_sent_seq, DEFAULT_LOAD_LIMIT)
                            .await
                        {
                            for e in &events {
                                last_sent_seq = last_sent_seq.max(e.seq);
                                max_seq = max_seq.max(e.seq);
                                if tx.send(event_to_frame(e, max_seq, &client_id)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            notif = notify_rx.recv() => {
                match notif {
                    Ok(value) => {
                        if tx.send(value).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {}
                }
            }
            _ = zombie_check.tick() => {
                if last_keepalive.elapsed() > ZOMBIE_TIMEOUT {
                    warn!(session_id, "observer connection went quiet, closing");
                    break;
                }
            }
        }
    }

    send_task.abort();
    info!(session_id, "observer disconnected");
}
