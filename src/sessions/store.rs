//! Append-only event store (SPEC_FULL §4.1).
//!
//! Layout per session, under `<data_dir>/sessions/<session_id>/`:
//!
//! - `events.jsonl`  — one JSON object per line, append-only, never rewritten.
//! - `metadata.json` — small summary, rewritten atomically (write-temp, fsync, rename).
//! - `queue.json`    — optional, same atomic-rewrite treatment (mutable, unlike events).
//!
//! Recovery tolerates a partial trailing line left by a crash mid-write: the
//! tail scan on open discards anything after the last `\n`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::SessionError;
use crate::util::now_ms;

/// Status of a persisted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Error,
}

/// Small on-disk summary, rewritten atomically on every mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub acp_server: String,
    pub working_dir: String,
    pub created_at: u64,
    pub updated_at: u64,
    pub event_count: u64,
    pub max_seq: u64,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A single persisted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: u64,
    pub data: Value,
}

/// One queued, not-yet-submitted user message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub message: String,
    #[serde(default)]
    pub image_ids: Vec<String>,
    pub queued_at: u64,
    pub client_id: String,
    #[serde(default)]
    pub prompt_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct QueueFile {
    #[serde(default)]
    messages: Vec<QueuedMessage>,
    #[serde(default)]
    updated_at: u64,
}

/// Top-level store: knows where session directories live.
#[derive(Clone)]
pub struct EventStore {
    data_dir: PathBuf,
}

impl EventStore {
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.data_dir.join("sessions").join(session_id)
    }

    /// Create a brand new session directory and metadata file.
    pub async fn create(
        &self,
        session_id: &str,
        acp_server: &str,
        working_dir: &str,
        name: Option<String>,
    ) -> Result<SessionHandle, SessionError> {
        let dir = self.session_dir(session_id);
        if dir.exists() {
            return Err(SessionError::BadRequest(format!(
                "session {session_id} already exists"
            )));
        }
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| SessionError::StoreFailure(format!("create session dir: {e}")))?;

        let now = now_ms();
        let metadata = SessionMetadata {
            session_id: session_id.to_string(),
            acp_server: acp_server.to_string(),
            working_dir: working_dir.to_string(),
            created_at: now,
            updated_at: now,
            event_count: 0,
            max_seq: 0,
            status: SessionStatus::Active,
            name,
        };

        write_json_atomic(&dir.join("metadata.json"), &metadata).await?;
        // Touch the events file so recovery/listing finds a well-formed session
        // immediately, even before the first event is appended.
        fs::File::create(dir.join("events.jsonl"))
            .await
            .map_err(|e| SessionError::StoreFailure(format!("create events file: {e}")))?;

        SessionHandle::open(dir, metadata).await
    }

    /// Open an existing session, recovering `max_seq`/`event_count` from disk.
    pub async fn open(&self, session_id: &str) -> Result<SessionHandle, SessionError> {
        let dir = self.session_dir(session_id);
        let metadata_path = dir.join("metadata.json");
        let metadata: SessionMetadata = read_json(&metadata_path)
            .await?
            .ok_or_else(|| SessionError::NotFound(format!("session {session_id} not found")))?;
        SessionHandle::open(dir, metadata).await
    }

    /// List every persisted session's metadata.
    pub async fn list_sessions(&self) -> Result<Vec<SessionMetadata>, SessionError> {
        let sessions_dir = self.data_dir.join("sessions");
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&sessions_dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(SessionError::StoreFailure(format!("list sessions: {e}"))),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SessionError::StoreFailure(format!("list sessions: {e}")))?
        {
            let meta_path = entry.path().join("metadata.json");
            if let Some(meta) = read_json::<SessionMetadata>(&meta_path).await? {
                out.push(meta);
            }
        }
        out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(out)
    }

    /// Remove a session's entire store directory.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), SessionError> {
        let dir = self.session_dir(session_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SessionError::NotFound(format!("session {session_id} not found")))
            }
            Err(e) => Err(SessionError::StoreFailure(format!("delete session: {e}"))),
        }
    }
}

/// Live handle to one session's on-disk state.
pub struct SessionHandle {
    dir: PathBuf,
    session_id: String,
    max_seq: AtomicU64,
    metadata: Mutex<SessionMetadata>,
    append_lock: Mutex<()>,
}

impl SessionHandle {
    async fn open(dir: PathBuf, metadata: SessionMetadata) -> Result<Self, SessionError> {
        let events_path = dir.join("events.jsonl");
        let (recovered_max_seq, recovered_count) = recover_tail(&events_path).await?;

        let max_seq = recovered_max_seq.max(metadata.max_seq);
        let mut metadata = metadata;
        if max_seq != metadata.max_seq || recovered_count != metadata.event_count {
            metadata.max_seq = max_seq;
            metadata.event_count = recovered_count;
            write_json_atomic(&dir.join("metadata.json"), &metadata).await?;
        }

        Ok(Self {
            session_id: metadata.session_id.clone(),
            max_seq: AtomicU64::new(max_seq),
            metadata: Mutex::new(metadata),
            dir,
            append_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn current_max_seq(&self) -> u64 {
        self.max_seq.load(Ordering::SeqCst)
    }

    pub async fn metadata(&self) -> SessionMetadata {
        self.metadata.lock().await.clone()
    }

    /// Assign the next sequence number without appending. Used by the Stream
    /// Buffer and BackgroundSession to stamp events at ingress (SPEC_FULL §4.3).
    pub fn next_seq(&self) -> u64 {
        self.max_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Append an event whose `seq` was already assigned via [`Self::next_seq`].
    pub async fn append_with_seq(
        &self,
        seq: u64,
        kind: &str,
        data: Value,
    ) -> Result<Event, SessionError> {
        let _guard = self.append_lock.lock().await;
        let event = Event {
            seq,
            kind: kind.to_string(),
            timestamp: now_ms(),
            data,
        };
        let mut line = serde_json::to_vec(&event)
            .map_err(|e| SessionError::StoreFailure(format!("serialize event: {e}")))?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(self.dir.join("events.jsonl"))
            .await
            .map_err(|e| SessionError::StoreFailure(format!("open events file: {e}")))?;
        file.write_all(&line)
            .await
            .map_err(|e| SessionError::StoreFailure(format!("append event: {e}")))?;
        file.sync_data()
            .await
            .map_err(|e| SessionError::StoreFailure(format!("fsync events file: {e}")))?;

        {
            let mut meta = self.metadata.lock().await;
            meta.event_count += 1;
            meta.max_seq = meta.max_seq.max(seq);
            meta.updated_at = now_ms();
            write_json_atomic(&self.dir.join("metadata.json"), &*meta).await?;
        }

        Ok(event)
    }

    /// Assign a fresh seq and append in one step (used outside the Stream
    /// Buffer's ingress path, e.g. `session_start`/`session_end`).
    pub async fn append(&self, kind: &str, data: Value) -> Result<Event, SessionError> {
        let seq = self.next_seq();
        self.append_with_seq(seq, kind, data).await
    }

    /// Read up to `limit` events with `seq < before_seq` (0 means "newest"),
    /// returned in ascending seq order, plus whether older events remain.
    pub async fn read_last(
        &self,
        limit: usize,
        before_seq: u64,
    ) -> Result<(Vec<Event>, bool), SessionError> {
        let all = self.read_all().await?;
        let upper = if before_seq == 0 {
            all.len()
        } else {
            all.partition_point(|e| e.seq < before_seq)
        };
        let lower = upper.saturating_sub(limit);
        let has_more = lower > 0;
        Ok((all[lower..upper].to_vec(), has_more))
    }

    /// Read up to `limit` events with `seq > after_seq`, ascending, plus
    /// whether more remain beyond the returned page.
    pub async fn read_from(
        &self,
        after_seq: u64,
        limit: usize,
    ) -> Result<(Vec<Event>, bool), SessionError> {
        let all = self.read_all().await?;
        let start = all.partition_point(|e| e.seq <= after_seq);
        let end = (start + limit).min(all.len());
        let has_more = end < all.len();
        Ok((all[start..end].to_vec(), has_more))
    }

    /// Scan for the most recently persisted `user_prompt` event, for the
    /// connect-time `connected` frame's delivery-confirmation fields.
    pub async fn last_user_prompt(&self) -> Result<Option<(String, u64)>, SessionError> {
        let all = self.read_all().await?;
        Ok(all.iter().rev().find(|e| e.kind == "user_prompt").map(|e| {
            let prompt_id = e
                .data
                .get("prompt_id")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            (prompt_id, e.seq)
        }))
    }

    async fn read_all(&self) -> Result<Vec<Event>, SessionError> {
        let path = self.dir.join("events.jsonl");
        let file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SessionError::StoreFailure(format!("open events file: {e}"))),
        };
        let mut lines = BufReader::new(file).lines();
        let mut out = Vec::new();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| SessionError::StoreFailure(format!("read events file: {e}")))?
        {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(&line) {
                Ok(ev) => out.push(ev),
                Err(e) => warn!(
                    session_id = %self.session_id,
                    "skipping corrupt event line: {e}"
                ),
            }
        }
        Ok(out)
    }

    pub async fn rename(&self, name: &str) -> Result<(), SessionError> {
        let mut meta = self.metadata.lock().await;
        meta.name = Some(name.to_string());
        meta.updated_at = now_ms();
        write_json_atomic(&self.dir.join("metadata.json"), &*meta).await
    }

    pub async fn set_status(&self, status: SessionStatus) -> Result<(), SessionError> {
        let mut meta = self.metadata.lock().await;
        meta.status = status;
        meta.updated_at = now_ms();
        write_json_atomic(&self.dir.join("metadata.json"), &*meta).await
    }

    // ── Queue ────────────────────────────────────────────────────────────

    async fn load_queue(&self) -> Result<QueueFile, SessionError> {
        Ok(read_json(&self.dir.join("queue.json"))
            .await?
            .unwrap_or_default())
    }

    async fn save_queue(&self, queue: &QueueFile) -> Result<(), SessionError> {
        write_json_atomic(&self.dir.join("queue.json"), queue).await
    }

    pub async fn queue_push(&self, msg: QueuedMessage) -> Result<(), SessionError> {
        let mut queue = self.load_queue().await?;
        queue.messages.push(msg);
        queue.updated_at = now_ms();
        self.save_queue(&queue).await
    }

    pub async fn queue_list(&self) -> Result<Vec<QueuedMessage>, SessionError> {
        Ok(self.load_queue().await?.messages)
    }

    /// Pop the head of the FIFO, if any.
    pub async fn queue_pop_front(&self) -> Result<Option<QueuedMessage>, SessionError> {
        let mut queue = self.load_queue().await?;
        if queue.messages.is_empty() {
            return Ok(None);
        }
        let head = queue.messages.remove(0);
        queue.updated_at = now_ms();
        self.save_queue(&queue).await?;
        Ok(Some(head))
    }

    pub async fn queue_remove(&self, id: &str) -> Result<bool, SessionError> {
        let mut queue = self.load_queue().await?;
        let before = queue.messages.len();
        queue.messages.retain(|m| m.id != id);
        let removed = queue.messages.len() != before;
        if removed {
            queue.updated_at = now_ms();
            self.save_queue(&queue).await?;
        }
        Ok(removed)
    }
}

/// Scan the tail of `events.jsonl`, tolerating a partial trailing line left by
/// a crash mid-write. Returns `(max_seq, event_count)`. If the file doesn't
/// end in `\n`, append one so future writes start on a fresh line.
async fn recover_tail(path: &Path) -> Result<(u64, u64), SessionError> {
    let content = match fs::read(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
        Err(e) => return Err(SessionError::StoreFailure(format!("read events file: {e}"))),
    };
    if content.is_empty() {
        return Ok((0, 0));
    }

    let text = String::from_utf8_lossy(&content);
    let mut max_seq = 0u64;
    let mut count = 0u64;
    let ends_with_newline = content.ends_with(b"\n");
    let lines: Vec<&str> = text.lines().collect();

    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let is_last = idx + 1 == lines.len();
        match serde_json::from_str::<Event>(line) {
            Ok(ev) => {
                max_seq = max_seq.max(ev.seq);
                count += 1;
            }
            Err(e) if is_last && !ends_with_newline => {
                warn!("discarding partial trailing event line after crash: {e}");
            }
            Err(e) => {
                warn!("skipping corrupt event line during recovery: {e}");
            }
        }
    }

    if !ends_with_newline {
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(path)
            .await
            .map_err(|e| SessionError::StoreFailure(format!("cap partial events file: {e}")))?;
        file.write_all(b"\n")
            .await
            .map_err(|e| SessionError::StoreFailure(format!("cap partial events file: {e}")))?;
    }

    Ok((max_seq, count))
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    path: &Path,
) -> Result<Option<T>, SessionError> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SessionError::StoreFailure(format!("parse {}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SessionError::StoreFailure(format!(
            "read {}: {e}",
            path.display()
        ))),
    }
}

/// Write-temp-then-rename, matching the teacher's atomic-rewrite convention
/// for small mutable files.
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), SessionError> {
    let tmp_path = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| SessionError::StoreFailure(format!("serialize {}: {e}", path.display())))?;

    let mut file = fs::File::create(&tmp_path)
        .await
        .map_err(|e| SessionError::StoreFailure(format!("write {}: {e}", tmp_path.display())))?;
    file.write_all(&bytes)
        .await
        .map_err(|e| SessionError::StoreFailure(format!("write {}: {e}", tmp_path.display())))?;
    file.sync_all()
        .await
        .map_err(|e| SessionError::StoreFailure(format!("fsync {}: {e}", tmp_path.display())))?;
    drop(file);

    fs::rename(&tmp_path, path)
        .await
        .map_err(|e| SessionError::StoreFailure(format!("rename into {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> (tempfile::TempDir, EventStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn append_assigns_monotonic_seq() {
        let (_dir, store) = temp_store().await;
        let handle = store
            .create("20260101-000000-aaaaaaaa", "test-agent", "/tmp", None)
            .await
            .unwrap();

        let e1 = handle.append("session_start", serde_json::json!({})).await.unwrap();
        let e2 = handle.append("user_prompt", serde_json::json!({"text": "hi"})).await.unwrap();
        assert_eq!(e1.seq, 1);
        assert_eq!(e2.seq, 2);
        assert_eq!(handle.current_max_seq(), 2);
    }

    #[tokio::test]
    async fn read_from_is_exclusive_of_after_seq() {
        let (_dir, store) = temp_store().await;
        let handle = store
            .create("20260101-000000-bbbbbbbb", "test-agent", "/tmp", None)
            .await
            .unwrap();
        for i in 0..5 {
            handle
                .append("agent_message", serde_json::json!({"i": i}))
                .await
                .unwrap();
        }
        let (events, has_more) = handle.read_from(2, 10).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].seq, 3);
        assert!(!has_more);
    }

    #[tokio::test]
    async fn reopen_recovers_max_seq() {
        let (dir, store) = temp_store().await;
        {
            let handle = store
                .create("20260101-000000-cccccccc", "test-agent", "/tmp", None)
                .await
                .unwrap();
            handle.append("session_start", serde_json::json!({})).await.unwrap();
            handle.append("user_prompt", serde_json::json!({})).await.unwrap();
        }
        let store2 = EventStore::new(dir.path());
        let reopened = store2.open("20260101-000000-cccccccc").await.unwrap();
        assert_eq!(reopened.current_max_seq(), 2);
        assert_eq!(reopened.next_seq(), 3);
    }

    #[tokio::test]
    async fn recover_tail_discards_partial_trailing_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        tokio::fs::write(
            &path,
            b"{\"seq\":1,\"type\":\"session_start\",\"timestamp\":1,\"data\":{}}\n{\"seq\":2,\"type\":\"age",
        )
        .await
        .unwrap();
        let (max_seq, count) = recover_tail(&path).await.unwrap();
        assert_eq!(max_seq, 1);
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn queue_fifo_order() {
        let (_dir, store) = temp_store().await;
        let handle = store
            .create("20260101-000000-dddddddd", "test-agent", "/tmp", None)
            .await
            .unwrap();
        handle
            .queue_push(QueuedMessage {
                id: "q-1".into(),
                message: "first".into(),
                image_ids: vec![],
                queued_at: now_ms(),
                client_id: "c1".into(),
                prompt_id: "p-1".into(),
            })
            .await
            .unwrap();
        handle
            .queue_push(QueuedMessage {
                id: "q-2".into(),
                message: "second".into(),
                image_ids: vec![],
                queued_at: now_ms(),
                client_id: "c1".into(),
                prompt_id: "p-2".into(),
            })
            .await
            .unwrap();
        let first = handle.queue_pop_front().await.unwrap().unwrap();
        assert_eq!(first.id, "q-1");
        let remaining = handle.queue_list().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "q-2");
    }
}
