//! Markdown-aware stream coalescer (SPEC_FULL §4.3).
//!
//! Seq is assigned by the caller *at ingress*, before any buffering, so that
//! ordering between buffered text and any tool-call events that arrive while
//! a markdown block is open is decided once and never revisited. This module
//! only decides *when* to flush, not *what* seq to use.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

/// One event ready to be persisted and broadcast to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct Emitted {
    pub seq: u64,
    pub kind: String,
    pub data: Value,
}

struct Coalescing {
    seq: u64,
    kind: String,
    text: String,
    started: Instant,
}

struct Parked {
    seq: u64,
    kind: String,
    data: Value,
}

/// Tracks whether ingested text currently sits inside a fenced code block,
/// an open list, or an open table.
#[derive(Default)]
struct BlockState {
    fence_open: bool,
    list_active: bool,
    table_active: bool,
}

impl BlockState {
    fn in_block(&self) -> bool {
        self.fence_open || self.list_active || self.table_active
    }

    /// Feed newly appended text, line by line. Returns true if a block that
    /// was open closed during this update (a flush trigger).
    fn update(&mut self, chunk: &str) -> bool {
        let mut closed = false;
        for raw_line in chunk.split_inclusive('\n') {
            let line = raw_line.trim_end_matches('\n');
            let trimmed = line.trim_start();

            if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
                let was_open = self.fence_open;
                self.fence_open = !self.fence_open;
                if was_open && !self.fence_open {
                    closed = true;
                }
                continue;
            }
            if self.fence_open {
                continue;
            }

            if is_list_line(trimmed) {
                self.list_active = true;
            } else if trimmed.starts_with('|') {
                self.table_active = true;
            } else if trimmed.trim().is_empty() {
                if self.list_active || self.table_active {
                    closed = true;
                }
                self.list_active = false;
                self.table_active = false;
            }
            // A plain paragraph line directly following a list/table item with
            // no blank line is treated as still belonging to it — Markdown
            // renderers are forgiving here and premature closing would split
            // a table row from its continuation.
        }
        closed
    }
}

fn is_list_line(trimmed: &str) -> bool {
    if trimmed.starts_with("- ") || trimmed.starts_with("* ") || trimmed.starts_with("+ ") {
        return true;
    }
    let digits: String = trimmed.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return false;
    }
    let rest = &trimmed[digits.len()..];
    rest.starts_with(". ") || rest.starts_with(") ")
}

/// An odd count of `**` or unfenced single backticks means truncating here
/// would split a bold/italic/code span mid-token.
fn has_unmatched_inline(text: &str) -> bool {
    if text.matches("**").count() % 2 != 0 {
        return true;
    }
    let lone_backticks = text.chars().filter(|&c| c == '`').count();
    lone_backticks % 2 != 0
}

/// Per-prompt coalescing buffer. One instance lives for the duration of a
/// single prompt turn inside the owning `BackgroundSession`.
pub struct StreamBuffer {
    soft_timeout: Duration,
    hard_limit: usize,
    coalescing: Option<Coalescing>,
    pending: VecDeque<Parked>,
    block: BlockState,
}

impl StreamBuffer {
    #[must_use]
    pub fn new(soft_timeout_ms: u64, hard_limit_bytes: usize) -> Self {
        Self {
            soft_timeout: Duration::from_millis(soft_timeout_ms),
            hard_limit: hard_limit_bytes,
            coalescing: None,
            pending: VecDeque::new(),
            block: BlockState::default(),
        }
    }

    /// True while text is parked inside an open fence/list/table — callers use
    /// this to decide whether a mid-stream join should peek rather than wait.
    #[must_use]
    pub fn in_block(&self) -> bool {
        self.block.in_block()
    }

    /// Current accumulated text of the open coalescing group, if any (used
    /// for BackgroundSession's mid-stream-join peek, SPEC_FULL §4.5).
    #[must_use]
    pub fn peek(&self) -> Option<(u64, &str, &str)> {
        self.coalescing
            .as_ref()
            .map(|c| (c.seq, c.kind.as_str(), c.text.as_str()))
    }

    /// Ingest one chunk of a coalescing event type (`agent_message`,
    /// `agent_thought`). `alloc_seq` is called at most once, only when this
    /// chunk opens a *new* coalescing group — subsequent chunks of the same
    /// kind reuse the open group's seq, so the caller's seq counter only
    /// advances once per logical (flushed) event, never once per chunk.
    /// Returns any events that must flush immediately.
    pub fn ingest_chunk(
        &mut self,
        kind: &str,
        chunk: &str,
        alloc_seq: impl FnOnce() -> u64,
    ) -> Vec<Emitted> {
        let mut out = Vec::new();
        if let Some(existing) = &self.coalescing {
            if existing.kind != kind {
                out.extend(self.flush_coalescing());
            }
        }
        if self.coalescing.is_none() {
            self.coalescing = Some(Coalescing {
                seq: alloc_seq(),
                kind: kind.to_string(),
                text: String::new(),
                started: Instant::now(),
            });
        }
        let entry = self.coalescing.as_mut().expect("just inserted above");
        entry.text.push_str(chunk);
        let block_closed = self.block.update(chunk);

        if block_closed {
            out.extend(self.flush_coalescing());
            return out;
        }

        let over_limit = self
            .coalescing
            .as_ref()
            .is_some_and(|c| c.text.len() >= self.hard_limit);
        if over_limit && !self.block.in_block() {
            let safe = self
                .coalescing
                .as_ref()
                .is_some_and(|c| !has_unmatched_inline(&c.text));
            if safe {
                out.extend(self.flush_coalescing());
            }
        }
        out
    }

    /// Ingest a non-coalescing event (`tool_call`, `plan`, `permission`, ...).
    pub fn ingest_event(&mut self, seq: u64, kind: &str, data: Value) -> Vec<Emitted> {
        if self.block.in_block() {
            self.pending.push_back(Parked {
                seq,
                kind: kind.to_string(),
                data,
            });
            return Vec::new();
        }
        let mut out = self.flush_coalescing();
        out.push(Emitted {
            seq,
            kind: kind.to_string(),
            data,
        });
        out
    }

    /// Driven by a periodic ticker; flushes the open coalescing group once
    /// it has been idle past the soft timeout (and it's safe to do so).
    pub fn tick(&mut self, now: Instant) -> Vec<Emitted> {
        let should_flush = self.coalescing.as_ref().is_some_and(|c| {
            now.duration_since(c.started) >= self.soft_timeout
                && !self.block.in_block()
                && !has_unmatched_inline(&c.text)
        });
        if should_flush {
            self.flush_coalescing()
        } else {
            Vec::new()
        }
    }

    /// Explicit end-of-prompt flush: always flushes, regardless of block
    /// state or unmatched formatting, since no further chunks are coming.
    pub fn flush_all(&mut self) -> Vec<Emitted> {
        let mut out = Vec::new();
        if let Some(c) = self.coalescing.take() {
            out.push(Emitted {
                seq: c.seq,
                kind: c.kind,
                data: json!({ "text": c.text }),
            });
        }
        out.extend(self.drain_pending());
        self.block = BlockState::default();
        out
    }

    fn flush_coalescing(&mut self) -> Vec<Emitted> {
        let mut out = Vec::new();
        if let Some(c) = self.coalescing.take() {
            out.push(Emitted {
                seq: c.seq,
                kind: c.kind,
                data: json!({ "text": c.text }),
            });
        }
        out.extend(self.drain_pending());
        out
    }

    fn drain_pending(&mut self) -> Vec<Emitted> {
        self.pending
            .drain(..)
            .map(|p| Emitted {
                seq: p.seq,
                kind: p.kind,
                data: p.data,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A seq allocator that panics if called more than once, for asserting a
    /// test's chunks all land in a single coalescing group.
    fn single_use_seq(seq: u64) -> impl FnMut() -> u64 {
        let mut used = false;
        move || {
            assert!(!used, "seq allocator must be called at most once per group");
            used = true;
            seq
        }
    }

    #[test]
    fn coalesces_consecutive_chunks_under_first_seq() {
        let mut buf = StreamBuffer::new(200, 4096);
        let mut alloc = single_use_seq(5);
        assert!(buf.ingest_chunk("agent_message", "Hello, ", &mut alloc).is_empty());
        assert!(buf
            .ingest_chunk("agent_message", "world!", || panic!("must reuse open group's seq"))
            .is_empty());
        let out = buf.flush_all();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].seq, 5);
        assert_eq!(out[0].data["text"], "Hello, world!");
    }

    #[test]
    fn parks_tool_call_inside_open_fence() {
        let mut buf = StreamBuffer::new(200, 4096);
        assert!(buf
            .ingest_chunk("agent_message", "```rust\nfn main() {\n", || 1)
            .is_empty());
        // A tool_call arriving while the fence is open must not leapfrog the text.
        let mid = buf.ingest_event(2, "tool_call", json!({"name": "read_file"}));
        assert!(mid.is_empty(), "non-coalescing event must park while in a block");

        let closing = buf.ingest_chunk("agent_message", "}\n```\n", || panic!("group already open"));
        // Closing the fence flushes the paragraph, then the parked tool_call.
        assert_eq!(closing.len(), 2);
        assert_eq!(closing[0].kind, "agent_message");
        assert_eq!(closing[0].seq, 1);
        assert_eq!(closing[1].kind, "tool_call");
        assert_eq!(closing[1].seq, 2);
    }

    #[test]
    fn non_coalescing_event_outside_block_flushes_immediately() {
        let mut buf = StreamBuffer::new(200, 4096);
        assert!(buf
            .ingest_chunk("agent_message", "plain paragraph\n\n", || 1)
            .is_empty());
        let out = buf.ingest_event(2, "tool_call", json!({"name": "ls"}));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind, "agent_message");
        assert_eq!(out[1].kind, "tool_call");
    }

    #[test]
    fn different_coalescing_kinds_flush_each_other() {
        let mut buf = StreamBuffer::new(200, 4096);
        assert!(buf.ingest_chunk("agent_thought", "thinking...", || 1).is_empty());
        let out = buf.ingest_chunk("agent_message", "answer", || 2);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, "agent_thought");
        assert_eq!(out[0].seq, 1);
    }

    #[test]
    fn hard_limit_respects_unmatched_bold_marker() {
        let mut buf = StreamBuffer::new(200, 10);
        let mut alloc = single_use_seq(1);
        // "**bold" has an odd number of `**` — must not flush mid-token.
        let out = buf.ingest_chunk("agent_message", "plain **bold", &mut alloc);
        assert!(out.is_empty());
        let out2 = buf.ingest_chunk("agent_message", " text** done", &mut alloc);
        assert!(out2.is_empty(), "still under limit after closing marker lands");
    }

    #[test]
    fn tick_flushes_after_soft_timeout() {
        let mut buf = StreamBuffer::new(1, 4096);
        assert!(buf.ingest_chunk("agent_message", "hi", || 1).is_empty());
        std::thread::sleep(Duration::from_millis(5));
        let out = buf.tick(Instant::now());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].seq, 1);
    }

    #[test]
    fn seq_allocator_not_called_again_mid_group() {
        // Regression test: chunks within one coalescing group must not each
        // consume a seq from the caller's counter, or the persisted stream
        // ends up with gaps relative to the counter's high-water mark.
        let mut buf = StreamBuffer::new(200, 4096);
        let mut calls = 0u64;
        let mut alloc = || {
            calls += 1;
            calls
        };
        assert!(buf.ingest_chunk("agent_message", "a", &mut alloc).is_empty());
        assert!(buf.ingest_chunk("agent_message", "b", &mut alloc).is_empty());
        assert!(buf.ingest_chunk("agent_message", "c", &mut alloc).is_empty());
        assert_eq!(calls, 1, "only the first chunk in a group may allocate a seq");
        let out = buf.flush_all();
        assert_eq!(out[0].seq, 1);
        assert_eq!(out[0].data["text"], "abc");
    }
}
