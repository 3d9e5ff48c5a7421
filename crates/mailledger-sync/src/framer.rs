//! Line framing for worker output.
//!
//! Output arrives in arbitrary chunks. The framer keeps raw bytes in a
//! growable buffer and only decodes complete lines, so a multi-byte UTF-8
//! sequence split across two reads is decoded correctly once the line is
//! complete. `\n` never occurs inside a UTF-8 sequence, which makes splitting
//! on the raw byte safe.

use bytes::{Buf, BytesMut};
use serde_json::Value;
use tracing::warn;

use crate::protocol::{DeltaBatch, StatusEnvelope};

/// Default initial capacity of the line buffer.
const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Maximum line length to prevent memory exhaustion.
pub const MAX_LINE_LENGTH: usize = 64 * 1024 * 1024; // 64 MB

/// What was left in the buffer when the stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trailer {
    /// The leftover parsed as a JSON object.
    Status(StatusEnvelope),
    /// Any other non-empty leftover, emitted as a final delta.
    Delta(String),
}

/// Splits a byte stream into newline-delimited messages.
#[derive(Debug)]
pub struct LineFramer {
    buffer: BytesMut,
    /// Bytes of `buffer` already searched for a newline.
    scanned: usize,
    max_line_length: usize,
    /// Dropping an oversized line until its newline shows up.
    discarding: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    /// Creates an empty framer limited to [`MAX_LINE_LENGTH`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line_length(MAX_LINE_LENGTH)
    }

    /// Creates an empty framer that drops lines longer than `max`.
    #[must_use]
    pub fn with_max_line_length(max: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE.min(max)),
            scanned: 0,
            max_line_length: max,
            discarding: false,
        }
    }

    /// Appends a chunk and returns every line it completed, in order.
    ///
    /// Empty lines are dropped. The incomplete tail stays buffered. A line
    /// that grows past the length limit is discarded up to its newline.
    pub fn push(&mut self, chunk: &[u8]) -> DeltaBatch {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        loop {
            let found = self.buffer[self.scanned..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|offset| self.scanned + offset);

            let Some(pos) = found else {
                if !self.discarding && self.buffer.len() > self.max_line_length {
                    warn!(
                        pending = self.buffer.len(),
                        max = self.max_line_length,
                        "worker line too long, discarding it"
                    );
                    self.discarding = true;
                }
                if self.discarding {
                    self.buffer.clear();
                }
                self.scanned = self.buffer.len();
                break;
            };

            let line = self.buffer.split_to(pos);
            self.buffer.advance(1);
            self.scanned = 0;

            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if line.len() > self.max_line_length {
                warn!(
                    len = line.len(),
                    max = self.max_line_length,
                    "worker line too long, discarding it"
                );
                continue;
            }
            if let Some(text) = decode_line(&line) {
                lines.push(text);
            }
        }
        lines
    }

    /// Bytes received after the last newline.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Drains the buffer at end of stream.
    pub fn finish(&mut self) -> Option<Trailer> {
        let rest = self.buffer.split();
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        let text = decode_line(&rest)?;
        match serde_json::from_str::<Value>(&text) {
            Ok(value @ Value::Object(_)) => {
                Some(Trailer::Status(StatusEnvelope::from_value(&value)))
            }
            _ => Some(Trailer::Delta(text)),
        }
    }
}

/// Returns the last non-empty line of `buffer`, decoded.
#[must_use]
pub fn last_line(buffer: &[u8]) -> Option<String> {
    buffer
        .split(|&b| b == b'\n')
        .rev()
        .find_map(decode_line)
}

fn decode_line(raw: &[u8]) -> Option<String> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    if raw.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(raw).into_owned())
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_and_keeps_tail() {
        let mut framer = LineFramer::new();
        assert_eq!(framer.push(b"a\nb\nc"), vec!["a", "b"]);
        assert_eq!(framer.pending(), b"c");
    }

    #[test]
    fn test_line_completed_by_later_chunk() {
        let mut framer = LineFramer::new();
        assert_eq!(framer.push(b"[\"d1\"]\n[\"d2\""), vec!["[\"d1\"]"]);
        assert_eq!(framer.push(b"]\n"), vec!["[\"d2\"]"]);
        assert!(framer.pending().is_empty());
    }

    #[test]
    fn test_empty_chunks_and_blank_lines() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"").is_empty());
        assert!(framer.push(b"\n").is_empty());
        assert_eq!(framer.push(b"\n\nx\n\r\n"), vec!["x"]);
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn test_split_multibyte_sequence() {
        let bytes = "ünïcode\n".as_bytes();
        let mut framer = LineFramer::new();
        assert!(framer.push(&bytes[..1]).is_empty());
        assert!(framer.push(&bytes[1..4]).is_empty());
        assert_eq!(framer.push(&bytes[4..]), vec!["ünïcode"]);
    }

    #[test]
    fn test_finish_status_object() {
        let mut framer = LineFramer::new();
        framer.push(b"[\"d\"]\n{\"error\":\"x\"}");
        assert_eq!(
            framer.finish(),
            Some(Trailer::Status(StatusEnvelope {
                error: Some("x".into()),
                ..StatusEnvelope::default()
            }))
        );
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn test_finish_non_object_is_delta() {
        let mut framer = LineFramer::new();
        framer.push(b"[\"tail\"]");
        assert_eq!(framer.finish(), Some(Trailer::Delta("[\"tail\"]".into())));

        framer.push(b"not json at all");
        assert_eq!(
            framer.finish(),
            Some(Trailer::Delta("not json at all".into()))
        );
    }

    #[test]
    fn test_long_line_in_small_chunks() {
        let mut framer = LineFramer::new();
        let chunk = [b'x'; 8 * 1024];
        for _ in 0..2048 {
            assert!(framer.push(&chunk).is_empty());
        }
        assert_eq!(framer.pending().len(), 16 * 1024 * 1024);

        let lines = framer.push(b"\nnext");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), 16 * 1024 * 1024);
        assert_eq!(framer.pending(), b"next");
    }

    #[test]
    fn test_oversized_line_is_discarded() {
        let mut framer = LineFramer::with_max_line_length(8);
        assert_eq!(framer.push(b"ok\n0123"), vec!["ok"]);
        assert!(framer.push(b"456789").is_empty());
        assert!(framer.pending().is_empty());
        assert!(framer.push(b"still the same line").is_empty());
        assert_eq!(framer.push(b"...\nafter\n"), vec!["after"]);
        assert!(framer.pending().is_empty());
    }

    #[test]
    fn test_oversized_line_in_one_chunk_is_discarded() {
        let mut framer = LineFramer::with_max_line_length(4);
        assert_eq!(framer.push(b"toolong\nfine\n"), vec!["fine"]);
    }

    #[test]
    fn test_finish_after_discard_is_empty() {
        let mut framer = LineFramer::with_max_line_length(4);
        assert!(framer.push(b"{\"error\":\"x\"}").is_empty());
        assert_eq!(framer.finish(), None);
        assert_eq!(framer.push(b"a\n"), vec!["a"]);
    }

    #[test]
    fn test_last_line() {
        assert_eq!(
            last_line(b"running migration...\n{\"result\":true}\n"),
            Some("{\"result\":true}".into())
        );
        assert_eq!(last_line(b"one\ntwo"), Some("two".into()));
        assert_eq!(last_line(b"\n\n"), None);
        assert_eq!(last_line(b""), None);
    }
}
