//! Aggregated output buffering for exec sessions.
//!
//! Output is held in two forms: a ring-buffered `aggregated` string with a
//! hard byte cap (oldest bytes dropped, `truncated` flagged) and a cheap
//! character tail for previews. PTY streams are sanitized of DSR/cursor
//! report sequences before aggregation.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Ring-buffered combined output with a hard cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputBuffer {
    pub combined: String,
    pub max_bytes: usize,
    #[serde(default)]
    pub truncated: bool,
}

impl OutputBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            combined: String::new(),
            max_bytes,
            truncated: false,
        }
    }

    pub fn push(&mut self, text: &str) {
        self.combined.push_str(text);
        if self.combined.len() > self.max_bytes {
            self.truncated = true;
            let keep = self.max_bytes * 3 / 4;
            let drain_count = self.combined.len() - keep;
            // Land on a char boundary so we never split a multi-byte char.
            let mut boundary = drain_count;
            while boundary < self.combined.len() && !self.combined.is_char_boundary(boundary) {
                boundary += 1;
            }
            self.combined.drain(..boundary);
        }
    }

    pub fn len(&self) -> usize {
        self.combined.len()
    }

    pub fn is_empty(&self) -> bool {
        self.combined.is_empty()
    }

    /// Last `chars` characters of the combined output.
    pub fn tail_chars(&self, chars: usize) -> String {
        let count = self.combined.chars().count();
        if count <= chars {
            return self.combined.clone();
        }
        self.combined.chars().skip(count - chars).collect()
    }

    /// Incremental read from a byte offset (clamped to char boundaries).
    pub fn read_from(&self, offset: usize, limit: Option<usize>) -> &str {
        let mut start = offset.min(self.combined.len());
        while start < self.combined.len() && !self.combined.is_char_boundary(start) {
            start += 1;
        }
        let mut end = match limit {
            Some(l) => (start + l).min(self.combined.len()),
            None => self.combined.len(),
        };
        while end < self.combined.len() && !self.combined.is_char_boundary(end) {
            end += 1;
        }
        &self.combined[start..end]
    }
}

/// Strip terminal device-status and cursor-position report sequences
/// (`ESC [ ... R` / `ESC [ ... n`) that PTY-backed shells echo into the
/// stream. Plain text and other escape sequences pass through.
pub fn strip_dsr_sequences(text: &str) -> String {
    static DSR: OnceLock<regex::Regex> = OnceLock::new();
    let re = DSR.get_or_init(|| {
        regex::Regex::new("\u{1b}\\[[0-9;?]*[Rn]").unwrap()
    });
    re.replace_all(text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_within_cap() {
        let mut buf = OutputBuffer::new(100);
        buf.push("hello");
        assert_eq!(buf.combined, "hello");
        assert!(!buf.truncated);
    }

    #[test]
    fn overflow_drops_oldest_and_flags_truncated() {
        let mut buf = OutputBuffer::new(100);
        for _ in 0..30 {
            buf.push("0123456789");
        }
        assert!(buf.truncated);
        assert!(buf.len() <= 100);
        // Newest bytes survive.
        assert!(buf.combined.ends_with("0123456789"));
    }

    #[test]
    fn overflow_respects_char_boundaries() {
        let mut buf = OutputBuffer::new(10);
        buf.push("éééééééééé"); // 20 bytes
        assert!(buf.truncated);
        // Must still be valid UTF-8 (would have panicked on a bad drain).
        assert!(buf.combined.chars().all(|c| c == 'é'));
    }

    #[test]
    fn tail_chars_returns_suffix() {
        let mut buf = OutputBuffer::new(1000);
        buf.push("abcdefgh");
        assert_eq!(buf.tail_chars(3), "fgh");
        assert_eq!(buf.tail_chars(100), "abcdefgh");
    }

    #[test]
    fn read_from_offset() {
        let mut buf = OutputBuffer::new(1000);
        buf.push("abcdefgh");
        assert_eq!(buf.read_from(4, None), "efgh");
        assert_eq!(buf.read_from(4, Some(2)), "ef");
        assert_eq!(buf.read_from(100, None), "");
    }

    #[test]
    fn dsr_sequences_stripped() {
        let raw = "before\u{1b}[12;40Rafter\u{1b}[6nend";
        assert_eq!(strip_dsr_sequences(raw), "beforeafterend");
    }

    #[test]
    fn dsr_stripper_leaves_plain_text() {
        assert_eq!(strip_dsr_sequences("no escapes here"), "no escapes here");
        // Color sequences are not DSR — left alone.
        let colored = "\u{1b}[31mred\u{1b}[0m";
        assert_eq!(strip_dsr_sequences(colored), colored);
    }
}
