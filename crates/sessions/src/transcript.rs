//! Append-only JSONL transcripts.
//!
//! Each session gets a `<sessionKey>.jsonl` file under the sessions
//! directory. Every user/assistant/tool turn is appended as a single JSON
//! line. Malformed lines are skipped on read (corrupt state never crashes
//! the daemon).

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use ud_domain::error::Result;

/// A single transcript line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptLine {
    pub timestamp: String,
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Reads and appends session transcript files.
pub struct TranscriptStore {
    base_dir: PathBuf,
}

impl TranscriptStore {
    pub fn new(base_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(base_dir)?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
        })
    }

    /// Helper to create a transcript line stamped with the current time.
    pub fn line(role: &str, content: &str) -> TranscriptLine {
        TranscriptLine {
            timestamp: Utc::now().to_rfc3339(),
            role: role.to_owned(),
            content: content.to_owned(),
            metadata: None,
        }
    }

    /// Append one or more lines to a session's transcript.
    pub fn append(&self, session_key: &str, lines: &[TranscriptLine]) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }

        let path = self.path_for(session_key);
        let mut buf = String::new();
        for line in lines {
            buf.push_str(&serde_json::to_string(line)?);
            buf.push('\n');
        }

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(buf.as_bytes())?;
        Ok(())
    }

    /// Read back a full transcript.
    pub fn read(&self, session_key: &str) -> Result<Vec<TranscriptLine>> {
        let path = self.path_for(session_key);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let raw = std::fs::read_to_string(&path)?;
        let mut lines = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TranscriptLine>(line) {
                Ok(tl) => lines.push(tl),
                Err(e) => {
                    tracing::warn!(
                        session_key,
                        error = %e,
                        "skipping malformed transcript line"
                    );
                }
            }
        }
        Ok(lines)
    }

    /// Read the last `max_lines` lines — the bounded history window the
    /// executor feeds into the prompt.
    pub fn read_window(&self, session_key: &str, max_lines: usize) -> Result<Vec<TranscriptLine>> {
        let mut lines = self.read(session_key)?;
        if lines.len() > max_lines {
            lines.drain(..lines.len() - max_lines);
        }
        Ok(lines)
    }

    fn path_for(&self, session_key: &str) -> PathBuf {
        self.base_dir.join(format!("{session_key}.jsonl"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, TranscriptStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn append_and_read() {
        let (_dir, store) = store();
        store
            .append(
                "chan:telegram:1",
                &[
                    TranscriptStore::line("user", "hello"),
                    TranscriptStore::line("assistant", "hi"),
                ],
            )
            .unwrap();

        let lines = store.read("chan:telegram:1").unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].role, "user");
        assert_eq!(lines[1].content, "hi");
    }

    #[test]
    fn read_missing_session_is_empty() {
        let (_dir, store) = store();
        assert!(store.read("chan:x:y").unwrap().is_empty());
    }

    #[test]
    fn append_empty_is_noop() {
        let (_dir, store) = store();
        store.append("s", &[]).unwrap();
        assert!(store.read("s").unwrap().is_empty());
    }

    #[test]
    fn malformed_lines_skipped() {
        let (dir, store) = store();
        store
            .append("s", &[TranscriptStore::line("user", "good")])
            .unwrap();
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("s.jsonl"))
            .unwrap();
        writeln!(f, "{{garbage").unwrap();
        store
            .append("s", &[TranscriptStore::line("user", "also good")])
            .unwrap();

        let lines = store.read("s").unwrap();
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn window_returns_tail() {
        let (_dir, store) = store();
        for i in 0..10 {
            store
                .append("s", &[TranscriptStore::line("user", &format!("m{i}"))])
                .unwrap();
        }
        let window = store.read_window("s", 3).unwrap();
        assert_eq!(window.len(), 3);
        assert_eq!(window[0].content, "m7");
        assert_eq!(window[2].content, "m9");
    }

    #[test]
    fn window_smaller_than_history_returns_all() {
        let (_dir, store) = store();
        store
            .append("s", &[TranscriptStore::line("user", "only")])
            .unwrap();
        let window = store.read_window("s", 100).unwrap();
        assert_eq!(window.len(), 1);
    }
}
