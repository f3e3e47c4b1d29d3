//! Action log — append-only record of every tool invocation.
//!
//! Each dispatch is bracketed by [`ActionLog::begin`] / [`ActionLog::finish`].
//! Records carry the tool's category, the approval outcome, and before/after
//! state snapshots when the tool mutates something the undo service can
//! restore. Undoability is decided at record time and never changes.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use ud_domain::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    Read,
    Mutate,
    Exec,
    Network,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    None,
    Granted,
    Denied,
    NotRequired,
}

/// A restorable snapshot of the state a mutating tool touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateSnapshot {
    /// File contents at a path; `None` content = the file was absent.
    File {
        path: String,
        content: Option<Vec<u8>>,
    },
    /// A memory entry; `None` value = the key was absent.
    Memory {
        key: String,
        value: Option<Value>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    pub tool_name: String,
    pub category: ActionCategory,
    pub args: Value,
    pub approval: ApprovalState,
    pub undoable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_state: Option<StateSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_state: Option<StateSnapshot>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Filter for [`ActionLog::list`].
#[derive(Debug, Clone, Default)]
pub struct ActionFilter {
    pub tool_name: Option<String>,
    pub category: Option<ActionCategory>,
    pub run_id: Option<Uuid>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Log
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const MAX_ACTIONS_IN_MEMORY: usize = 5000;

pub struct ActionLog {
    inner: Mutex<VecDeque<ActionRecord>>,
    log_path: PathBuf,
}

impl ActionLog {
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let log_path = data_dir.join("actions.jsonl");
        let mut records = VecDeque::new();
        if let Ok(raw) = std::fs::read_to_string(&log_path) {
            for line in raw.lines().rev().take(MAX_ACTIONS_IN_MEMORY) {
                if let Ok(record) = serde_json::from_str::<ActionRecord>(line) {
                    records.push_front(record);
                }
            }
        }
        Ok(Self {
            inner: Mutex::new(records),
            log_path,
        })
    }

    /// Open a record for a dispatch that is about to run.
    pub fn begin(
        &self,
        run_id: Option<Uuid>,
        tool_name: &str,
        category: ActionCategory,
        args: Value,
    ) -> ActionRecord {
        ActionRecord {
            id: Uuid::new_v4(),
            run_id,
            tool_name: tool_name.to_owned(),
            category,
            args,
            approval: ApprovalState::None,
            undoable: false,
            before_state: None,
            after_state: None,
            started_at: Utc::now(),
            duration_ms: None,
            error: None,
        }
    }

    /// Seal and append a record. Append-only: the record is immutable
    /// from here on.
    pub fn finish(&self, mut record: ActionRecord) -> ActionRecord {
        record.duration_ms = Some(
            (Utc::now() - record.started_at).num_milliseconds().max(0) as u64,
        );

        if let Ok(json) = serde_json::to_string(&record) {
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)
            {
                Ok(mut f) => {
                    if let Err(e) = writeln!(f, "{json}") {
                        tracing::warn!(error = %e, "action log append failed");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "action log open failed"),
            }
        }

        let mut inner = self.inner.lock();
        inner.push_back(record.clone());
        if inner.len() > MAX_ACTIONS_IN_MEMORY {
            inner.pop_front();
        }
        record
    }

    pub fn get(&self, id: &Uuid) -> Result<ActionRecord> {
        self.inner
            .lock()
            .iter()
            .find(|r| r.id == *id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("action '{id}' not found")))
    }

    /// Newest first.
    pub fn list(&self, filter: &ActionFilter) -> Vec<ActionRecord> {
        self.inner
            .lock()
            .iter()
            .rev()
            .filter(|r| {
                filter
                    .tool_name
                    .as_deref()
                    .map_or(true, |t| r.tool_name == t)
                    && filter.category.map_or(true, |c| r.category == c)
                    && filter.run_id.map_or(true, |id| r.run_id == Some(id))
            })
            .cloned()
            .collect()
    }
}
