//! Undo service — reverses and re-applies recorded actions.
//!
//! Two LIFO stacks of action ids: `undoable` (completed mutations not yet
//! undone) and `redoable` (undone, eligible for replay). Undoing restores
//! the recorded before-state; redoing restores the after-state byte for
//! byte. All undo/redo operations run under one async mutex, so a given
//! action can never be undone and redone concurrently.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use ud_domain::error::{Error, Result};
use ud_tools::file_ops;

use super::actions::{ActionLog, ActionRecord, StateSnapshot};
use super::memory::MemoryStore;

pub struct UndoService {
    log: Arc<ActionLog>,
    memory: Arc<MemoryStore>,
    undoable: Mutex<Vec<Uuid>>,
    redoable: Mutex<Vec<Uuid>>,
    /// Serializes undo/redo application.
    op_lock: tokio::sync::Mutex<()>,
}

impl UndoService {
    pub fn new(log: Arc<ActionLog>, memory: Arc<MemoryStore>) -> Self {
        Self {
            log,
            memory,
            undoable: Mutex::new(Vec::new()),
            redoable: Mutex::new(Vec::new()),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Register a freshly completed undoable action. A new mutation
    /// invalidates the redo history.
    pub fn record(&self, action_id: Uuid) {
        self.undoable.lock().push(action_id);
        self.redoable.lock().clear();
    }

    pub fn undoable_ids(&self) -> Vec<Uuid> {
        self.undoable.lock().clone()
    }

    pub fn redoable_ids(&self) -> Vec<Uuid> {
        self.redoable.lock().clone()
    }

    // ── Undo ──────────────────────────────────────────────────────────

    /// Undo one action by id. Returns `false` when the action is not on
    /// the undo stack (already undone, or never undoable).
    pub async fn undo_action(&self, id: &Uuid) -> Result<bool> {
        let _guard = self.op_lock.lock().await;
        self.undo_one(id)
    }

    /// Undo the top `n` actions, most recent first. Returns the ids
    /// actually undone.
    pub async fn undo_last_n(&self, n: usize) -> Result<Vec<Uuid>> {
        let _guard = self.op_lock.lock().await;
        let targets: Vec<Uuid> = {
            let stack = self.undoable.lock();
            stack.iter().rev().take(n).copied().collect()
        };
        let mut undone = Vec::new();
        for id in targets {
            if self.undo_one(&id)? {
                undone.push(id);
            }
        }
        Ok(undone)
    }

    pub async fn undo_all(&self) -> Result<Vec<Uuid>> {
        let depth = self.undoable.lock().len();
        self.undo_last_n(depth).await
    }

    fn undo_one(&self, id: &Uuid) -> Result<bool> {
        let position = {
            let stack = self.undoable.lock();
            stack.iter().rposition(|x| x == id)
        };
        let Some(position) = position else {
            return Ok(false);
        };

        let record = self.log.get(id)?;
        self.apply_snapshot(&record, record.before_state.as_ref())?;

        self.undoable.lock().remove(position);
        self.redoable.lock().push(*id);
        tracing::info!(action_id = %id, tool = %record.tool_name, "action undone");
        Ok(true)
    }

    // ── Redo ──────────────────────────────────────────────────────────

    pub async fn redo_action(&self, id: &Uuid) -> Result<bool> {
        let _guard = self.op_lock.lock().await;
        self.redo_one(id)
    }

    pub async fn redo_last_n(&self, n: usize) -> Result<Vec<Uuid>> {
        let _guard = self.op_lock.lock().await;
        let targets: Vec<Uuid> = {
            let stack = self.redoable.lock();
            stack.iter().rev().take(n).copied().collect()
        };
        let mut redone = Vec::new();
        for id in targets {
            if self.redo_one(&id)? {
                redone.push(id);
            }
        }
        Ok(redone)
    }

    pub async fn redo_all(&self) -> Result<Vec<Uuid>> {
        let depth = self.redoable.lock().len();
        self.redo_last_n(depth).await
    }

    fn redo_one(&self, id: &Uuid) -> Result<bool> {
        let position = {
            let stack = self.redoable.lock();
            stack.iter().rposition(|x| x == id)
        };
        let Some(position) = position else {
            return Ok(false);
        };

        let record = self.log.get(id)?;
        self.apply_snapshot(&record, record.after_state.as_ref())?;

        self.redoable.lock().remove(position);
        self.undoable.lock().push(*id);
        tracing::info!(action_id = %id, tool = %record.tool_name, "action redone");
        Ok(true)
    }

    // ── Inverse application ───────────────────────────────────────────

    fn apply_snapshot(&self, record: &ActionRecord, snapshot: Option<&StateSnapshot>) -> Result<()> {
        let Some(snapshot) = snapshot else {
            return Err(Error::Validation(format!(
                "action '{}' ({}) has no recorded state to restore",
                record.id, record.tool_name
            )));
        };
        match snapshot {
            StateSnapshot::File { path, content } => {
                file_ops::restore_state(Path::new(path), content.as_deref())
            }
            StateSnapshot::Memory { key, value } => self.memory.restore(key, value.as_ref()),
        }
    }
}
