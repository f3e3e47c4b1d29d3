//! Run records and their durable event logs.
//!
//! Each run persists as one `runs/<id>.jsonl` file: the first line is the
//! run header, every following line one event. Events are append-only;
//! header changes (status transitions) rewrite the file atomically
//! (temp + rename). On boot, runs stranded in a non-terminal state are
//! marked failed with reason "orphaned on restart".

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ud_domain::error::{Error, Result};

use super::bus::EventBus;
use super::events::{RunEvent, RunEventKind};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Planning,
    ApprovalRequired,
    Applying,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Applied,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled | Self::Applied)
    }

    /// States the executor actively works in (and that can be paused).
    pub fn is_active(self) -> bool {
        matches!(self, Self::Planning | Self::Applying | Self::ApprovalRequired)
    }

    /// Valid transitions. `Failed` is reachable from every non-terminal
    /// state (the error path is always open); `Applied` only follows
    /// `Completed`.
    pub fn can_transition(self, to: RunStatus) -> bool {
        use RunStatus::*;
        match (self, to) {
            (Created, Planning) => true,
            (Planning, Applying) | (Planning, Completed) => true,
            (Applying, ApprovalRequired) | (Applying, Completed) => true,
            (ApprovalRequired, Applying) => true,
            (Completed, Applied) => true,
            // Pause from any active state; resume is validated against
            // the remembered prior state by the store.
            (s, Paused) if s.is_active() => true,
            (Paused, s) if s.is_active() => true,
            // Cancellation from anything non-terminal, including paused.
            (s, Cancelled) if !s.is_terminal() => true,
            // Failure from anything non-terminal.
            (s, Failed) if !s.is_terminal() => true,
            _ => false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Creator id stamped onto scheduler-originated runs.
pub const SCHEDULER_USER: &str = "scheduler";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub instruction: String,
    pub agent_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    /// Chat-session key; runs with one share a persistent transcript.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: RunStatus,
    /// The active state a paused run resumes into.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_from: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for creating a run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub instruction: String,
    pub agent_id: Option<String>,
    pub user_id: String,
    pub job_id: Option<Uuid>,
    pub session_id: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run store (persistence)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events kept per run when replaying to a client. Replay truncates
/// from the middle; the durable log always keeps everything.
pub const MAX_REPLAY_EVENTS: usize = 500;

struct RunEntry {
    record: RunRecord,
    events: Vec<RunEvent>,
    next_seq: u64,
}

pub struct RunStore {
    inner: RwLock<HashMap<Uuid, RunEntry>>,
    dir: PathBuf,
}

impl RunStore {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let store = Self {
            inner: RwLock::new(HashMap::new()),
            dir: dir.to_path_buf(),
        };
        store.load();
        Ok(store)
    }

    fn load(&self) {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(_) => return,
        };
        let mut inner = self.inner.write();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Ok(raw) = std::fs::read_to_string(&path) else {
                continue;
            };
            let mut lines = raw.lines().filter(|l| !l.trim().is_empty());
            let Some(header_line) = lines.next() else {
                continue;
            };
            let record = match serde_json::from_str::<RunRecord>(header_line) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "corrupt run header, skipping");
                    continue;
                }
            };
            let mut events = Vec::new();
            for line in lines {
                match serde_json::from_str::<RunEvent>(line) {
                    Ok(ev) => events.push(ev),
                    Err(e) => {
                        tracing::warn!(run_id = %record.id, error = %e, "corrupt event line, skipping");
                    }
                }
            }
            let next_seq = events.last().map_or(0, |e| e.seq + 1);
            inner.insert(
                record.id,
                RunEntry {
                    record,
                    events,
                    next_seq,
                },
            );
        }
        tracing::info!(count = inner.len(), "loaded runs from disk");
    }

    fn path_for(&self, id: &Uuid) -> PathBuf {
        self.dir.join(format!("{id}.jsonl"))
    }

    /// Rewrite a run's file (header + events) via temp + rename.
    fn rewrite(&self, entry: &RunEntry) -> Result<()> {
        let path = self.path_for(&entry.record.id);
        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut f = std::fs::File::create(&tmp)?;
            writeln!(f, "{}", serde_json::to_string(&entry.record)?)?;
            for event in &entry.events {
                writeln!(f, "{}", serde_json::to_string(event)?)?;
            }
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn append_line(&self, id: &Uuid, event: &RunEvent) -> Result<()> {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(id))?;
        writeln!(f, "{}", serde_json::to_string(event)?)?;
        Ok(())
    }

    pub fn create(&self, new: NewRun) -> Result<RunRecord> {
        let now = Utc::now();
        let record = RunRecord {
            id: Uuid::new_v4(),
            instruction: new.instruction,
            agent_id: new.agent_id.unwrap_or_else(|| "default".to_owned()),
            user_id: new.user_id,
            job_id: new.job_id,
            session_id: new.session_id,
            status: RunStatus::Created,
            paused_from: None,
            status_reason: None,
            created_at: now,
            updated_at: now,
        };
        let entry = RunEntry {
            record: record.clone(),
            events: Vec::new(),
            next_seq: 0,
        };
        self.rewrite(&entry)?;
        self.inner.write().insert(record.id, entry);
        Ok(record)
    }

    pub fn get(&self, id: &Uuid) -> Option<RunRecord> {
        self.inner.read().get(id).map(|e| e.record.clone())
    }

    /// Newest first.
    pub fn list(&self) -> Vec<RunRecord> {
        let mut records: Vec<RunRecord> = self
            .inner
            .read()
            .values()
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    pub fn list_by_job(&self, job_id: &Uuid) -> Vec<RunRecord> {
        let mut records: Vec<RunRecord> = self
            .inner
            .read()
            .values()
            .filter(|e| e.record.job_id.as_ref() == Some(job_id))
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    pub fn delete(&self, id: &Uuid) -> Result<()> {
        let removed = self.inner.write().remove(id);
        if removed.is_none() {
            return Err(Error::NotFound(format!("run '{id}' not found")));
        }
        let _ = std::fs::remove_file(self.path_for(id));
        Ok(())
    }

    fn allocate_seq(&self, id: &Uuid) -> Result<u64> {
        let mut inner = self.inner.write();
        let entry = inner
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("run '{id}' not found")))?;
        let seq = entry.next_seq;
        entry.next_seq += 1;
        Ok(seq)
    }

    /// Append an event to the in-memory log and the durable file.
    fn persist_event(&self, event: &RunEvent) {
        let mut inner = self.inner.write();
        let Some(entry) = inner.get_mut(&event.run_id) else {
            return;
        };
        // Idempotent: an event at or below the last persisted seq is a
        // replay, not a new append.
        if entry.events.last().map_or(false, |last| event.seq <= last.seq) {
            return;
        }
        entry.events.push(event.clone());
        drop(inner);
        if let Err(e) = self.append_line(&event.run_id, event) {
            tracing::warn!(run_id = %event.run_id, error = %e, "event append failed");
        }
    }

    /// Validate and apply a status transition. Returns the updated record.
    fn update_status(
        &self,
        id: &Uuid,
        to: RunStatus,
        reason: Option<String>,
    ) -> Result<RunRecord> {
        let mut inner = self.inner.write();
        let entry = inner
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("run '{id}' not found")))?;
        let from = entry.record.status;

        if !from.can_transition(to) {
            return Err(Error::Validation(format!(
                "invalid status transition {from:?} -> {to:?}"
            )));
        }
        // A resume must return to the state the run was paused from.
        if from == RunStatus::Paused && to.is_active() {
            if entry.record.paused_from != Some(to) {
                return Err(Error::Validation(format!(
                    "run was paused from {:?}, cannot resume into {to:?}",
                    entry.record.paused_from
                )));
            }
            entry.record.paused_from = None;
        }
        if to == RunStatus::Paused {
            entry.record.paused_from = Some(from);
        }

        entry.record.status = to;
        entry.record.status_reason = reason;
        entry.record.updated_at = Utc::now();
        let record = entry.record.clone();
        if let Err(e) = self.rewrite(entry) {
            tracing::warn!(run_id = %id, error = %e, "run header rewrite failed");
        }
        Ok(record)
    }

    /// Full in-order event log.
    pub fn events(&self, id: &Uuid) -> Vec<RunEvent> {
        self.inner
            .read()
            .get(id)
            .map(|e| e.events.clone())
            .unwrap_or_default()
    }

    /// Event log for client replay: over the cap, the middle is elided
    /// (head and tail kept); the durable log is untouched.
    pub fn replay_events(&self, id: &Uuid) -> Vec<RunEvent> {
        let inner = self.inner.read();
        let Some(entry) = inner.get(id) else {
            return Vec::new();
        };
        if entry.events.len() <= MAX_REPLAY_EVENTS {
            return entry.events.clone();
        }
        let half = MAX_REPLAY_EVENTS / 2;
        let tail_start = entry.events.len() - half;
        entry.events[..half]
            .iter()
            .chain(entry.events[tail_start..].iter())
            .cloned()
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run manager (store + bus)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The single mutation path for runs: creates records, assigns event
/// sequence numbers, and publishes onto the bus (whose persistence sink
/// writes through the store).
pub struct RunManager {
    store: Arc<RunStore>,
    bus: Arc<EventBus>,
    /// Serializes sequence allocation + publish so subscribers observe
    /// events in sequence order.
    emit_lock: Mutex<()>,
}

impl RunManager {
    pub fn new(store: Arc<RunStore>, bus: Arc<EventBus>) -> Arc<Self> {
        // Persistence is the first registered sink: every published event
        // lands in the durable log before any subscriber sees it.
        let persist_store = store.clone();
        bus.on_all(move |event| persist_store.persist_event(event));
        Arc::new(Self {
            store,
            bus,
            emit_lock: Mutex::new(()),
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn create(&self, new: NewRun) -> Result<RunRecord> {
        let record = self.store.create(new)?;
        tracing::info!(run_id = %record.id, user_id = %record.user_id, "run created");
        Ok(record)
    }

    pub fn get(&self, id: &Uuid) -> Option<RunRecord> {
        self.store.get(id)
    }

    pub fn list(&self) -> Vec<RunRecord> {
        self.store.list()
    }

    pub fn list_by_job(&self, job_id: &Uuid) -> Vec<RunRecord> {
        self.store.list_by_job(job_id)
    }

    pub fn delete(&self, id: &Uuid) -> Result<()> {
        self.store.delete(id)
    }

    pub fn events(&self, id: &Uuid) -> Vec<RunEvent> {
        self.store.events(id)
    }

    pub fn replay_events(&self, id: &Uuid) -> Vec<RunEvent> {
        self.store.replay_events(id)
    }

    /// Emit an event for a run: assign the next sequence number and
    /// publish (persisting via the bus sink).
    pub fn emit(&self, run_id: &Uuid, kind: RunEventKind) -> Result<RunEvent> {
        let _guard = self.emit_lock.lock();
        let seq = self.store.allocate_seq(run_id)?;
        let event = RunEvent {
            run_id: *run_id,
            seq,
            ts: Utc::now(),
            kind,
        };
        self.bus.publish(&event);
        Ok(event)
    }

    /// Validated status transition + `STATUS_CHANGED` event.
    pub fn update_status(
        &self,
        id: &Uuid,
        to: RunStatus,
        reason: Option<String>,
    ) -> Result<RunRecord> {
        let record = self.store.update_status(id, to, reason.clone())?;
        self.emit(id, RunEventKind::StatusChanged { status: to, reason })?;
        if to.is_terminal() {
            self.bus.cleanup_run(id);
        }
        Ok(record)
    }

    /// Cancel unless the run already reached a terminal state.
    pub fn cancel_if_active(&self, id: &Uuid, reason: Option<String>) -> Result<Option<RunRecord>> {
        let Some(record) = self.store.get(id) else {
            return Err(Error::NotFound(format!("run '{id}' not found")));
        };
        if record.status.is_terminal() {
            return Ok(None);
        }
        self.update_status(id, RunStatus::Cancelled, reason).map(Some)
    }

    /// Re-applying an applied run is a no-op.
    pub fn apply(&self, id: &Uuid) -> Result<RunRecord> {
        let Some(record) = self.store.get(id) else {
            return Err(Error::NotFound(format!("run '{id}' not found")));
        };
        if record.status == RunStatus::Applied {
            return Ok(record);
        }
        self.update_status(id, RunStatus::Applied, None)
    }

    /// Boot pass: fail every run stranded in a non-terminal state.
    /// Returns how many were marked.
    pub fn mark_orphans(&self) -> usize {
        let orphans: Vec<Uuid> = self
            .store
            .list()
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.id)
            .collect();
        for id in &orphans {
            if let Err(e) =
                self.update_status(id, RunStatus::Failed, Some("orphaned on restart".into()))
            {
                tracing::warn!(run_id = %id, error = %e, "orphan marking failed");
            }
        }
        orphans.len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn new_run() -> NewRun {
        NewRun {
            instruction: "echo hello".into(),
            agent_id: None,
            user_id: "tester".into(),
            job_id: None,
            session_id: None,
        }
    }

    fn manager(dir: &Path) -> Arc<RunManager> {
        let store = Arc::new(RunStore::new(dir).unwrap());
        RunManager::new(store, Arc::new(EventBus::new()))
    }

    #[test]
    fn transition_table() {
        use RunStatus::*;
        assert!(Created.can_transition(Planning));
        assert!(Planning.can_transition(Applying));
        assert!(Applying.can_transition(Completed));
        assert!(Applying.can_transition(ApprovalRequired));
        assert!(ApprovalRequired.can_transition(Applying));
        assert!(ApprovalRequired.can_transition(Cancelled));
        assert!(Completed.can_transition(Applied));
        assert!(Planning.can_transition(Paused));
        assert!(Paused.can_transition(Cancelled));

        assert!(!Created.can_transition(Completed));
        assert!(!Completed.can_transition(Planning));
        assert!(!Cancelled.can_transition(Planning));
        assert!(!Applied.can_transition(Cancelled));
        assert!(!Failed.can_transition(Planning));
    }

    #[test]
    fn create_and_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let run = mgr.create(new_run()).unwrap();
        assert_eq!(run.status, RunStatus::Created);
        assert_eq!(run.agent_id, "default");

        mgr.update_status(&run.id, RunStatus::Planning, None).unwrap();
        mgr.update_status(&run.id, RunStatus::Applying, None).unwrap();
        let done = mgr.update_status(&run.id, RunStatus::Completed, None).unwrap();
        assert_eq!(done.status, RunStatus::Completed);

        // The status changes are in the event log, in order.
        let events = mgr.events(&run.id);
        let statuses: Vec<&str> = events.iter().map(|e| e.kind.type_name()).collect();
        assert_eq!(statuses, vec!["STATUS_CHANGED"; 3]);
        assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn invalid_transition_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let run = mgr.create(new_run()).unwrap();
        let err = mgr
            .update_status(&run.id, RunStatus::Completed, None)
            .unwrap_err();
        assert_eq!(err.code(), "Validation");
    }

    #[test]
    fn pause_resumes_to_prior_state() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let run = mgr.create(new_run()).unwrap();
        mgr.update_status(&run.id, RunStatus::Planning, None).unwrap();
        mgr.update_status(&run.id, RunStatus::Applying, None).unwrap();

        let paused = mgr.update_status(&run.id, RunStatus::Paused, None).unwrap();
        assert_eq!(paused.paused_from, Some(RunStatus::Applying));

        // Resuming into a different active state is rejected.
        assert!(mgr.update_status(&run.id, RunStatus::Planning, None).is_err());

        let resumed = mgr.update_status(&run.id, RunStatus::Applying, None).unwrap();
        assert_eq!(resumed.status, RunStatus::Applying);
        assert!(resumed.paused_from.is_none());
    }

    #[test]
    fn cancel_from_paused_is_direct() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let run = mgr.create(new_run()).unwrap();
        mgr.update_status(&run.id, RunStatus::Planning, None).unwrap();
        mgr.update_status(&run.id, RunStatus::Paused, None).unwrap();

        let cancelled = mgr.cancel_if_active(&run.id, None).unwrap().unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
    }

    #[test]
    fn cancel_terminal_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let run = mgr.create(new_run()).unwrap();
        mgr.update_status(&run.id, RunStatus::Planning, None).unwrap();
        mgr.update_status(&run.id, RunStatus::Completed, None).unwrap();

        assert!(mgr.cancel_if_active(&run.id, None).unwrap().is_none());
        // No second terminal STATUS_CHANGED was emitted.
        let terminal_count = mgr
            .events(&run.id)
            .iter()
            .filter(|e| matches!(
                e.kind,
                RunEventKind::StatusChanged { status, .. } if status.is_terminal()
            ))
            .count();
        assert_eq!(terminal_count, 1);
    }

    #[test]
    fn apply_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let run = mgr.create(new_run()).unwrap();
        mgr.update_status(&run.id, RunStatus::Planning, None).unwrap();
        mgr.update_status(&run.id, RunStatus::Completed, None).unwrap();

        let first = mgr.apply(&run.id).unwrap();
        assert_eq!(first.status, RunStatus::Applied);
        let events_after_first = mgr.events(&run.id).len();

        let second = mgr.apply(&run.id).unwrap();
        assert_eq!(second.status, RunStatus::Applied);
        assert_eq!(mgr.events(&run.id).len(), events_after_first);
    }

    #[test]
    fn events_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let run_id;
        {
            let mgr = manager(dir.path());
            let run = mgr.create(new_run()).unwrap();
            run_id = run.id;
            mgr.update_status(&run.id, RunStatus::Planning, None).unwrap();
            mgr.emit(&run.id, RunEventKind::LlmToken { text: "hi".into() }).unwrap();
            mgr.update_status(&run.id, RunStatus::Completed, None).unwrap();
        }

        let mgr2 = manager(dir.path());
        let record = mgr2.get(&run_id).unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        let events = mgr2.events(&run_id);
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].kind.type_name(), "LLM_TOKEN");
        // Sequence numbers continue after the reload.
        let next = mgr2.emit(&run_id, RunEventKind::RunWarning { message: "x".into() });
        assert!(next.is_err() || next.unwrap().seq == 3);
    }

    #[test]
    fn orphans_marked_failed_on_boot() {
        let dir = tempfile::tempdir().unwrap();
        let run_id;
        {
            let mgr = manager(dir.path());
            let run = mgr.create(new_run()).unwrap();
            run_id = run.id;
            mgr.update_status(&run.id, RunStatus::Planning, None).unwrap();
            // Daemon "dies" here.
        }

        let mgr2 = manager(dir.path());
        let marked = mgr2.mark_orphans();
        assert_eq!(marked, 1);
        let record = mgr2.get(&run_id).unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.status_reason.as_deref(), Some("orphaned on restart"));
    }

    #[test]
    fn completed_runs_not_orphan_marked() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mgr = manager(dir.path());
            let run = mgr.create(new_run()).unwrap();
            mgr.update_status(&run.id, RunStatus::Planning, None).unwrap();
            mgr.update_status(&run.id, RunStatus::Completed, None).unwrap();
        }
        let mgr2 = manager(dir.path());
        assert_eq!(mgr2.mark_orphans(), 0);
    }

    #[test]
    fn replay_truncates_middle_only() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let run = mgr.create(new_run()).unwrap();
        for i in 0..(MAX_REPLAY_EVENTS + 100) {
            mgr.emit(&run.id, RunEventKind::LlmToken { text: format!("t{i}") })
                .unwrap();
        }

        let replay = mgr.replay_events(&run.id);
        assert_eq!(replay.len(), MAX_REPLAY_EVENTS);
        // Head intact.
        assert_eq!(replay[0].seq, 0);
        // Tail intact — the durable log's last event is present.
        let full = mgr.events(&run.id);
        assert_eq!(replay.last().unwrap().seq, full.last().unwrap().seq);
        assert_eq!(full.len(), MAX_REPLAY_EVENTS + 100);
    }

    #[test]
    fn list_by_job() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let job_id = Uuid::new_v4();
        let mut run = new_run();
        run.job_id = Some(job_id);
        run.user_id = SCHEDULER_USER.into();
        mgr.create(run).unwrap();
        mgr.create(new_run()).unwrap();

        let by_job = mgr.list_by_job(&job_id);
        assert_eq!(by_job.len(), 1);
        assert_eq!(by_job[0].user_id, SCHEDULER_USER);
    }

    #[tokio::test]
    async fn subscriber_sees_strictly_ordered_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RunStore::new(dir.path()).unwrap());
        let bus = Arc::new(EventBus::new());
        let mgr = RunManager::new(store, bus.clone());

        let run = mgr.create(new_run()).unwrap();
        let mut rx = bus.subscribe(Some(run.id));

        for i in 0..10 {
            mgr.emit(&run.id, RunEventKind::LlmToken { text: format!("{i}") })
                .unwrap();
        }

        let mut last = None;
        for _ in 0..10 {
            let event = rx.recv().await.unwrap();
            if let Some(prev) = last {
                assert!(event.seq > prev);
            }
            last = Some(event.seq);
        }

        // What the subscriber saw matches the persisted log.
        assert_eq!(mgr.events(&run.id).len(), 10);
    }

    #[test]
    fn delete_removes_record_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let run = mgr.create(new_run()).unwrap();
        mgr.delete(&run.id).unwrap();
        assert!(mgr.get(&run.id).is_none());
        assert!(!dir.path().join(format!("{}.jsonl", run.id)).exists());
        assert_eq!(mgr.delete(&run.id).unwrap_err().code(), "NotFound");
    }
}
