//! Exec session registry.
//!
//! Process-wide map of running external-process sessions plus a bounded
//! table of finished ones. Every mutation schedules a debounced atomic
//! snapshot write (mode 0600) so sessions survive a daemon restart: on
//! boot, running entries whose pid is still alive are re-adopted as
//! `recovered`, dead ones are demoted to `failed`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};

use ud_domain::error::{Error, Result};

use crate::output::{strip_dsr_sequences, OutputBuffer};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config & types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Hard cap on aggregated output per session.
    pub max_output_bytes: usize,
    /// Characters kept in the cheap preview tail.
    pub tail_chars: usize,
    /// How long finished sessions stay in the finished table.
    pub finished_ttl: Duration,
    /// Grace between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// Debounce window for snapshot writes.
    pub persist_debounce: Duration,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: 256 * 1024,
            tail_chars: 2000,
            finished_ttl: Duration::from_secs(600),
            kill_grace: Duration::from_secs(3),
            persist_debounce: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Running,
    Exited,
    Killed,
    Failed,
}

impl ExecStatus {
    pub fn is_finished(self) -> bool {
        self != Self::Running
    }
}

/// The serializable state of one exec session. This is what the snapshot
/// file holds; live control handles are kept separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRecord {
    pub id: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub is_pty: bool,
    pub aggregated: OutputBuffer,
    pub status: ExecStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_signal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub backgrounded: bool,
    #[serde(default)]
    pub recovered: bool,
    /// (cols, rows) last requested for a PTY session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pty_size: Option<(u16, u16)>,
}

impl ExecRecord {
    pub fn new(id: String, command: String, cwd: Option<String>, is_pty: bool, max_output_bytes: usize) -> Self {
        Self {
            id,
            command,
            cwd,
            pid: None,
            started_at: Utc::now(),
            is_pty,
            aggregated: OutputBuffer::new(max_output_bytes),
            status: ExecStatus::Running,
            exit_code: None,
            exit_signal: None,
            finished_at: None,
            backgrounded: false,
            recovered: false,
            pty_size: None,
        }
    }

    pub fn truncated(&self) -> bool {
        self.aggregated.truncated
    }
}

/// Messages that can be sent to a session's stdin.
pub enum StdinMessage {
    Data(Vec<u8>),
    Eof,
}

/// Live control handles — never serialized. A recovered session has none.
#[derive(Default)]
pub struct ExecHandles {
    pub stdin_tx: Option<mpsc::Sender<StdinMessage>>,
}

pub struct LiveSession {
    pub record: ExecRecord,
    pub handles: ExecHandles,
    pub exit_notify: Arc<Notify>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    running: Vec<ExecRecord>,
    finished: Vec<ExecRecord>,
}

/// Interior state, shared with the debounced persistence task.
struct ExecInner {
    running: RwLock<HashMap<String, Arc<RwLock<LiveSession>>>>,
    finished: RwLock<HashMap<String, ExecRecord>>,
    state_path: PathBuf,
    config: ExecConfig,
    id_counter: AtomicU64,
    persist_pending: AtomicBool,
}

pub struct ExecRegistry {
    inner: Arc<ExecInner>,
}

impl ExecRegistry {
    pub fn new(state_path: &Path, config: ExecConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(ExecInner {
                running: RwLock::new(HashMap::new()),
                finished: RwLock::new(HashMap::new()),
                state_path: state_path.to_path_buf(),
                config,
                id_counter: AtomicU64::new(0),
                persist_pending: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &ExecConfig {
        &self.inner.config
    }

    /// Timestamp-sortable session id: `<unix_millis>-<counter>`.
    pub fn create_session_id(&self) -> String {
        let millis = Utc::now().timestamp_millis().max(0) as u64;
        let n = self.inner.id_counter.fetch_add(1, Ordering::Relaxed);
        format!("{millis:013}-{n:04}")
    }

    // ── Session lifecycle ─────────────────────────────────────────────

    pub fn add_session(
        &self,
        record: ExecRecord,
        handles: ExecHandles,
    ) -> Arc<RwLock<LiveSession>> {
        let id = record.id.clone();
        let live = Arc::new(RwLock::new(LiveSession {
            record,
            handles,
            exit_notify: Arc::new(Notify::new()),
        }));
        self.inner.running.write().insert(id, live.clone());
        self.schedule_persist();
        live
    }

    /// Append a chunk of output. PTY streams are sanitized of DSR
    /// sequences before aggregation.
    pub fn append_output(&self, id: &str, chunk: &str) {
        let Some(live) = self.inner.running.read().get(id).cloned() else {
            return;
        };
        {
            let mut s = live.write();
            if s.record.is_pty {
                s.record.aggregated.push(&strip_dsr_sequences(chunk));
            } else {
                s.record.aggregated.push(chunk);
            }
        }
        self.schedule_persist();
    }

    /// Move a session to the finished table.
    pub fn mark_exited(&self, id: &str, exit_code: Option<i32>, signal: Option<&str>) {
        let removed = self.inner.running.write().remove(id);
        if let Some(live) = removed {
            let notify = {
                let mut s = live.write();
                s.record.status = match (exit_code, signal) {
                    (Some(_), _) => ExecStatus::Exited,
                    (None, Some(_)) => ExecStatus::Killed,
                    (None, None) => ExecStatus::Failed,
                };
                s.record.exit_code = exit_code;
                s.record.exit_signal = signal.map(str::to_owned);
                s.record.finished_at = Some(Utc::now());
                s.handles.stdin_tx = None;
                s.exit_notify.clone()
            };
            let record = live.read().record.clone();
            self.inner.finished.write().insert(id.to_owned(), record);
            notify.notify_waiters();
            self.schedule_persist();
        }
    }

    pub fn mark_backgrounded(&self, id: &str) {
        if let Some(live) = self.inner.running.read().get(id).cloned() {
            live.write().record.backgrounded = true;
            self.schedule_persist();
        }
    }

    pub async fn write_stdin(&self, id: &str, data: Vec<u8>, eof: bool) -> Result<()> {
        let tx = self
            .inner
            .running
            .read()
            .get(id)
            .and_then(|live| live.read().handles.stdin_tx.clone());
        let Some(tx) = tx else {
            return Err(Error::NotFound(format!(
                "session '{id}' not found or stdin closed"
            )));
        };
        if !data.is_empty() {
            tx.send(StdinMessage::Data(data))
                .await
                .map_err(|_| Error::Transient("stdin channel closed".into()))?;
        }
        if eof {
            let _ = tx.send(StdinMessage::Eof).await;
        }
        Ok(())
    }

    /// Record a resize request for a PTY session.
    pub fn resize_pty(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        let Some(live) = self.inner.running.read().get(id).cloned() else {
            return Err(Error::NotFound(format!("session '{id}' not found")));
        };
        {
            let mut s = live.write();
            if !s.record.is_pty {
                return Err(Error::Validation(format!("session '{id}' is not a pty")));
            }
            s.record.pty_size = Some((cols, rows));
        }
        self.schedule_persist();
        Ok(())
    }

    /// Kill a running session: SIGTERM, then SIGKILL after the grace
    /// period if it is still alive.
    pub async fn kill_session(&self, id: &str) -> Result<()> {
        let pid = {
            let running = self.inner.running.read();
            let live = running
                .get(id)
                .ok_or_else(|| Error::NotFound(format!("session '{id}' not found")))?;
            let pid = live
                .read()
                .record
                .pid
                .ok_or_else(|| Error::Validation(format!("session '{id}' has no pid")))?;
            pid
        };

        send_signal(pid, Signal::Term);
        tokio::time::sleep(self.inner.config.kill_grace).await;

        if self.inner.running.read().contains_key(id) {
            send_signal(pid, Signal::Kill);
            // A recovered session has no monitor task to observe the exit;
            // probe directly and demote.
            if !pid_alive(pid) {
                self.mark_exited(id, None, Some("SIGKILL"));
            }
        }
        Ok(())
    }

    /// Wait until the session reaches the finished table.
    pub async fn wait_for_exit(&self, id: &str, timeout: Duration) -> Result<ExecRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(record) = self.inner.finished.read().get(id).cloned() {
                return Ok(record);
            }
            let notify = match self.inner.running.read().get(id) {
                Some(live) => live.read().exit_notify.clone(),
                None => {
                    // Neither running nor finished.
                    return Err(Error::NotFound(format!("session '{id}' not found")));
                }
            };
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(format!("session '{id}' still running")));
            }
            // Recovered sessions have no monitor to fire the notify; poll.
            let poll = remaining.min(Duration::from_millis(200));
            let _ = tokio::time::timeout(poll, notify.notified()).await;
        }
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Option<ExecRecord> {
        if let Some(live) = self.inner.running.read().get(id) {
            return Some(live.read().record.clone());
        }
        self.inner.finished.read().get(id).cloned()
    }

    pub fn list_running(&self) -> Vec<ExecRecord> {
        self.inner.list_running()
    }

    pub fn list_finished(&self) -> Vec<ExecRecord> {
        self.inner.list_finished()
    }

    /// Preview tail for a session.
    pub fn tail(&self, id: &str) -> Option<String> {
        self.get(id)
            .map(|r| r.aggregated.tail_chars(self.inner.config.tail_chars))
    }

    /// Drop every finished session. Returns how many were cleared.
    pub fn clear_finished(&self) -> usize {
        let cleared = {
            let mut finished = self.inner.finished.write();
            let n = finished.len();
            finished.clear();
            n
        };
        if cleared > 0 {
            self.schedule_persist();
        }
        cleared
    }

    /// Forget a session entirely. A running session is killed first; the
    /// record is then dropped from both tables.
    pub async fn remove_session(&self, id: &str) -> Result<()> {
        let was_running = self.inner.running.read().contains_key(id);
        if was_running {
            self.kill_session(id).await?;
        }
        let removed_running = self.inner.running.write().remove(id).is_some();
        let removed_finished = self.inner.finished.write().remove(id).is_some();
        if !(was_running || removed_running || removed_finished) {
            return Err(Error::NotFound(format!("session '{id}' not found")));
        }
        self.schedule_persist();
        Ok(())
    }

    // ── Maintenance ───────────────────────────────────────────────────

    /// Drop finished sessions past the TTL and demote recovered sessions
    /// whose pid has died. Called periodically by the daemon.
    pub fn sweep(&self) {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.inner.config.finished_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let mut changed = false;

        {
            let mut finished = self.inner.finished.write();
            let before = finished.len();
            finished.retain(|_, r| {
                r.finished_at.map_or(true, |t| now.signed_duration_since(t) < ttl)
            });
            changed |= finished.len() != before;
        }

        let dead: Vec<String> = self
            .inner
            .running
            .read()
            .iter()
            .filter_map(|(id, live)| {
                let s = live.read();
                match (s.record.recovered, s.record.pid) {
                    (true, Some(pid)) if !pid_alive(pid) => Some(id.clone()),
                    (true, None) => Some(id.clone()),
                    _ => None,
                }
            })
            .collect();
        for id in dead {
            tracing::info!(session_id = %id, "recovered session's process died");
            self.mark_exited(&id, None, None);
            changed = true;
        }

        if changed {
            self.schedule_persist();
        }
    }

    // ── Persistence & recovery ────────────────────────────────────────

    /// Debounced snapshot write. Multiple mutations within the window
    /// coalesce into one write.
    pub fn schedule_persist(&self) {
        if self.inner.persist_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // No runtime (sync test / shutdown path): write immediately.
            self.inner.persist_pending.store(false, Ordering::SeqCst);
            if let Err(e) = self.inner.persist() {
                tracing::warn!(error = %e, "exec snapshot write failed");
            }
            return;
        };
        let inner = self.inner.clone();
        handle.spawn(async move {
            tokio::time::sleep(inner.config.persist_debounce).await;
            inner.persist_pending.store(false, Ordering::SeqCst);
            if let Err(e) = inner.persist() {
                tracing::warn!(error = %e, "exec snapshot write failed");
            }
        });
    }

    /// Write the full snapshot atomically, mode 0600.
    pub fn persist_now(&self) -> Result<()> {
        self.inner.persist()
    }

    /// Recovery pass on daemon start. Re-adopts running sessions whose pid
    /// is alive (no child handle, process identity only) and demotes dead
    /// ones to finished/failed. Finished entries past the TTL are dropped.
    pub fn recover(&self) {
        let snapshot = match std::fs::read_to_string(&self.inner.state_path) {
            Ok(raw) => match serde_json::from_str::<Snapshot>(&raw) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "corrupt exec snapshot, starting empty");
                    return;
                }
            },
            Err(_) => return,
        };

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.inner.config.finished_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));

        {
            let mut finished = self.inner.finished.write();
            for record in snapshot.finished {
                let fresh = record
                    .finished_at
                    .map_or(true, |t| now.signed_duration_since(t) < ttl);
                if fresh {
                    finished.insert(record.id.clone(), record);
                }
            }
        }

        for mut record in snapshot.running {
            let alive = record.pid.map_or(false, pid_alive);
            if alive {
                tracing::info!(
                    session_id = %record.id,
                    pid = record.pid,
                    "re-adopting exec session"
                );
                record.recovered = true;
                self.add_session(record, ExecHandles::default());
            } else {
                tracing::info!(session_id = %record.id, "exec session's process is gone");
                record.status = ExecStatus::Failed;
                record.finished_at = Some(now);
                self.inner.finished.write().insert(record.id.clone(), record);
            }
        }
        self.schedule_persist();
    }
}

impl ExecInner {
    fn list_running(&self) -> Vec<ExecRecord> {
        let mut records: Vec<ExecRecord> = self
            .running
            .read()
            .values()
            .map(|live| live.read().record.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    fn list_finished(&self) -> Vec<ExecRecord> {
        let mut records: Vec<ExecRecord> = self.finished.read().values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    fn persist(&self) -> Result<()> {
        let snapshot = Snapshot {
            running: self.list_running(),
            finished: self.list_finished(),
        };
        let json = serde_json::to_string_pretty(&snapshot)?;

        if let Some(parent) = self.state_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.state_path.with_extension("json.tmp");
        write_private(&tmp, json.as_bytes())?;
        std::fs::rename(&tmp, &self.state_path)?;
        Ok(())
    }
}

/// Write a file readable only by the owner (0600).
fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut f = opts.open(path)?;
    f.write_all(bytes)?;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Signals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Probe whether a pid is alive via `kill(pid, 0)`. EPERM means the
/// process exists but belongs to someone else — counted as alive.
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs only the existence/permission check.
    let rc = unsafe { libc::kill(pid as i32, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn send_signal(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: targets a single pid recorded from a process we spawned or
    // re-adopted; worst case is ESRCH on an already-dead pid.
    unsafe {
        libc::kill(pid as i32, sig);
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: Signal) {}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &Path) -> Arc<ExecRegistry> {
        ExecRegistry::new(&dir.join("exec-sessions.json"), ExecConfig::default())
    }

    fn record(registry: &ExecRegistry, command: &str) -> ExecRecord {
        ExecRecord::new(
            registry.create_session_id(),
            command.into(),
            None,
            false,
            registry.config().max_output_bytes,
        )
    }

    #[test]
    fn session_ids_sort_by_creation() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let a = reg.create_session_id();
        let b = reg.create_session_id();
        assert!(a < b);
    }

    #[tokio::test]
    async fn add_append_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let rec = record(&reg, "echo hi");
        let id = rec.id.clone();
        reg.add_session(rec, ExecHandles::default());

        reg.append_output(&id, "hello\n");
        let got = reg.get(&id).unwrap();
        assert_eq!(got.aggregated.combined, "hello\n");
        assert_eq!(got.status, ExecStatus::Running);
        assert_eq!(reg.list_running().len(), 1);
        assert!(reg.list_finished().is_empty());
    }

    #[tokio::test]
    async fn exit_moves_to_finished() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let rec = record(&reg, "true");
        let id = rec.id.clone();
        reg.add_session(rec, ExecHandles::default());

        reg.mark_exited(&id, Some(0), None);
        assert!(reg.list_running().is_empty());
        let finished = reg.get(&id).unwrap();
        assert_eq!(finished.status, ExecStatus::Exited);
        assert_eq!(finished.exit_code, Some(0));
        assert!(finished.finished_at.is_some());
    }

    #[tokio::test]
    async fn wait_for_exit_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let rec = record(&reg, "sleep 0.1");
        let id = rec.id.clone();
        reg.add_session(rec, ExecHandles::default());

        let waiter = {
            let reg = reg.clone();
            let id = id.clone();
            tokio::spawn(async move { reg.wait_for_exit(&id, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        reg.mark_exited(&id, Some(0), None);

        let record = waiter.await.unwrap().unwrap();
        assert_eq!(record.status, ExecStatus::Exited);
    }

    #[tokio::test]
    async fn wait_for_exit_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let rec = record(&reg, "sleep 999");
        let id = rec.id.clone();
        reg.add_session(rec, ExecHandles::default());

        let err = reg
            .wait_for_exit(&id, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "Timeout");
    }

    #[tokio::test]
    async fn snapshot_roundtrip_and_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exec-sessions.json");
        let reg = ExecRegistry::new(&path, ExecConfig::default());

        // A session whose pid is this test process — alive.
        let mut alive = record(&reg, "sleep 120");
        alive.pid = Some(std::process::id());
        let alive_id = alive.id.clone();
        reg.add_session(alive, ExecHandles::default());

        // A session with a pid that cannot exist.
        let mut dead = record(&reg, "sleep 120");
        dead.pid = Some(u32::MAX - 1);
        let dead_id = dead.id.clone();
        reg.add_session(dead, ExecHandles::default());

        reg.persist_now().unwrap();

        // Fresh registry, as after a daemon restart.
        let reg2 = ExecRegistry::new(&path, ExecConfig::default());
        reg2.recover();

        let running = reg2.list_running();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, alive_id);
        assert!(running[0].recovered);
        assert_eq!(running[0].pid, Some(std::process::id()));

        let finished = reg2.list_finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].id, dead_id);
        assert_eq!(finished[0].status, ExecStatus::Failed);
    }

    #[tokio::test]
    async fn recovery_is_idempotent_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exec-sessions.json");
        let reg = ExecRegistry::new(&path, ExecConfig::default());
        let mut rec = record(&reg, "sleep 120");
        rec.pid = Some(std::process::id());
        reg.add_session(rec, ExecHandles::default());
        reg.persist_now().unwrap();

        let reg2 = ExecRegistry::new(&path, ExecConfig::default());
        reg2.recover();
        assert_eq!(reg2.list_running().len(), 1); // no duplicates
    }

    #[tokio::test]
    async fn sweep_demotes_dead_recovered_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let mut rec = record(&reg, "sleep 120");
        rec.pid = Some(u32::MAX - 1);
        rec.recovered = true;
        let id = rec.id.clone();
        reg.add_session(rec, ExecHandles::default());

        reg.sweep();
        assert!(reg.list_running().is_empty());
        let finished = reg.get(&id).unwrap();
        assert!(finished.status.is_finished());
    }

    #[tokio::test]
    async fn sweep_drops_expired_finished() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ExecConfig::default();
        config.finished_ttl = Duration::from_secs(1);
        let reg = ExecRegistry::new(&dir.path().join("s.json"), config);

        let rec = record(&reg, "true");
        let id = rec.id.clone();
        reg.add_session(rec, ExecHandles::default());
        reg.mark_exited(&id, Some(0), None);

        // Backdate the finish time beyond the TTL.
        reg.inner.finished.write().get_mut(&id).unwrap().finished_at =
            Some(Utc::now() - chrono::Duration::seconds(30));

        reg.sweep();
        assert!(reg.get(&id).is_none());
    }

    #[tokio::test]
    async fn clear_finished_keeps_running() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());

        let done = record(&reg, "true");
        let done_id = done.id.clone();
        reg.add_session(done, ExecHandles::default());
        reg.mark_exited(&done_id, Some(0), None);

        let live = record(&reg, "sleep 120");
        reg.add_session(live, ExecHandles::default());

        assert_eq!(reg.clear_finished(), 1);
        assert!(reg.list_finished().is_empty());
        assert_eq!(reg.list_running().len(), 1);
    }

    #[tokio::test]
    async fn remove_session_drops_finished_record() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let rec = record(&reg, "true");
        let id = rec.id.clone();
        reg.add_session(rec, ExecHandles::default());
        reg.mark_exited(&id, Some(0), None);

        reg.remove_session(&id).await.unwrap();
        assert!(reg.get(&id).is_none());
        // A second remove of the same id reports not found.
        assert_eq!(reg.remove_session(&id).await.unwrap_err().code(), "NotFound");
    }

    #[tokio::test]
    async fn corrupt_snapshot_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exec-sessions.json");
        std::fs::write(&path, "{broken").unwrap();
        let reg = ExecRegistry::new(&path, ExecConfig::default());
        reg.recover();
        assert!(reg.list_running().is_empty());
        assert!(reg.list_finished().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn snapshot_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exec-sessions.json");
        let reg = ExecRegistry::new(&path, ExecConfig::default());
        reg.persist_now().unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn resize_pty_rejects_non_pty() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let rec = record(&reg, "sh");
        let id = rec.id.clone();
        reg.add_session(rec, ExecHandles::default());
        let err = reg.resize_pty(&id, 80, 24).unwrap_err();
        assert_eq!(err.code(), "Validation");
    }

    #[test]
    fn pid_alive_for_self() {
        assert!(pid_alive(std::process::id()));
    }
}
