//! Command spawning for exec sessions.
//!
//! Semantics:
//! - Foreground: run the command, wait up to `yield_ms`, return output.
//! - Background: spawn, return immediately with the session id + tail.
//! - A foreground command that outlives `yield_ms` is auto-backgrounded.
//!
//! The spawned child is tracked by the [`ExecRegistry`]; a monitor task
//! streams stdout/stderr into the session record and marks the exit.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use ud_domain::error::{Error, Result};

use crate::registry::{ExecHandles, ExecRecord, ExecRegistry, StdinMessage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct SpawnRequest {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub background: bool,
    /// How long a foreground call waits before auto-backgrounding (ms).
    #[serde(default)]
    pub yield_ms: Option<u64>,
}

pub const DEFAULT_YIELD_MS: u64 = 10_000;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SpawnOutcome {
    /// The command finished within the foreground window.
    Completed {
        session_id: String,
        exit_code: Option<i32>,
        output: String,
    },
    /// The command keeps running; poll it through the registry.
    Backgrounded { session_id: String, tail: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Spawn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Spawn a command into a tracked exec session.
pub async fn spawn(registry: &Arc<ExecRegistry>, req: SpawnRequest) -> Result<SpawnOutcome> {
    if req.command.trim().is_empty() {
        return Err(Error::Validation("command must not be empty".into()));
    }

    let session_id = registry.create_session_id();
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&req.command);
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.stdin(std::process::Stdio::piped());
    if let Some(ref cwd) = req.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Transient(format!("failed to spawn '{}': {e}", req.command)))?;

    let mut record = ExecRecord::new(
        session_id.clone(),
        req.command.clone(),
        req.cwd.clone(),
        false,
        registry.config().max_output_bytes,
    );
    record.pid = child.id();
    record.backgrounded = req.background;

    let (stdin_tx, stdin_rx) = mpsc::channel::<StdinMessage>(32);
    let live = registry.add_session(
        record,
        ExecHandles {
            stdin_tx: Some(stdin_tx),
        },
    );
    let exit_notify = live.read().exit_notify.clone();

    spawn_monitor(registry.clone(), session_id.clone(), child, stdin_rx);

    if req.background {
        return Ok(SpawnOutcome::Backgrounded {
            tail: registry.tail(&session_id).unwrap_or_default(),
            session_id,
        });
    }

    // Foreground: wait for exit or the yield deadline.
    let yield_dur = std::time::Duration::from_millis(req.yield_ms.unwrap_or(DEFAULT_YIELD_MS));
    tokio::select! {
        _ = exit_notify.notified() => {
            let record = registry
                .get(&session_id)
                .ok_or_else(|| Error::NotFound(format!("session '{session_id}' vanished")))?;
            Ok(SpawnOutcome::Completed {
                session_id,
                exit_code: record.exit_code,
                output: record.aggregated.combined,
            })
        }
        _ = tokio::time::sleep(yield_dur) => {
            // Still running past the window; hand back a session id.
            registry.mark_backgrounded(&session_id);
            Ok(SpawnOutcome::Backgrounded {
                tail: registry.tail(&session_id).unwrap_or_default(),
                session_id,
            })
        }
    }
}

/// Monitor the child: stream output into the registry, forward stdin,
/// record the exit.
fn spawn_monitor(
    registry: Arc<ExecRegistry>,
    session_id: String,
    mut child: tokio::process::Child,
    mut stdin_rx: mpsc::Receiver<StdinMessage>,
) {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdin = child.stdin.take();

    tokio::spawn(async move {
        let out_reg = registry.clone();
        let out_id = session_id.clone();
        let stdout_task = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    out_reg.append_output(&out_id, &line);
                    out_reg.append_output(&out_id, "\n");
                }
            }
        });

        let err_reg = registry.clone();
        let err_id = session_id.clone();
        let stderr_task = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    err_reg.append_output(&err_id, &line);
                    err_reg.append_output(&err_id, "\n");
                }
            }
        });

        let stdin_task = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                while let Some(msg) = stdin_rx.recv().await {
                    match msg {
                        StdinMessage::Data(data) => {
                            let _ = stdin.write_all(&data).await;
                            let _ = stdin.flush().await;
                        }
                        StdinMessage::Eof => {
                            drop(stdin);
                            return;
                        }
                    }
                }
            }
        });

        let result = child.wait().await;
        // Drain the readers before sealing the record.
        let _ = stdout_task.await;
        let _ = stderr_task.await;
        stdin_task.abort();

        match result {
            Ok(exit) => {
                let signal = exit_signal_name(&exit);
                registry.mark_exited(&session_id, exit.code(), signal.as_deref());
            }
            Err(e) => {
                registry.append_output(&session_id, &format!("\n[process error: {e}]"));
                registry.mark_exited(&session_id, None, None);
            }
        }

        tracing::debug!(session_id = %session_id, "exec monitor finished");
    });
}

#[cfg(unix)]
fn exit_signal_name(exit: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    exit.signal().map(|sig| match sig {
        libc::SIGTERM => "SIGTERM".to_owned(),
        libc::SIGKILL => "SIGKILL".to_owned(),
        libc::SIGINT => "SIGINT".to_owned(),
        other => format!("signal {other}"),
    })
}

#[cfg(not(unix))]
fn exit_signal_name(_exit: &std::process::ExitStatus) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ExecConfig, ExecStatus};
    use std::time::Duration;

    fn registry(dir: &std::path::Path) -> Arc<ExecRegistry> {
        ExecRegistry::new(&dir.join("exec-sessions.json"), ExecConfig::default())
    }

    #[tokio::test]
    async fn foreground_command_completes() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let outcome = spawn(
            &reg,
            SpawnRequest {
                command: "echo hello".into(),
                cwd: None,
                background: false,
                yield_ms: Some(5000),
            },
        )
        .await
        .unwrap();

        match outcome {
            SpawnOutcome::Completed { exit_code, output, .. } => {
                assert_eq!(exit_code, Some(0));
                assert_eq!(output, "hello\n");
            }
            SpawnOutcome::Backgrounded { .. } => panic!("expected completion"),
        }
        assert_eq!(reg.list_finished().len(), 1);
    }

    #[tokio::test]
    async fn stderr_merged_into_output() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let outcome = spawn(
            &reg,
            SpawnRequest {
                command: "echo out; echo err >&2".into(),
                cwd: None,
                background: false,
                yield_ms: Some(5000),
            },
        )
        .await
        .unwrap();

        match outcome {
            SpawnOutcome::Completed { output, .. } => {
                assert!(output.contains("out"));
                assert!(output.contains("err"));
            }
            _ => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn slow_command_auto_backgrounds() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let outcome = spawn(
            &reg,
            SpawnRequest {
                command: "sleep 5".into(),
                cwd: None,
                background: false,
                yield_ms: Some(100),
            },
        )
        .await
        .unwrap();

        let id = match outcome {
            SpawnOutcome::Backgrounded { session_id, .. } => session_id,
            _ => panic!("expected backgrounding"),
        };
        let record = reg.get(&id).unwrap();
        assert_eq!(record.status, ExecStatus::Running);
        assert!(record.backgrounded);
        assert!(record.pid.is_some());

        reg.kill_session(&id).await.unwrap();
        let finished = reg.wait_for_exit(&id, Duration::from_secs(10)).await.unwrap();
        assert!(finished.status.is_finished());
    }

    #[tokio::test]
    async fn background_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let outcome = spawn(
            &reg,
            SpawnRequest {
                command: "sleep 3".into(),
                cwd: None,
                background: true,
                yield_ms: None,
            },
        )
        .await
        .unwrap();

        let id = match outcome {
            SpawnOutcome::Backgrounded { session_id, .. } => session_id,
            _ => panic!("expected backgrounding"),
        };
        assert_eq!(reg.list_running().len(), 1);
        reg.kill_session(&id).await.unwrap();
    }

    #[tokio::test]
    async fn stdin_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let outcome = spawn(
            &reg,
            SpawnRequest {
                command: "cat".into(),
                cwd: None,
                background: true,
                yield_ms: None,
            },
        )
        .await
        .unwrap();
        let id = match outcome {
            SpawnOutcome::Backgrounded { session_id, .. } => session_id,
            _ => panic!("expected backgrounding"),
        };

        reg.write_stdin(&id, b"ping\n".to_vec(), true).await.unwrap();
        let record = reg.wait_for_exit(&id, Duration::from_secs(10)).await.unwrap();
        assert_eq!(record.aggregated.combined, "ping\n");
        assert_eq!(record.exit_code, Some(0));
    }

    #[tokio::test]
    async fn empty_command_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let err = spawn(
            &reg,
            SpawnRequest {
                command: "  ".into(),
                cwd: None,
                background: false,
                yield_ms: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "Validation");
    }

    #[tokio::test]
    async fn nonzero_exit_code_reported() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let outcome = spawn(
            &reg,
            SpawnRequest {
                command: "exit 3".into(),
                cwd: None,
                background: false,
                yield_ms: Some(5000),
            },
        )
        .await
        .unwrap();
        match outcome {
            SpawnOutcome::Completed { exit_code, .. } => assert_eq!(exit_code, Some(3)),
            _ => panic!("expected completion"),
        }
    }
}
