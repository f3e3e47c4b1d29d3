//! AppState construction and background-task spawning.
//!
//! Everything is built in dependency order; the two construction cycles
//! (channel manager ↔ tool registry, scheduler ↔ executor) are resolved
//! with post-wired setter injection. Recovery passes run here, before
//! anything new can fire: orphaned runs are failed, exec sessions are
//! re-adopted or demoted, and stale scheduler claims are cleared.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use ud_channels::ChannelManager;
use ud_domain::config::LaunchConfig;
use ud_domain::error::{Error, Result};
use ud_domain::llm::{ChatRequest, LlmClient};
use ud_domain::stream::{BoxStream, StreamEvent};
use ud_sessions::{job_session_key, TranscriptStore};
use ud_tools::{ExecConfig, ExecRegistry};

use crate::api::auth::token_hash;
use crate::runtime::actions::ActionLog;
use crate::runtime::approval::ApprovalGate;
use crate::runtime::bridge::channel_bridge;
use crate::runtime::bus::EventBus;
use crate::runtime::control::ControlMap;
use crate::runtime::memory::MemoryStore;
use crate::runtime::prompt::PromptAssembler;
use crate::runtime::registry::{JobCreator, ScheduleJobArgs, ToolRegistry};
use crate::runtime::runs::{NewRun, RunManager, RunStatus, RunStore, SCHEDULER_USER};
use crate::runtime::scheduler::{
    Job, JobOutcome, JobPayload, NewJob, Scheduler, JobStore,
};
use crate::runtime::usage::UsageLog;
use crate::runtime::{execute_run, ExecutorDeps};
use crate::state::{AppState, ShutdownHandlers};

const APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);
const EXEC_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const SHUTDOWN_RUN_GRACE: Duration = Duration::from_secs(10);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Default LLM client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Placeholder backend used when no provider has been wired in. Runs
/// fail cleanly with a configuration hint instead of hanging.
pub struct UnconfiguredLlm;

#[async_trait::async_trait]
impl LlmClient for UnconfiguredLlm {
    async fn chat_stream(
        &self,
        _req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        Err(Error::Llm(
            "no LLM provider configured; wire an LlmClient into the daemon".into(),
        ))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Construction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the fully wired state and run every recovery pass.
pub async fn build_app_state(
    config: Arc<LaunchConfig>,
    llm: Arc<dyn LlmClient>,
) -> Result<AppState> {
    std::fs::create_dir_all(&config.data_dir)?;

    // ── Runs + events ─────────────────────────────────────────────────
    let bus = Arc::new(EventBus::new());
    let run_store = Arc::new(RunStore::new(&config.runs_dir())?);
    let runs = RunManager::new(run_store, bus);
    let orphaned = runs.mark_orphans();
    if orphaned > 0 {
        tracing::info!(orphaned, "marked orphaned runs as failed");
    }

    // ── Exec sessions ─────────────────────────────────────────────────
    let exec = ExecRegistry::new(&config.exec_state_path(), ExecConfig::default());
    exec.recover();
    tracing::info!(
        running = exec.list_running().len(),
        finished = exec.list_finished().len(),
        "exec registry recovered"
    );

    // ── Tool interception stack ───────────────────────────────────────
    let memory = Arc::new(MemoryStore::new(&config.data_dir)?);
    let actions = Arc::new(ActionLog::new(&config.data_dir)?);
    let approvals = Arc::new(ApprovalGate::new(config.approval_mode, APPROVAL_TIMEOUT));
    let undo = Arc::new(crate::runtime::undo::UndoService::new(
        actions.clone(),
        memory.clone(),
    ));
    let workspace_root = config.data_dir.join("workspace");
    std::fs::create_dir_all(&workspace_root)?;
    let registry = Arc::new(ToolRegistry::new(
        workspace_root,
        exec.clone(),
        memory,
        actions,
        approvals,
        undo,
    ));

    // ── Executor dependencies ─────────────────────────────────────────
    let deps = Arc::new(ExecutorDeps {
        runs,
        registry: registry.clone(),
        llm,
        transcripts: Arc::new(TranscriptStore::new(&config.data_dir.join("sessions"))?),
        controls: Arc::new(ControlMap::new()),
        prompt: Arc::new(PromptAssembler::default()),
        usage: Arc::new(UsageLog::new(&config.data_dir)?),
        max_iterations: config.max_iterations,
    });

    // ── Scheduler (post-wired against the executor) ───────────────────
    let job_store = Arc::new(JobStore::new(&config.data_dir)?);
    job_store.recover().await;
    let scheduler = Scheduler::new(job_store);
    scheduler.set_executor(job_executor(deps.clone()));
    registry.set_job_creator(Arc::new(SchedulerJobCreator {
        scheduler: scheduler.clone(),
    }));

    // ── Channels (post-wired against the executor) ────────────────────
    let channels = ChannelManager::new(&config.data_dir.join("channels"))?;
    channels.set_bridge(channel_bridge(deps.clone(), channels.clone()));
    registry.set_channels(channels.clone());

    let api_token_hash = config.token.as_deref().map(token_hash);
    if api_token_hash.is_none() {
        tracing::warn!("no token configured; API runs open (dev mode)");
    }

    Ok(AppState {
        config,
        deps,
        scheduler,
        channels,
        exec,
        api_token_hash,
        shutdown: Arc::new(ShutdownHandlers::new()),
    })
}

/// Spawn the long-lived background tasks and register shutdown handlers
/// (run in this order on shutdown: channels, scheduler, runs, exec).
pub async fn spawn_background_tasks(state: &AppState) {
    tokio::spawn(state.scheduler.clone().run_loop());

    let sweeper = state.exec.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(EXEC_SWEEP_INTERVAL);
        loop {
            tick.tick().await;
            sweeper.sweep();
        }
    });

    state.channels.start_all().await;

    let channels = state.channels.clone();
    state.shutdown.register("channels", move || async move {
        channels.stop_all().await;
    });

    let scheduler = state.scheduler.clone();
    state.shutdown.register("scheduler", move || async move {
        scheduler.stop();
    });

    let controls = state.deps.controls.clone();
    state.shutdown.register("runs", move || async move {
        // Let in-flight runs finish; force-cancel at the grace deadline.
        let deadline = tokio::time::Instant::now() + SHUTDOWN_RUN_GRACE;
        while controls.active_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if controls.active_count() > 0 {
            tracing::warn!(
                count = controls.active_count(),
                "grace deadline reached, cancelling in-flight runs"
            );
            controls.cancel_all();
        }
    });

    let exec = state.exec.clone();
    state.shutdown.register("exec-snapshot", move || async move {
        if let Err(e) = exec.persist_now() {
            tracing::warn!(error = %e, "final exec snapshot failed");
        }
    });
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler ↔ executor wiring
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The firing callback handed to the scheduler. Scheduler-originated
/// runs are ordinary runs with `user_id = "scheduler"` and a `job_id`.
fn job_executor(deps: Arc<ExecutorDeps>) -> crate::runtime::scheduler::JobExecutor {
    Arc::new(move |job: Job| {
        let deps = deps.clone();
        Box::pin(async move {
            match &job.payload {
                JobPayload::Run {
                    instruction,
                    agent_id,
                } => {
                    let run = deps.runs.create(NewRun {
                        instruction: instruction.clone(),
                        agent_id: agent_id.clone(),
                        user_id: SCHEDULER_USER.into(),
                        job_id: Some(job.id),
                        session_id: Some(job_session_key(&job.id.to_string())),
                    })?;
                    let run_id = run.id;
                    execute_run(&deps, run_id).await;

                    let record = deps
                        .runs
                        .get(&run_id)
                        .ok_or_else(|| Error::NotFound(format!("run '{run_id}' vanished")))?;
                    match record.status {
                        RunStatus::Completed | RunStatus::Applied => {
                            Ok(JobOutcome::Ok { run_id: Some(run_id) })
                        }
                        RunStatus::Cancelled => Ok(JobOutcome::Skipped),
                        _ => Err(Error::Other(
                            record
                                .status_reason
                                .unwrap_or_else(|| "scheduled run failed".into()),
                        )),
                    }
                }
                JobPayload::Event { text } => {
                    tracing::info!(job_id = %job.id, text = %text, "scheduled event");
                    Ok(JobOutcome::Ok { run_id: None })
                }
            }
        })
    })
}

/// `schedule_job` tool backend.
struct SchedulerJobCreator {
    scheduler: Arc<Scheduler>,
}

#[async_trait::async_trait]
impl JobCreator for SchedulerJobCreator {
    async fn create_job(&self, args: &ScheduleJobArgs) -> Result<serde_json::Value> {
        let schedule = serde_json::from_value(args.schedule.clone())
            .map_err(|e| Error::Validation(format!("invalid schedule: {e}")))?;
        let job = self
            .scheduler
            .store()
            .insert(NewJob {
                name: args.name.clone(),
                description: None,
                enabled: true,
                schedule,
                payload: JobPayload::Run {
                    instruction: args.instruction.clone(),
                    agent_id: None,
                },
                delete_after_run: args.delete_after_run,
            })
            .await?;
        self.scheduler.poke();
        Ok(json!(job))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
