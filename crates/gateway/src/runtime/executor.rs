//! The agent loop.
//!
//! Drives an LLM through tool calls until it produces a final message,
//! the iteration budget runs out, or the run is cancelled. Emits the
//! run's event stream, honors pause/cancel checkpoints before each LLM
//! call and each tool dispatch, and persists the chat transcript when
//! the run belongs to a session.

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use ud_domain::error::{Error, Result};
use ud_domain::llm::{ChatRequest, LlmClient};
use ud_domain::stream::{StreamEvent, Usage};
use ud_domain::tool::{Message, ToolCall};
use ud_sessions::TranscriptStore;

use super::control::{ControlMap, RunControl};
use super::events::RunEventKind;
use super::prompt::{PromptAssembler, PromptSection};
use super::registry::ToolRegistry;
use super::runs::{RunManager, RunStatus};
use super::usage::UsageLog;

/// Lines of prior session transcript fed back into the prompt.
const SESSION_WINDOW_LINES: usize = 200;

/// Everything the loop needs, shared across runs.
pub struct ExecutorDeps {
    pub runs: Arc<RunManager>,
    pub registry: Arc<ToolRegistry>,
    pub llm: Arc<dyn LlmClient>,
    pub transcripts: Arc<TranscriptStore>,
    pub controls: Arc<ControlMap>,
    pub prompt: Arc<PromptAssembler>,
    pub usage: Arc<UsageLog>,
    pub max_iterations: u32,
}

/// Spawn the loop for an already-created run.
pub fn spawn_run(deps: Arc<ExecutorDeps>, run_id: Uuid) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        execute_run(&deps, run_id).await;
    })
}

/// Run the loop to completion. All failure paths are absorbed into the
/// run's own state; this never returns an error to the caller.
pub async fn execute_run(deps: &ExecutorDeps, run_id: Uuid) {
    let control = deps.controls.register(run_id);
    let result = run_inner(deps, run_id, &control).await;
    deps.controls.remove(&run_id);

    if let Err(e) = result {
        let _ = deps.runs.emit(
            &run_id,
            RunEventKind::RunFailed {
                error: e.to_string(),
            },
        );
        if let Some(record) = deps.runs.get(&run_id) {
            if !record.status.is_terminal() {
                let _ = deps
                    .runs
                    .update_status(&run_id, RunStatus::Failed, Some(e.to_string()));
            }
        }
        tracing::warn!(run_id = %run_id, error = %e, "run failed");
    }
}

/// Outcome of one streamed LLM response.
struct StreamedResponse {
    content: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<Usage>,
    cancelled: bool,
}

async fn run_inner(deps: &ExecutorDeps, run_id: Uuid, control: &RunControl) -> Result<()> {
    let record = deps
        .runs
        .get(&run_id)
        .ok_or_else(|| Error::NotFound(format!("run '{run_id}' not found")))?;

    deps.runs
        .update_status(&run_id, RunStatus::Planning, None)?;

    // ── Build the message history ─────────────────────────────────────
    let system = deps.prompt.assemble(&[PromptSection {
        title: "Task".into(),
        body: format!("Requested by {}.", record.user_id),
    }]);
    let mut messages = vec![Message::system(&system)];

    if let Some(session_id) = &record.session_id {
        for line in deps
            .transcripts
            .read_window(session_id, SESSION_WINDOW_LINES)?
        {
            match line.role.as_str() {
                "user" => messages.push(Message::user(&line.content)),
                "assistant" => messages.push(Message::assistant(&line.content)),
                _ => {}
            }
        }
        deps.transcripts
            .append(session_id, &[TranscriptStore::line("user", &record.instruction)])?;
    }
    messages.push(Message::user(&record.instruction));

    let tool_defs = deps.registry.definitions();

    // Emit hook handed to the registry so approval requests surface as
    // run events (and flip the status while the gate is armed).
    let emit_runs = deps.runs.clone();
    let emit = move |kind: RunEventKind| {
        if matches!(kind, RunEventKind::ToolApprovalRequested { .. }) {
            let _ = emit_runs.update_status(&run_id, RunStatus::ApprovalRequired, None);
        }
        let _ = emit_runs.emit(&run_id, kind);
    };

    let mut total_usage = Usage::default();
    let mut last_content = String::new();

    for iteration in 1..=deps.max_iterations {
        deps.runs.emit(
            &run_id,
            RunEventKind::ActionProgress {
                iteration,
                max_iterations: deps.max_iterations,
            },
        )?;

        // ── Checkpoint before the LLM call ────────────────────────
        control.wait_if_paused().await;
        if control.is_cancelled() {
            deps.runs.cancel_if_active(&run_id, None)?;
            return Ok(());
        }

        let req = ChatRequest {
            messages: messages.clone(),
            tools: tool_defs.clone(),
            max_tokens: None,
            model: None,
        };
        let response = consume_stream(deps, run_id, control, &req).await?;

        if response.cancelled {
            deps.runs.cancel_if_active(&run_id, None)?;
            return Ok(());
        }
        if let Some(u) = &response.usage {
            total_usage.add(u);
        }
        if !response.content.is_empty() {
            last_content = response.content.clone();
        }

        // ── Final answer ──────────────────────────────────────────
        if response.tool_calls.is_empty() {
            finish_completed(deps, &record, run_id, &response.content, &total_usage)?;
            return Ok(());
        }

        // First tool call moves the run from planning into applying.
        if deps.runs.get(&run_id).map(|r| r.status) == Some(RunStatus::Planning) {
            deps.runs
                .update_status(&run_id, RunStatus::Applying, None)?;
        }

        messages.push(Message::assistant_with_calls(
            &response.content,
            &response.tool_calls,
        ));
        if let Some(session_id) = &record.session_id {
            if !response.content.is_empty() {
                deps.transcripts.append(
                    session_id,
                    &[TranscriptStore::line("assistant", &response.content)],
                )?;
            }
        }

        // ── Dispatch the calls in order ───────────────────────────
        for call in &response.tool_calls {
            deps.runs.emit(
                &run_id,
                RunEventKind::ToolCall {
                    name: call.tool_name.clone(),
                    args: call.arguments.clone(),
                    iteration,
                },
            )?;

            control.wait_if_paused().await;
            if control.is_cancelled() {
                deps.runs.cancel_if_active(&run_id, None)?;
                return Ok(());
            }

            let outcome = deps.registry.dispatch(Some(run_id), call, &emit).await;

            // Leaving the approval gate returns the run to applying.
            if deps.runs.get(&run_id).map(|r| r.status) == Some(RunStatus::ApprovalRequired) {
                deps.runs
                    .update_status(&run_id, RunStatus::Applying, None)?;
            }

            deps.runs.emit(
                &run_id,
                RunEventKind::ToolResult {
                    name: call.tool_name.clone(),
                    result: outcome.result.clone(),
                    error: outcome.error,
                },
            )?;

            // The result message carries the LLM's call id so it can
            // correlate. Errors go back as content, never as exceptions.
            let result_text = outcome.result.to_string();
            messages.push(Message::tool_result(&call.call_id, &result_text, outcome.error));

            if let Some(session_id) = &record.session_id {
                let mut line = TranscriptStore::line("tool", &result_text);
                line.metadata = Some(serde_json::json!({
                    "call_id": call.call_id,
                    "tool_name": call.tool_name,
                    "is_error": outcome.error,
                }));
                deps.transcripts.append(session_id, &[line])?;
            }
        }
    }

    // ── Iteration budget exhausted ────────────────────────────────────
    deps.runs.emit(
        &run_id,
        RunEventKind::RunWarning {
            message: format!(
                "iteration budget exhausted after {} iterations",
                deps.max_iterations
            ),
        },
    )?;
    finish_completed(deps, &record, run_id, &last_content, &total_usage)?;
    Ok(())
}

fn finish_completed(
    deps: &ExecutorDeps,
    record: &super::runs::RunRecord,
    run_id: Uuid,
    content: &str,
    total_usage: &Usage,
) -> Result<()> {
    deps.runs.emit(
        &run_id,
        RunEventKind::RunCompleted {
            content: content.to_owned(),
        },
    )?;
    if let Some(session_id) = &record.session_id {
        if !content.is_empty() {
            deps.transcripts
                .append(session_id, &[TranscriptStore::line("assistant", content)])?;
        }
    }
    // A cancel can land between the last stream event and here; the run
    // is already terminal then and keeps its cancelled status.
    if let Err(e) = deps.runs.update_status(&run_id, RunStatus::Completed, None) {
        tracing::debug!(run_id = %run_id, error = %e, "completion transition skipped");
    }
    deps.usage.record(run_id, total_usage);
    Ok(())
}

/// Consume one streaming LLM response: forward tokens and thinking as
/// events, assemble tool calls, and watch for cancellation.
async fn consume_stream(
    deps: &ExecutorDeps,
    run_id: Uuid,
    control: &RunControl,
    req: &ChatRequest,
) -> Result<StreamedResponse> {
    let mut stream = deps.llm.chat_stream(req).await?;

    let mut content = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut usage = None;
    let mut cancelled = false;
    // call_id -> (name, partial args json) for providers that only
    // stream start + deltas.
    let mut partial: std::collections::HashMap<String, (String, String)> =
        std::collections::HashMap::new();

    while let Some(item) = stream.next().await {
        if control.is_cancelled() {
            cancelled = true;
            break;
        }
        match item? {
            StreamEvent::Token { text } => {
                deps.runs
                    .emit(&run_id, RunEventKind::LlmToken { text: text.clone() })?;
                content.push_str(&text);
            }
            StreamEvent::Thinking { text } => {
                deps.runs
                    .emit(&run_id, RunEventKind::LlmThinking { text })?;
            }
            StreamEvent::ToolCallStarted { call_id, tool_name } => {
                partial.insert(call_id, (tool_name, String::new()));
            }
            StreamEvent::ToolCallDelta { call_id, delta } => {
                if let Some((_, args)) = partial.get_mut(&call_id) {
                    args.push_str(&delta);
                }
            }
            StreamEvent::ToolCallFinished {
                call_id,
                tool_name,
                arguments,
            } => {
                partial.remove(&call_id);
                tool_calls.push(ToolCall {
                    call_id,
                    tool_name,
                    arguments,
                });
            }
            StreamEvent::Done { usage: u } => {
                usage = u;
            }
        }
    }

    // Calls announced via start/delta but never finished.
    for (call_id, (tool_name, args_json)) in partial.drain() {
        let arguments = if args_json.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&args_json).unwrap_or_else(|e| {
                tracing::warn!(call_id = %call_id, error = %e, "malformed streamed tool args");
                Value::Object(Default::default())
            })
        };
        tool_calls.push(ToolCall {
            call_id,
            tool_name,
            arguments,
        });
    }

    Ok(StreamedResponse {
        content,
        tool_calls,
        usage,
        cancelled,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
