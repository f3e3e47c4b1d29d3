//! Run endpoints.
//!
//! - `POST /runs`              — create a run and start its executor
//! - `GET /runs`               — list runs (newest first)
//! - `GET /runs/:id`           — one run
//! - `DELETE /runs/:id`        — delete a run and its log
//! - `POST /runs/:id/actions`  — apply | cancel | pause | resume | undo
//! - `GET /runs/:id/events`    — SSE: persisted replay, then live

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_core::Stream;
use serde::Deserialize;
use uuid::Uuid;

use crate::runtime::actions::ActionFilter;
use crate::runtime::runs::{NewRun, RunStatus};
use crate::runtime::{spawn_run, RunEvent};
use crate::state::AppState;

use super::error_response;

#[derive(Debug, Deserialize)]
pub struct CreateRunBody {
    pub instruction: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

pub async fn create_run(
    State(state): State<AppState>,
    Json(body): Json<CreateRunBody>,
) -> impl IntoResponse {
    if body.instruction.trim().is_empty() {
        return error_response(&ud_domain::Error::Validation(
            "instruction must not be empty".into(),
        ));
    }
    let record = match state.deps.runs.create(NewRun {
        instruction: body.instruction,
        agent_id: body.agent_id,
        user_id: "api".into(),
        job_id: None,
        session_id: body.session_id,
    }) {
        Ok(record) => record,
        Err(e) => return error_response(&e),
    };
    spawn_run(state.deps.clone(), record.id);
    Json(serde_json::json!(record)).into_response()
}

pub async fn list_runs(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "runs": state.deps.runs.list() }))
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.deps.runs.get(&id) {
        Some(record) => Json(serde_json::json!(record)).into_response(),
        None => error_response(&ud_domain::Error::NotFound(format!("run '{id}' not found"))),
    }
}

pub async fn delete_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.deps.runs.delete(&id) {
        Ok(()) => Json(serde_json::json!({ "deleted": id })).into_response(),
        Err(e) => error_response(&e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /runs/:id/actions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunAction {
    Apply,
    Cancel,
    Pause,
    Resume,
    Undo,
}

#[derive(Debug, Deserialize)]
pub struct RunActionBody {
    pub action: RunAction,
}

pub async fn run_action(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<RunActionBody>,
) -> impl IntoResponse {
    let runs = &state.deps.runs;
    let result = match body.action {
        RunAction::Apply => runs.apply(&id),

        RunAction::Cancel => {
            // Signal the executor first so a parked loop wakes, then
            // transition the record (a paused run cancels directly).
            state.deps.controls.cancel(&id);
            match runs.cancel_if_active(&id, Some("cancelled by user".into())) {
                Ok(Some(record)) => Ok(record),
                Ok(None) => runs
                    .get(&id)
                    .ok_or_else(|| ud_domain::Error::NotFound(format!("run '{id}' not found"))),
                Err(e) => Err(e),
            }
        }

        RunAction::Pause => {
            if !state.deps.controls.pause(&id) {
                Err(ud_domain::Error::Validation(
                    "run has no active executor to pause".into(),
                ))
            } else {
                runs.update_status(&id, RunStatus::Paused, None)
            }
        }

        RunAction::Resume => {
            let target = runs
                .get(&id)
                .and_then(|r| r.paused_from)
                .ok_or_else(|| ud_domain::Error::Validation("run is not paused".into()));
            match target {
                Ok(target) => {
                    let updated = runs.update_status(&id, target, None);
                    state.deps.controls.resume(&id);
                    updated
                }
                Err(e) => Err(e),
            }
        }

        RunAction::Undo => undo_run_actions(&state, &id).await,
    };

    match result {
        Ok(record) => Json(serde_json::json!(record)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Undo every still-undoable action this run recorded, newest first.
async fn undo_run_actions(
    state: &AppState,
    id: &Uuid,
) -> ud_domain::Result<crate::runtime::RunRecord> {
    let record = state
        .deps
        .runs
        .get(id)
        .ok_or_else(|| ud_domain::Error::NotFound(format!("run '{id}' not found")))?;

    let undo = state.deps.registry.undo();
    let run_actions = state.deps.registry.actions().list(&ActionFilter {
        run_id: Some(*id),
        ..Default::default()
    });
    let mut undone = 0usize;
    for action in &run_actions {
        // list() is newest-first, which is the order undo wants.
        if undo.undo_action(&action.id).await? {
            undone += 1;
        }
    }
    tracing::info!(run_id = %id, undone, "run actions undone");
    Ok(record)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /runs/:id/events (SSE)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn run_events_sse(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> axum::response::Response {
    if state.deps.runs.get(&id).is_none() {
        return error_response(&ud_domain::Error::NotFound(format!("run '{id}' not found")));
    }

    // Subscribe before snapshotting the replay so nothing is lost in
    // between; live events already replayed are skipped by sequence.
    let live = state.deps.runs.bus().subscribe(Some(id));
    let replay = state.deps.runs.replay_events(&id);
    let last_replayed = replay.last().map(|e| e.seq);

    let stream = sse_stream(replay, last_replayed, live);
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn sse_stream(
    replay: Vec<RunEvent>,
    last_replayed: Option<u64>,
    mut live: tokio::sync::broadcast::Receiver<RunEvent>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        for event in replay {
            yield Ok(sse_event(&event));
        }
        loop {
            match live.recv().await {
                Ok(event) => {
                    if last_replayed.map_or(false, |last| event.seq <= last) {
                        continue;
                    }
                    let terminal = matches!(
                        event.kind,
                        crate::runtime::RunEventKind::StatusChanged { status, .. }
                            if status.is_terminal()
                    );
                    yield Ok(sse_event(&event));
                    if terminal {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    let warning = Event::default()
                        .event("warning")
                        .data(format!("{{\"missed\":{n}}}"));
                    yield Ok(warning);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

fn sse_event(event: &RunEvent) -> Event {
    Event::default()
        .event(event.kind.type_name())
        .data(serde_json::to_string(event).unwrap_or_default())
}
