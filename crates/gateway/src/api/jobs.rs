//! Scheduler job endpoints.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::runtime::scheduler::{JobPayload, NewJob, Schedule};
use crate::state::AppState;

use super::error_response;

pub async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "jobs": state.scheduler.store().list().await }))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.scheduler.store().get(&id).await {
        Some(job) => Json(serde_json::json!(job)).into_response(),
        None => error_response(&ud_domain::Error::NotFound(format!("job '{id}' not found"))),
    }
}

pub async fn create_job(
    State(state): State<AppState>,
    Json(body): Json<NewJob>,
) -> impl IntoResponse {
    match state.scheduler.store().insert(body).await {
        Ok(job) => {
            // A new earlier deadline may shorten the current tick sleep.
            state.scheduler.poke();
            Json(serde_json::json!(job)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateJobBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub payload: Option<JobPayload>,
    #[serde(default)]
    pub delete_after_run: Option<bool>,
}

pub async fn update_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateJobBody>,
) -> impl IntoResponse {
    let result = state
        .scheduler
        .store()
        .update(&id, |job| {
            if let Some(name) = body.name {
                job.name = name;
            }
            if let Some(description) = body.description {
                job.description = Some(description);
            }
            if let Some(enabled) = body.enabled {
                job.enabled = enabled;
            }
            if let Some(schedule) = body.schedule {
                job.schedule = schedule;
                // A new schedule recomputes from scratch.
                job.state.next_run_at_ms = None;
            }
            if let Some(payload) = body.payload {
                job.payload = payload;
            }
            if let Some(delete_after_run) = body.delete_after_run {
                job.delete_after_run = delete_after_run;
            }
        })
        .await;
    match result {
        Ok(job) => {
            state.scheduler.poke();
            Json(serde_json::json!(job)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

pub async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.scheduler.store().delete(&id).await {
        Ok(()) => Json(serde_json::json!({ "deleted": id })).into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn run_job_now(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.scheduler.trigger_now(&id).await {
        Ok(()) => Json(serde_json::json!({ "triggered": id })).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Per-job state plus the recent fire history.
pub async fn jobs_status(State(state): State<AppState>) -> impl IntoResponse {
    let jobs = state.scheduler.store().list().await;
    let states: Vec<serde_json::Value> = jobs
        .iter()
        .map(|j| {
            serde_json::json!({
                "id": j.id,
                "name": j.name,
                "enabled": j.enabled,
                "state": j.state,
            })
        })
        .collect();
    Json(serde_json::json!({
        "jobs": states,
        "recent": state.scheduler.recent_events(),
    }))
}
