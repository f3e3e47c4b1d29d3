//! HTTP surface: route wiring, auth, and the error → status mapping.

pub mod auth;
pub mod channels;
pub mod gateway;
pub mod jobs;
pub mod runs;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::Router;

use ud_domain::error::Error;

use crate::state::AppState;

/// Build the full router with auth applied to every route.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Runs
        .route("/runs", post(runs::create_run).get(runs::list_runs))
        .route("/runs/:id", get(runs::get_run).delete(runs::delete_run))
        .route("/runs/:id/actions", post(runs::run_action))
        .route("/runs/:id/events", get(runs::run_events_sse))
        // Jobs
        .route("/jobs", get(jobs::list_jobs).post(jobs::create_job))
        .route("/jobs/status", get(jobs::jobs_status))
        .route("/jobs/:id", put(jobs::update_job).delete(jobs::delete_job).get(jobs::get_job))
        .route("/jobs/:id/run", post(jobs::run_job_now))
        // Channels
        .route("/channels", get(channels::list_channels))
        .route("/channels/:id", get(channels::get_channel).put(channels::update_channel))
        .route("/channels/:id/start", post(channels::start_channel))
        .route("/channels/:id/stop", post(channels::stop_channel))
        // RPC envelope
        .route("/gateway", post(gateway::gateway_rpc))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::require_token,
        ))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Map a domain error onto an HTTP response.
pub fn error_response(err: &Error) -> Response {
    let status = match err {
        Error::Validation(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
        Error::Auth(_) => StatusCode::UNAUTHORIZED,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::PolicyDenied(_) => StatusCode::FORBIDDEN,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        axum::Json(serde_json::json!({
            "error": { "code": err.code(), "message": err.to_string() }
        })),
    )
        .into_response()
}
