//! Channel configuration and lifecycle endpoints.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;

use ud_channels::{ChannelConfig, ChannelId};

use crate::state::AppState;

use super::error_response;

fn parse_channel(raw: &str) -> Result<ChannelId, ud_domain::Error> {
    ChannelId::parse(raw)
        .ok_or_else(|| ud_domain::Error::NotFound(format!("unknown channel '{raw}'")))
}

pub async fn list_channels(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "channels": state.channels.list_status() }))
}

pub async fn get_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let id = match parse_channel(&id) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    match state.channels.status(id) {
        Some(status) => Json(serde_json::json!(status)).into_response(),
        None => error_response(&ud_domain::Error::NotFound(format!(
            "channel '{id}' not configured"
        ))),
    }
}

pub async fn update_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(config): Json<ChannelConfig>,
) -> impl IntoResponse {
    let id = match parse_channel(&id) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    if config.channel_id != id {
        return error_response(&ud_domain::Error::Validation(
            "config channel_id does not match the path".into(),
        ));
    }
    match state.channels.update_config(config) {
        Ok(()) => match state.channels.status(id) {
            Some(status) => Json(serde_json::json!(status)).into_response(),
            None => Json(serde_json::json!({ "updated": id.as_str() })).into_response(),
        },
        Err(e) => error_response(&e),
    }
}

pub async fn start_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let id = match parse_channel(&id) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    let channels = state.channels.clone();
    // Connecting may back off for a while; don't hold the request.
    tokio::spawn(async move {
        channels.start_channel(id).await;
    });
    Json(serde_json::json!({ "starting": id.as_str() })).into_response()
}

pub async fn stop_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let id = match parse_channel(&id) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    match state.channels.get(id) {
        Some(channel) => match channel.stop().await {
            Ok(()) => Json(serde_json::json!({ "stopped": id.as_str() })).into_response(),
            Err(e) => error_response(&e),
        },
        None => error_response(&ud_domain::Error::NotFound(format!(
            "channel '{id}' not registered"
        ))),
    }
}
