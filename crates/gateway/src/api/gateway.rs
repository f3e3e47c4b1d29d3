//! `POST /gateway` — the RPC-style envelope for operations that don't
//! warrant their own route: approval resolution, undo/redo, action log
//! queries, exec session listings, and usage.
//!
//! Every response is `{ok: true, result}` or
//! `{ok: false, error: {code, message}}`.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use ud_domain::error::{Error, Result};

use crate::runtime::actions::ActionFilter;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

pub async fn gateway_rpc(
    State(state): State<AppState>,
    Json(req): Json<RpcRequest>,
) -> impl IntoResponse {
    match dispatch(&state, &req).await {
        Ok(result) => Json(json!({ "ok": true, "result": result })),
        Err(e) => Json(json!({
            "ok": false,
            "error": { "code": e.code(), "message": e.to_string() }
        })),
    }
}

fn param_uuid(params: &Value, key: &str) -> Result<Uuid> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| Error::Validation(format!("missing or invalid '{key}'")))
}

fn param_usize(params: &Value, key: &str, default: usize) -> usize {
    params
        .get(key)
        .and_then(|v| v.as_u64())
        .map_or(default, |n| n as usize)
}

async fn dispatch(state: &AppState, req: &RpcRequest) -> Result<Value> {
    let registry = &state.deps.registry;
    match req.method.as_str() {
        "approvals.list" => Ok(json!(registry.approvals().list_pending())),

        "approvals.resolve" => {
            let id = param_uuid(&req.params, "id")?;
            let allow = req
                .params
                .get("allow")
                .and_then(|v| v.as_bool())
                .ok_or_else(|| Error::Validation("missing 'allow'".into()))?;
            if !registry.approvals().resolve(&id, allow) {
                return Err(Error::NotFound(format!("approval '{id}' not pending")));
            }
            Ok(json!({ "resolved": id, "allow": allow }))
        }

        "undo.action" => {
            let id = param_uuid(&req.params, "id")?;
            let applied = registry.undo().undo_action(&id).await?;
            Ok(json!({ "undone": applied }))
        }

        "undo.last" => {
            let n = param_usize(&req.params, "n", 1);
            let undone = registry.undo().undo_last_n(n).await?;
            Ok(json!({ "undone": undone }))
        }

        "undo.all" => {
            let undone = registry.undo().undo_all().await?;
            Ok(json!({ "undone": undone }))
        }

        "redo.action" => {
            let id = param_uuid(&req.params, "id")?;
            let applied = registry.undo().redo_action(&id).await?;
            Ok(json!({ "redone": applied }))
        }

        "redo.last" => {
            let n = param_usize(&req.params, "n", 1);
            let redone = registry.undo().redo_last_n(n).await?;
            Ok(json!({ "redone": redone }))
        }

        "redo.all" => {
            let redone = registry.undo().redo_all().await?;
            Ok(json!({ "redone": redone }))
        }

        "actions.list" => {
            let filter = ActionFilter {
                tool_name: req
                    .params
                    .get("tool_name")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                category: req
                    .params
                    .get("category")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok()),
                run_id: param_uuid(&req.params, "run_id").ok(),
            };
            Ok(json!(registry.actions().list(&filter)))
        }

        "actions.get" => {
            let id = param_uuid(&req.params, "id")?;
            Ok(json!(registry.actions().get(&id)?))
        }

        "exec.sessions" => Ok(json!({
            "running": state.exec.list_running(),
            "finished": state.exec.list_finished(),
        })),

        "usage.list" => Ok(json!(state.deps.usage.list())),

        "status" => Ok(json!({
            "runs": state.deps.runs.list().len(),
            "jobs": state.scheduler.store().list().await.len(),
            "pending_approvals": registry.approvals().list_pending().len(),
            "exec_running": state.exec.list_running().len(),
            "security_policy": state.config.security_policy,
        })),

        other => Err(Error::NotFound(format!("unknown method '{other}'"))),
    }
}
