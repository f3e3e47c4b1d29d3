//! Approval gate — blocks gated tool calls until a human allows or
//! denies them.
//!
//! A gated dispatch registers a pending approval and parks on a oneshot
//! receiver. `resolve(id, allow)` from the API satisfies the waiter; if
//! nobody answers within the deadline, the call is denied by default.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use ud_domain::config::ApprovalMode;

use super::actions::{ActionCategory, ApprovalState};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct PendingApproval {
    info: ApprovalInfo,
    respond: oneshot::Sender<bool>,
}

/// Serializable snapshot of a pending approval.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalInfo {
    pub id: Uuid,
    pub tool_name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ApprovalGate {
    mode: ApprovalMode,
    timeout: Duration,
    pending: RwLock<HashMap<Uuid, PendingApproval>>,
}

impl ApprovalGate {
    pub fn new(mode: ApprovalMode, timeout: Duration) -> Self {
        Self {
            mode,
            timeout,
            pending: RwLock::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> ApprovalMode {
        self.mode
    }

    /// Does this category need approval under the configured mode?
    /// Reads never do; system tools only under `always`.
    pub fn requires_approval(&self, category: ActionCategory) -> bool {
        match self.mode {
            ApprovalMode::Off => false,
            ApprovalMode::Mutate => matches!(
                category,
                ActionCategory::Mutate | ActionCategory::Exec | ActionCategory::Network
            ),
            ApprovalMode::Always => !matches!(category, ActionCategory::Read),
        }
    }

    /// Arm a pending approval. The returned receiver resolves to the
    /// reviewer's decision.
    pub fn request(&self, tool_name: &str, description: &str) -> (ApprovalInfo, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        let info = ApprovalInfo {
            id: Uuid::new_v4(),
            tool_name: tool_name.to_owned(),
            description: description.to_owned(),
            created_at: Utc::now(),
        };
        self.pending.write().insert(
            info.id,
            PendingApproval {
                info: info.clone(),
                respond: tx,
            },
        );
        (info, rx)
    }

    /// Block (cooperatively) until the approval resolves. Timeout or a
    /// dropped responder both deny.
    pub async fn wait(&self, id: Uuid, rx: oneshot::Receiver<bool>) -> ApprovalState {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(true)) => ApprovalState::Granted,
            Ok(Ok(false)) => ApprovalState::Denied,
            Ok(Err(_)) => {
                // Responder dropped without answering.
                self.pending.write().remove(&id);
                ApprovalState::Denied
            }
            Err(_) => {
                tracing::info!(approval_id = %id, "approval timed out, denying");
                self.pending.write().remove(&id);
                ApprovalState::Denied
            }
        }
    }

    /// Resolve a pending approval. Returns `false` for unknown ids
    /// (including already-resolved ones — each resolves exactly once).
    pub fn resolve(&self, id: &Uuid, allow: bool) -> bool {
        if let Some(pending) = self.pending.write().remove(id) {
            let _ = pending.respond.send(allow);
            return true;
        }
        false
    }

    pub fn list_pending(&self) -> Vec<ApprovalInfo> {
        let mut infos: Vec<ApprovalInfo> = self
            .pending
            .read()
            .values()
            .map(|p| p.info.clone())
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }
}
