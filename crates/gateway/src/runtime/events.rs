//! Run event model.
//!
//! Every observable moment of a run is one `RunEvent`: totally ordered
//! per run by a monotonic sequence, appended to the run's durable log,
//! never mutated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::runs::RunStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: Uuid,
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: RunEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunEventKind {
    StatusChanged {
        status: RunStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ActionProgress {
        iteration: u32,
        max_iterations: u32,
    },
    LlmToken {
        text: String,
    },
    LlmThinking {
        text: String,
    },
    ToolCall {
        name: String,
        args: Value,
        iteration: u32,
    },
    ToolResult {
        name: String,
        result: Value,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        error: bool,
    },
    ToolApprovalRequested {
        approval_id: Uuid,
        tool_name: String,
        description: String,
    },
    RunCompleted {
        content: String,
    },
    RunFailed {
        error: String,
    },
    RunWarning {
        message: String,
    },
}

impl RunEventKind {
    /// The wire name of this event type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "STATUS_CHANGED",
            Self::ActionProgress { .. } => "ACTION_PROGRESS",
            Self::LlmToken { .. } => "LLM_TOKEN",
            Self::LlmThinking { .. } => "LLM_THINKING",
            Self::ToolCall { .. } => "TOOL_CALL",
            Self::ToolResult { .. } => "TOOL_RESULT",
            Self::ToolApprovalRequested { .. } => "TOOL_APPROVAL_REQUESTED",
            Self::RunCompleted { .. } => "RUN_COMPLETED",
            Self::RunFailed { .. } => "RUN_FAILED",
            Self::RunWarning { .. } => "RUN_WARNING",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_wire_type_names() {
        let event = RunEvent {
            run_id: Uuid::new_v4(),
            seq: 3,
            ts: Utc::now(),
            kind: RunEventKind::ActionProgress {
                iteration: 1,
                max_iterations: 5,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ACTION_PROGRESS");
        assert_eq!(json["payload"]["iteration"], 1);
        assert_eq!(json["seq"], 3);
    }

    #[test]
    fn event_roundtrips() {
        let event = RunEvent {
            run_id: Uuid::new_v4(),
            seq: 0,
            ts: Utc::now(),
            kind: RunEventKind::ToolResult {
                name: "exec".into(),
                result: serde_json::json!({"stdout": "hi"}),
                error: false,
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: RunEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.seq, 0);
        assert_eq!(back.kind.type_name(), "TOOL_RESULT");
    }

    #[test]
    fn type_names_match_wire_format() {
        let kind = RunEventKind::RunCompleted { content: "done".into() };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], kind.type_name());
    }
}
