//! Scheduler data model: jobs, schedules, payloads, and per-job state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schedule & payload
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Recurring interval. The next deadline after a run is
    /// `max(finish, previous deadline) + every_ms`.
    Every { every_ms: u64 },
    /// Absolute one-shot timestamp.
    At { at: DateTime<Utc> },
    /// 5-field cron expression, evaluated in `tz` at fire time
    /// (host-local when absent).
    Cron {
        expr: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// Fire an agent run.
    Run {
        instruction: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },
    /// Emit a plain event (notification text, no run).
    Event { text: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Job state & record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Ok,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<JobRunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<i64>,
    /// Set while a firing is in flight; at most one per job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_at_ms: Option<i64>,
    #[serde(default)]
    pub consecutive_errors: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    pub schedule: Schedule,
    pub payload: JobPayload,
    #[serde(default)]
    pub delete_after_run: bool,
    #[serde(default)]
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Creation parameters (the API shape).
#[derive(Debug, Clone, Deserialize)]
pub struct NewJob {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub schedule: Schedule,
    pub payload: JobPayload,
    #[serde(default)]
    pub delete_after_run: bool,
}

fn default_enabled() -> bool {
    true
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backoff
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const BACKOFF_BASE_MS: u64 = 60_000;
pub const BACKOFF_MAX_EXP: u32 = 10;
pub const BACKOFF_CAP_MS: u64 = 6 * 60 * 60 * 1000; // 6 hours

/// Delay before the next attempt of a failing job:
/// `base * 2^min(n, 10)` plus up to 20% deterministic jitter, capped.
pub fn backoff_delay_ms(consecutive_errors: u32) -> u64 {
    if consecutive_errors == 0 {
        return 0;
    }
    let exp = consecutive_errors.min(BACKOFF_MAX_EXP);
    let base = BACKOFF_BASE_MS.saturating_mul(1 << exp);
    let jitter = (base as f64 * 0.2 * jitter_fraction(consecutive_errors)) as u64;
    (base + jitter).min(BACKOFF_CAP_MS)
}

/// Deterministic fraction [0, 1) from the error count (Knuth hash).
fn jitter_fraction(n: u32) -> f64 {
    let hash = n.wrapping_mul(2654435761);
    (hash as f64) / (u32::MAX as f64)
}
