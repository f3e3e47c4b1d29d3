//! Job store — the single persisted job list.
//!
//! Write-through under an async RwLock: every mutation rewrites
//! `scheduler-jobs.json` atomically (temp + rename). Due-job queries
//! return earliest-deadline-first, ties broken by job id, and exclude
//! jobs that are already running.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use ud_domain::error::{Error, Result};

use super::cron::{parse_tz, CronExpr};
use super::model::{backoff_delay_ms, Job, JobRunStatus, JobState, NewJob, Schedule};

pub struct JobStore {
    inner: RwLock<HashMap<Uuid, Job>>,
    path: PathBuf,
}

impl JobStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join("scheduler-jobs.json");
        let jobs = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Vec<Job>>(&raw) {
                Ok(list) => list.into_iter().map(|j| (j.id, j)).collect(),
                Err(e) => {
                    tracing::warn!(error = %e, "corrupt jobs file, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Ok(Self {
            inner: RwLock::new(jobs),
            path,
        })
    }

    async fn persist(&self) {
        let json = {
            let map = self.inner.read().await;
            let mut jobs: Vec<&Job> = map.values().collect();
            jobs.sort_by_key(|j| j.id);
            match serde_json::to_string_pretty(&jobs) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!(error = %e, "job list serialization failed");
                    return;
                }
            }
        };
        let path = self.path.clone();
        let _ = tokio::task::spawn_blocking(move || {
            let tmp = path.with_extension("json.tmp");
            if let Err(e) = std::fs::write(&tmp, json).and_then(|()| std::fs::rename(&tmp, &path)) {
                tracing::warn!(error = %e, "job list persist failed");
            }
        })
        .await;
    }

    // ── CRUD ──────────────────────────────────────────────────────────

    /// Validate and insert a new job; computes its first deadline.
    pub async fn insert(&self, new: NewJob) -> Result<Job> {
        if new.name.trim().is_empty() {
            return Err(Error::Validation("job name must not be empty".into()));
        }
        // Cron expressions are validated up front, not at fire time.
        if let Schedule::Cron { expr, .. } = &new.schedule {
            CronExpr::parse(expr)?;
        }
        let now = Utc::now();
        let mut job = Job {
            id: Uuid::new_v4(),
            name: new.name,
            description: new.description,
            enabled: new.enabled,
            schedule: new.schedule,
            payload: new.payload,
            delete_after_run: new.delete_after_run,
            state: JobState::default(),
            created_at: now,
            updated_at: now,
        };
        if job.enabled {
            job.state.next_run_at_ms = first_deadline_ms(&job.schedule, now.timestamp_millis());
        }
        self.inner.write().await.insert(job.id, job.clone());
        self.persist().await;
        Ok(job)
    }

    pub async fn get(&self, id: &Uuid) -> Option<Job> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.inner.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    pub async fn update(&self, id: &Uuid, f: impl FnOnce(&mut Job)) -> Result<Job> {
        let job = {
            let mut map = self.inner.write().await;
            let existing = map
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("job '{id}' not found")))?;
            // Edit a copy so a failed validation leaves the job untouched.
            let mut candidate = existing.clone();
            f(&mut candidate);
            candidate.updated_at = Utc::now();
            if let Schedule::Cron { expr, .. } = &candidate.schedule {
                CronExpr::parse(expr)?;
            }
            // Enabling a job without a deadline gives it one.
            if candidate.enabled && candidate.state.next_run_at_ms.is_none() {
                candidate.state.next_run_at_ms =
                    first_deadline_ms(&candidate.schedule, Utc::now().timestamp_millis());
            }
            if !candidate.enabled {
                candidate.state.next_run_at_ms = None;
            }
            *existing = candidate.clone();
            candidate
        };
        self.persist().await;
        Ok(job)
    }

    pub async fn delete(&self, id: &Uuid) -> Result<()> {
        let removed = self.inner.write().await.remove(id).is_some();
        if !removed {
            return Err(Error::NotFound(format!("job '{id}' not found")));
        }
        self.persist().await;
        Ok(())
    }

    // ── Due computation ───────────────────────────────────────────────

    /// Enabled jobs whose deadline has passed and that are not already
    /// running, earliest deadline first, ties broken by id.
    pub async fn due_jobs(&self, now_ms: i64) -> Vec<Job> {
        let mut due: Vec<Job> = self
            .inner
            .read()
            .await
            .values()
            .filter(|j| {
                j.enabled
                    && j.state.running_at_ms.is_none()
                    && j.state.next_run_at_ms.map_or(false, |next| next <= now_ms)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            (a.state.next_run_at_ms, a.id).cmp(&(b.state.next_run_at_ms, b.id))
        });
        due
    }

    /// Earliest upcoming deadline across enabled, non-running jobs.
    pub async fn earliest_deadline_ms(&self) -> Option<i64> {
        self.inner
            .read()
            .await
            .values()
            .filter(|j| j.enabled && j.state.running_at_ms.is_none())
            .filter_map(|j| j.state.next_run_at_ms)
            .min()
    }

    /// Claim a job for firing. Fails if it is already running (at most
    /// one firing per job in flight, even under concurrent ticks).
    pub async fn mark_running(&self, id: &Uuid, now_ms: i64) -> Result<Job> {
        let job = {
            let mut map = self.inner.write().await;
            let job = map
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("job '{id}' not found")))?;
            if job.state.running_at_ms.is_some() {
                return Err(Error::Validation(format!("job '{id}' is already running")));
            }
            job.state.running_at_ms = Some(now_ms);
            job.clone()
        };
        self.persist().await;
        Ok(job)
    }

    /// Record a successful firing. Deletes the job when
    /// `delete_after_run`; disables one-shot `at` jobs otherwise.
    pub async fn record_ok(
        &self,
        id: &Uuid,
        duration_ms: u64,
        run_id: Option<Uuid>,
    ) -> Result<()> {
        let delete = {
            let mut map = self.inner.write().await;
            let Some(job) = map.get_mut(id) else {
                return Ok(()); // deleted mid-flight
            };
            let now_ms = Utc::now().timestamp_millis();
            job.state.last_status = Some(JobRunStatus::Ok);
            job.state.last_error = None;
            job.state.last_run_at_ms = Some(now_ms);
            job.state.last_duration_ms = Some(duration_ms);
            job.state.last_run_id = run_id;
            job.state.running_at_ms = None;
            job.state.consecutive_errors = 0;
            job.updated_at = Utc::now();

            if job.delete_after_run {
                true
            } else {
                match &job.schedule {
                    Schedule::At { .. } => {
                        job.enabled = false;
                        job.state.next_run_at_ms = None;
                    }
                    _ => {
                        job.state.next_run_at_ms = next_deadline_ms(job, now_ms);
                    }
                }
                false
            }
        };
        if delete {
            self.inner.write().await.remove(id);
        }
        self.persist().await;
        Ok(())
    }

    /// Record a failed firing: exponential backoff pushes the next
    /// deadline out.
    pub async fn record_error(&self, id: &Uuid, error: &str) -> Result<()> {
        {
            let mut map = self.inner.write().await;
            let Some(job) = map.get_mut(id) else {
                return Ok(());
            };
            let now_ms = Utc::now().timestamp_millis();
            job.state.last_status = Some(JobRunStatus::Error);
            job.state.last_error = Some(error.to_owned());
            job.state.last_run_at_ms = Some(now_ms);
            job.state.running_at_ms = None;
            job.state.consecutive_errors += 1;
            job.updated_at = Utc::now();

            let natural = next_deadline_ms(job, now_ms);
            let backed_off = now_ms + backoff_delay_ms(job.state.consecutive_errors) as i64;
            job.state.next_run_at_ms = Some(match natural {
                Some(natural) => natural.max(backed_off),
                None => backed_off,
            });
        }
        self.persist().await;
        Ok(())
    }

    /// Record a skipped firing; the next deadline computes normally.
    pub async fn record_skipped(&self, id: &Uuid) -> Result<()> {
        {
            let mut map = self.inner.write().await;
            let Some(job) = map.get_mut(id) else {
                return Ok(());
            };
            let now_ms = Utc::now().timestamp_millis();
            job.state.last_status = Some(JobRunStatus::Skipped);
            job.state.running_at_ms = None;
            job.state.next_run_at_ms = next_deadline_ms(job, now_ms);
            job.updated_at = Utc::now();
        }
        self.persist().await;
        Ok(())
    }

    /// Boot recovery: clear stale running flags. Overdue `at` jobs keep
    /// their past deadline, so the first tick fires them once; missed
    /// recurring deadlines are not retroactively fired.
    pub async fn recover(&self) {
        let now_ms = Utc::now().timestamp_millis();
        {
            let mut map = self.inner.write().await;
            for job in map.values_mut() {
                if job.state.running_at_ms.take().is_some() {
                    tracing::info!(job_id = %job.id, "cleared stale running flag");
                }
                if job.enabled {
                    match &job.schedule {
                        // One-shot in the past: leave due for immediate fire.
                        Schedule::At { .. } => {}
                        _ => {
                            let overdue = job
                                .state
                                .next_run_at_ms
                                .map_or(true, |next| next <= now_ms);
                            if overdue {
                                job.state.next_run_at_ms = next_deadline_ms(job, now_ms);
                            }
                        }
                    }
                }
            }
        }
        self.persist().await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Deadline computation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Deadline for a job that has never fired.
fn first_deadline_ms(schedule: &Schedule, now_ms: i64) -> Option<i64> {
    match schedule {
        Schedule::Every { every_ms } => Some(now_ms + *every_ms as i64),
        Schedule::At { at } => Some(at.timestamp_millis()),
        Schedule::Cron { expr, tz } => cron_next_ms(expr, tz.as_deref(), now_ms),
    }
}

/// Deadline after a firing finished at `finished_ms`.
fn next_deadline_ms(job: &Job, finished_ms: i64) -> Option<i64> {
    match &job.schedule {
        Schedule::Every { every_ms } => {
            // max(finish time, previous deadline) + interval: a slow run
            // pushes the cadence out instead of firing back to back.
            let anchor = job
                .state
                .next_run_at_ms
                .map_or(finished_ms, |prev| prev.max(finished_ms));
            Some(anchor + *every_ms as i64)
        }
        Schedule::At { .. } => None,
        Schedule::Cron { expr, tz } => cron_next_ms(expr, tz.as_deref(), finished_ms),
    }
}

fn cron_next_ms(expr: &str, tz: Option<&str>, after_ms: i64) -> Option<i64> {
    let expr = CronExpr::parse(expr).ok()?;
    let after = chrono::DateTime::<Utc>::from_timestamp_millis(after_ms)?;
    expr.next_after(&after, parse_tz(tz))
        .map(|dt| dt.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::scheduler::model::JobPayload;

    fn every_job(name: &str, every_ms: u64) -> NewJob {
        NewJob {
            name: name.into(),
            description: None,
            enabled: true,
            schedule: Schedule::Every { every_ms },
            payload: JobPayload::Run {
                instruction: "noop".into(),
                agent_id: None,
            },
            delete_after_run: false,
        }
    }

    async fn store(dir: &Path) -> JobStore {
        JobStore::new(dir).unwrap()
    }

    #[tokio::test]
    async fn insert_computes_first_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let before = Utc::now().timestamp_millis();
        let job = store.insert(every_job("j", 1000)).await.unwrap();
        let next = job.state.next_run_at_ms.unwrap();
        assert!(next >= before + 1000);
        assert!(next <= Utc::now().timestamp_millis() + 1100);
    }

    #[tokio::test]
    async fn invalid_cron_rejected_at_insert() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let mut job = every_job("bad", 0);
        job.schedule = Schedule::Cron {
            expr: "not a cron".into(),
            tz: None,
        };
        assert_eq!(store.insert(job).await.unwrap_err().code(), "Validation");
    }

    #[tokio::test]
    async fn empty_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        assert!(store.insert(every_job("  ", 1000)).await.is_err());
    }

    #[tokio::test]
    async fn due_jobs_edf_with_id_tiebreak() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let a = store.insert(every_job("a", 1000)).await.unwrap();
        let b = store.insert(every_job("b", 1000)).await.unwrap();
        let c = store.insert(every_job("c", 1000)).await.unwrap();

        // Force deadlines: c earliest, a and b tied later.
        store.update(&c.id, |j| j.state.next_run_at_ms = Some(100)).await.unwrap();
        store.update(&a.id, |j| j.state.next_run_at_ms = Some(200)).await.unwrap();
        store.update(&b.id, |j| j.state.next_run_at_ms = Some(200)).await.unwrap();

        let due = store.due_jobs(1_000).await;
        assert_eq!(due.len(), 3);
        assert_eq!(due[0].id, c.id);
        // Tie at 200: lexicographically smaller id first.
        let (x, y) = (due[1].id, due[2].id);
        assert!(x < y);
        assert!([a.id, b.id].contains(&x));
    }

    #[tokio::test]
    async fn running_job_not_due_again() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let job = store.insert(every_job("j", 1000)).await.unwrap();
        store.update(&job.id, |j| j.state.next_run_at_ms = Some(0)).await.unwrap();

        assert_eq!(store.due_jobs(10).await.len(), 1);
        store.mark_running(&job.id, 10).await.unwrap();
        assert!(store.due_jobs(10).await.is_empty());

        // Double-claim is rejected.
        assert!(store.mark_running(&job.id, 10).await.is_err());
    }

    #[tokio::test]
    async fn record_ok_resets_errors_and_advances() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let job = store.insert(every_job("j", 1000)).await.unwrap();
        store.mark_running(&job.id, 0).await.unwrap();

        let run_id = Uuid::new_v4();
        store.record_ok(&job.id, 42, Some(run_id)).await.unwrap();

        let job = store.get(&job.id).await.unwrap();
        assert_eq!(job.state.last_status, Some(JobRunStatus::Ok));
        assert_eq!(job.state.last_run_id, Some(run_id));
        assert_eq!(job.state.last_duration_ms, Some(42));
        assert!(job.state.running_at_ms.is_none());
        assert_eq!(job.state.consecutive_errors, 0);
        assert!(job.state.next_run_at_ms.is_some());
    }

    #[tokio::test]
    async fn delete_after_run_removes_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let mut new = every_job("once", 1000);
        new.delete_after_run = true;
        let job = store.insert(new).await.unwrap();

        store.mark_running(&job.id, 0).await.unwrap();
        store.record_ok(&job.id, 1, None).await.unwrap();
        assert!(store.get(&job.id).await.is_none());
    }

    #[tokio::test]
    async fn at_job_disabled_after_firing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let new = NewJob {
            name: "one-shot".into(),
            description: None,
            enabled: true,
            schedule: Schedule::At { at: Utc::now() },
            payload: JobPayload::Event { text: "ping".into() },
            delete_after_run: false,
        };
        let job = store.insert(new).await.unwrap();
        store.mark_running(&job.id, 0).await.unwrap();
        store.record_ok(&job.id, 1, None).await.unwrap();

        let job = store.get(&job.id).await.unwrap();
        assert!(!job.enabled);
        assert!(job.state.next_run_at_ms.is_none());
    }

    #[tokio::test]
    async fn record_error_applies_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let job = store.insert(every_job("flaky", 1000)).await.unwrap();
        store.mark_running(&job.id, 0).await.unwrap();

        let before = Utc::now().timestamp_millis();
        store.record_error(&job.id, "boom").await.unwrap();

        let job = store.get(&job.id).await.unwrap();
        assert_eq!(job.state.last_status, Some(JobRunStatus::Error));
        assert_eq!(job.state.last_error.as_deref(), Some("boom"));
        assert_eq!(job.state.consecutive_errors, 1);
        // One failure pushes the deadline out by at least base * 2^1.
        assert!(job.state.next_run_at_ms.unwrap() >= before + 120_000);
    }

    #[tokio::test]
    async fn recover_clears_running_and_keeps_overdue_at() {
        let dir = tempfile::tempdir().unwrap();
        let at_id;
        let every_id;
        {
            let store = store(dir.path()).await;
            let at_job = store
                .insert(NewJob {
                    name: "past-at".into(),
                    description: None,
                    enabled: true,
                    schedule: Schedule::At {
                        at: Utc::now() - chrono::Duration::hours(1),
                    },
                    payload: JobPayload::Event { text: "x".into() },
                    delete_after_run: true,
                })
                .await
                .unwrap();
            at_id = at_job.id;
            let every = store.insert(every_job("tick", 1000)).await.unwrap();
            every_id = every.id;
            // Simulate a crash mid-flight.
            store.update(&every.id, |j| {
                j.state.running_at_ms = Some(123);
                j.state.next_run_at_ms = Some(0); // long overdue
            })
            .await
            .unwrap();
        }

        let store = store(dir.path()).await;
        store.recover().await;
        let now_ms = Utc::now().timestamp_millis();

        let every = store.get(&every_id).await.unwrap();
        assert!(every.state.running_at_ms.is_none());
        // Missed recurring deadline is not retro-fired; pushed forward.
        assert!(every.state.next_run_at_ms.unwrap() > now_ms);

        // The overdue at-job is still due and fires once.
        let at_job = store.get(&at_id).await.unwrap();
        assert!(at_job.state.next_run_at_ms.unwrap() <= now_ms);
        assert_eq!(store.due_jobs(now_ms).await.len(), 1);
    }

    #[tokio::test]
    async fn jobs_persist_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let id;
        {
            let store = store(dir.path()).await;
            id = store.insert(every_job("keep", 5000)).await.unwrap().id;
        }
        let store = store(dir.path()).await;
        let job = store.get(&id).await.unwrap();
        assert_eq!(job.name, "keep");
    }

    #[tokio::test]
    async fn disable_clears_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let job = store.insert(every_job("j", 1000)).await.unwrap();
        let job = store.update(&job.id, |j| j.enabled = false).await.unwrap();
        assert!(job.state.next_run_at_ms.is_none());
        assert!(store.due_jobs(i64::MAX).await.is_empty());
    }
}
