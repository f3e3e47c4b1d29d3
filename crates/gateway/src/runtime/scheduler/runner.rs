//! Scheduler tick engine.
//!
//! Sleeps until the earliest job deadline (bounded for periodic
//! reconciliation), fires every due job in earliest-deadline order, and
//! records the outcome of each firing. Each firing runs on its own task;
//! at most one firing per job is ever in flight.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use uuid::Uuid;

use ud_domain::error::Result;

use super::model::Job;
use super::store::JobStore;

/// Bound on the tick sleep, for reconciliation.
pub const MAX_TICK_SLEEP: Duration = Duration::from_secs(60);

const EVENT_HISTORY: usize = 200;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Firing callback
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What one firing produced.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Ok { run_id: Option<Uuid> },
    Skipped,
}

pub type BoxedOutcome = Pin<Box<dyn std::future::Future<Output = Result<JobOutcome>> + Send>>;

/// The executor handle the scheduler fires jobs through. Injected after
/// construction; the scheduler never depends on the executor type.
pub type JobExecutor = Arc<dyn Fn(Job) -> BoxedOutcome + Send + Sync>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fire history
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerEvent {
    pub job_id: Uuid,
    pub job_name: String,
    pub fired_at: DateTime<Utc>,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Scheduler {
    store: Arc<JobStore>,
    executor: RwLock<Option<JobExecutor>>,
    history: Arc<Mutex<VecDeque<SchedulerEvent>>>,
    /// Woken to stop the loop, and after job edits to re-evaluate sleep.
    wake: Notify,
    stopping: std::sync::atomic::AtomicBool,
}

impl Scheduler {
    pub fn new(store: Arc<JobStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            executor: RwLock::new(None),
            history: Arc::new(Mutex::new(VecDeque::new())),
            wake: Notify::new(),
            stopping: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Post-construction wiring of the run executor handle.
    pub fn set_executor(&self, executor: JobExecutor) {
        *self.executor.write() = Some(executor);
    }

    /// Nudge the loop (after job creation/edit) so a new earlier
    /// deadline shortens the current sleep.
    pub fn poke(&self) {
        self.wake.notify_waiters();
    }

    /// Stop: no new fires. In-flight firings finish on their own tasks.
    pub fn stop(&self) {
        self.stopping.store(true, std::sync::atomic::Ordering::Release);
        self.wake.notify_waiters();
    }

    pub fn recent_events(&self) -> Vec<SchedulerEvent> {
        self.history.lock().iter().cloned().collect()
    }

    /// The tick loop. Runs until [`Scheduler::stop`].
    pub async fn run_loop(self: Arc<Self>) {
        tracing::info!("scheduler started");
        loop {
            if self.stopping.load(std::sync::atomic::Ordering::Acquire) {
                break;
            }
            self.fire_due().await;

            let sleep = self.next_sleep().await;
            tokio::select! {
                () = tokio::time::sleep(sleep) => {}
                () = self.wake.notified() => {}
            }
        }
        tracing::info!("scheduler stopped");
    }

    async fn next_sleep(&self) -> Duration {
        let now_ms = Utc::now().timestamp_millis();
        match self.store.earliest_deadline_ms().await {
            Some(deadline) if deadline <= now_ms => Duration::from_millis(5),
            Some(deadline) => {
                Duration::from_millis((deadline - now_ms) as u64).min(MAX_TICK_SLEEP)
            }
            None => MAX_TICK_SLEEP,
        }
    }

    /// Fire every due job, earliest deadline first. Each firing is
    /// claimed (`mark_running`) before its task spawns, so a concurrent
    /// tick cannot double-fire.
    pub async fn fire_due(&self) {
        let now_ms = Utc::now().timestamp_millis();
        let due = self.store.due_jobs(now_ms).await;
        for job in due {
            let claimed = match self.store.mark_running(&job.id, now_ms).await {
                Ok(job) => job,
                Err(_) => continue, // raced with another tick
            };
            self.spawn_firing(claimed);
        }
    }

    /// Fire a job immediately, bypassing its schedule (`POST /jobs/:id/run`).
    pub async fn trigger_now(&self, id: &Uuid) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();
        let claimed = self.store.mark_running(id, now_ms).await?;
        self.spawn_firing(claimed);
        Ok(())
    }

    fn spawn_firing(&self, job: Job) {
        let store = self.store.clone();
        let executor = self.executor.read().clone();
        let history = self.history.clone();
        tokio::spawn(async move {
            fire_one(store, executor, history, job).await;
        });
    }
}

async fn fire_one(
    store: Arc<JobStore>,
    executor: Option<JobExecutor>,
    history: Arc<Mutex<VecDeque<SchedulerEvent>>>,
    job: Job,
) {
    let Some(executor) = executor else {
        tracing::warn!(job_id = %job.id, "no executor wired, skipping fire");
        let _ = store.record_skipped(&job.id).await;
        return;
    };

    tracing::info!(job_id = %job.id, name = %job.name, "firing job");
    let started = std::time::Instant::now();
    let job_id = job.id;
    let job_name = job.name.clone();
    let result = executor(job).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let event = match result {
        Ok(JobOutcome::Ok { run_id }) => {
            let _ = store.record_ok(&job_id, duration_ms, run_id).await;
            SchedulerEvent {
                job_id,
                job_name,
                fired_at: Utc::now(),
                status: "ok",
                error: None,
                duration_ms,
                run_id,
            }
        }
        Ok(JobOutcome::Skipped) => {
            let _ = store.record_skipped(&job_id).await;
            SchedulerEvent {
                job_id,
                job_name,
                fired_at: Utc::now(),
                status: "skipped",
                error: None,
                duration_ms,
                run_id: None,
            }
        }
        Err(e) => {
            let message = e.to_string();
            let _ = store.record_error(&job_id, &message).await;
            tracing::warn!(job_id = %job_id, error = %message, "job firing failed");
            SchedulerEvent {
                job_id,
                job_name,
                fired_at: Utc::now(),
                status: "error",
                error: Some(message),
                duration_ms,
                run_id: None,
            }
        }
    };

    let mut history = history.lock();
    history.push_back(event);
    while history.len() > EVENT_HISTORY {
        history.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::scheduler::model::{JobPayload, NewJob, Schedule};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn new_job(name: &str, every_ms: u64, delete_after_run: bool) -> NewJob {
        NewJob {
            name: name.into(),
            description: None,
            enabled: true,
            schedule: Schedule::Every { every_ms },
            payload: JobPayload::Run {
                instruction: "noop".into(),
                agent_id: None,
            },
            delete_after_run,
        }
    }

    fn counting_executor(counter: Arc<AtomicU32>) -> JobExecutor {
        Arc::new(move |_job| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(JobOutcome::Ok {
                    run_id: Some(Uuid::new_v4()),
                })
            })
        })
    }

    async fn scheduler(dir: &std::path::Path) -> Arc<Scheduler> {
        Scheduler::new(Arc::new(JobStore::new(dir).unwrap()))
    }

    #[tokio::test]
    async fn due_job_fires_exactly_once_per_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path()).await;
        let fired = Arc::new(AtomicU32::new(0));
        sched.set_executor(counting_executor(fired.clone()));

        let job = sched.store().insert(new_job("j", 60_000, false)).await.unwrap();
        sched
            .store()
            .update(&job.id, |j| j.state.next_run_at_ms = Some(0))
            .await
            .unwrap();

        // Two concurrent-ish ticks: only one firing.
        sched.fire_due().await;
        sched.fire_due().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // The deadline moved forward past now.
        let job = sched.store().get(&job.id).await.unwrap();
        assert!(job.state.next_run_at_ms.unwrap() > Utc::now().timestamp_millis());
        assert_eq!(sched.recent_events().len(), 1);
        assert_eq!(sched.recent_events()[0].status, "ok");
    }

    #[tokio::test]
    async fn delete_after_run_removes_job_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path()).await;
        let fired = Arc::new(AtomicU32::new(0));
        sched.set_executor(counting_executor(fired.clone()));

        let job = sched.store().insert(new_job("once", 1000, true)).await.unwrap();
        sched
            .store()
            .update(&job.id, |j| j.state.next_run_at_ms = Some(0))
            .await
            .unwrap();

        sched.fire_due().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(sched.store().get(&job.id).await.is_none());
    }

    #[tokio::test]
    async fn failing_executor_records_error_and_backs_off() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path()).await;
        sched.set_executor(Arc::new(|_job| {
            Box::pin(async { Err(ud_domain::error::Error::Other("exploded".into())) })
        }));

        let job = sched.store().insert(new_job("flaky", 1000, false)).await.unwrap();
        sched
            .store()
            .update(&job.id, |j| j.state.next_run_at_ms = Some(0))
            .await
            .unwrap();

        sched.fire_due().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let job = sched.store().get(&job.id).await.unwrap();
        assert_eq!(job.state.consecutive_errors, 1);
        assert_eq!(job.state.last_error.as_deref(), Some("exploded"));
        assert_eq!(sched.recent_events()[0].status, "error");
        // Backed off at least a minute.
        assert!(
            job.state.next_run_at_ms.unwrap()
                >= Utc::now().timestamp_millis() + 50_000
        );
    }

    #[tokio::test]
    async fn parallel_jobs_fire_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path()).await;
        let fired = Arc::new(AtomicU32::new(0));
        sched.set_executor(counting_executor(fired.clone()));

        for name in ["a", "b", "c"] {
            let job = sched.store().insert(new_job(name, 60_000, false)).await.unwrap();
            sched
                .store()
                .update(&job.id, |j| j.state.next_run_at_ms = Some(0))
                .await
                .unwrap();
        }
        sched.fire_due().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn trigger_now_bypasses_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path()).await;
        let fired = Arc::new(AtomicU32::new(0));
        sched.set_executor(counting_executor(fired.clone()));

        // Deadline far in the future.
        let job = sched.store().insert(new_job("later", 3_600_000, false)).await.unwrap();
        sched.trigger_now(&job.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_executor_records_skip() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path()).await;
        let job = sched.store().insert(new_job("j", 1000, false)).await.unwrap();
        sched
            .store()
            .update(&job.id, |j| j.state.next_run_at_ms = Some(0))
            .await
            .unwrap();
        sched.fire_due().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let job = sched.store().get(&job.id).await.unwrap();
        assert_eq!(
            job.state.last_status,
            Some(crate::runtime::scheduler::model::JobRunStatus::Skipped)
        );
    }

    #[tokio::test]
    async fn loop_stops_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path()).await;
        sched.set_executor(counting_executor(Arc::new(AtomicU32::new(0))));

        let handle = tokio::spawn(sched.clone().run_loop());
        tokio::time::sleep(Duration::from_millis(50)).await;
        sched.stop();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn scheduler_end_to_end_fires_within_interval() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path()).await;
        let fired = Arc::new(AtomicU32::new(0));
        sched.set_executor(counting_executor(fired.clone()));

        sched.store().insert(new_job("fast", 100, true)).await.unwrap();
        let handle = tokio::spawn(sched.clone().run_loop());

        // every_ms = 100 with delete_after_run: exactly one firing within 2 s.
        tokio::time::sleep(Duration::from_secs(2)).await;
        sched.stop();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(sched.store().list().await.is_empty());
    }
}
