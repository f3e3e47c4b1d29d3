//! Per-run cancellation and pause control.
//!
//! The executor checks its [`RunControl`] before each LLM call and each
//! tool dispatch. `cancel()` also wakes a paused executor so it can exit
//! without resuming work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Clone)]
pub struct RunControl {
    inner: Arc<ControlInner>,
}

struct ControlInner {
    cancelled: AtomicBool,
    paused: AtomicBool,
    /// Woken on resume and on cancel.
    wake: Notify,
}

impl RunControl {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ControlInner {
                cancelled: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                wake: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.wake.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::Release);
        self.inner.wake.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Park until resumed or cancelled. Returns immediately when neither
    /// flag is set.
    pub async fn wait_if_paused(&self) {
        while self.is_paused() && !self.is_cancelled() {
            // The notify can race the flag store; re-check on a bounded
            // interval rather than waiting forever.
            let _ = tokio::time::timeout(
                Duration::from_millis(200),
                self.inner.wake.notified(),
            )
            .await;
        }
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Controls for every in-flight run, keyed by run id.
#[derive(Default)]
pub struct ControlMap {
    controls: Mutex<HashMap<Uuid, RunControl>>,
}

impl ControlMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, run_id: Uuid) -> RunControl {
        let control = RunControl::new();
        self.controls.lock().insert(run_id, control.clone());
        control
    }

    pub fn get(&self, run_id: &Uuid) -> Option<RunControl> {
        self.controls.lock().get(run_id).cloned()
    }

    pub fn cancel(&self, run_id: &Uuid) -> bool {
        if let Some(control) = self.get(run_id) {
            control.cancel();
            return true;
        }
        false
    }

    pub fn pause(&self, run_id: &Uuid) -> bool {
        if let Some(control) = self.get(run_id) {
            control.pause();
            return true;
        }
        false
    }

    pub fn resume(&self, run_id: &Uuid) -> bool {
        if let Some(control) = self.get(run_id) {
            control.resume();
            return true;
        }
        false
    }

    /// Remove when the executor finishes.
    pub fn remove(&self, run_id: &Uuid) {
        self.controls.lock().remove(run_id);
    }

    pub fn is_running(&self, run_id: &Uuid) -> bool {
        self.controls.lock().contains_key(run_id)
    }

    pub fn active_count(&self) -> usize {
        self.controls.lock().len()
    }

    /// Shutdown path: cancel every in-flight run.
    pub fn cancel_all(&self) {
        for control in self.controls.lock().values() {
            control.cancel();
        }
    }
}
