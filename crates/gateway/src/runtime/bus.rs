//! In-process event bus for run events.
//!
//! Publish fans out to three audiences, in order: the privileged `on_all`
//! sinks (the run manager persists through one of these), the per-run
//! broadcast channel, and the wildcard broadcast channel. Broadcast
//! receivers that fall behind drop old events rather than blocking the
//! publisher; a panicking sink is isolated and cannot affect other
//! subscribers or the publisher.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::events::RunEvent;

type Sink = Box<dyn Fn(&RunEvent) + Send + Sync>;

const CHANNEL_CAPACITY: usize = 256;

pub struct EventBus {
    sinks: RwLock<Vec<Sink>>,
    per_run: RwLock<HashMap<Uuid, broadcast::Sender<RunEvent>>>,
    all_tx: broadcast::Sender<RunEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (all_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sinks: RwLock::new(Vec::new()),
            per_run: RwLock::new(HashMap::new()),
            all_tx,
        }
    }

    /// Register a privileged synchronous sink that sees every event in
    /// publish order.
    pub fn on_all<F>(&self, sink: F)
    where
        F: Fn(&RunEvent) + Send + Sync + 'static,
    {
        self.sinks.write().push(Box::new(sink));
    }

    /// Subscribe to one run's events, or to everything with `None`.
    pub fn subscribe(&self, run_id: Option<Uuid>) -> broadcast::Receiver<RunEvent> {
        match run_id {
            Some(id) => {
                let mut per_run = self.per_run.write();
                per_run
                    .entry(id)
                    .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                    .subscribe()
            }
            None => self.all_tx.subscribe(),
        }
    }

    /// Deliver an event to every sink and subscriber. Never blocks.
    pub fn publish(&self, event: &RunEvent) {
        {
            let sinks = self.sinks.read();
            for sink in sinks.iter() {
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| sink(event)));
                if result.is_err() {
                    tracing::warn!(run_id = %event.run_id, "event sink panicked");
                }
            }
        }

        if let Some(tx) = self.per_run.read().get(&event.run_id) {
            let _ = tx.send(event.clone());
        }
        let _ = self.all_tx.send(event.clone());
    }

    /// Drop the per-run channel once a run reaches a terminal state.
    pub fn cleanup_run(&self, run_id: &Uuid) {
        self.per_run.write().remove(run_id);
    }
}
