//! Shared application state and the shutdown handler list.

use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;

use ud_channels::ChannelManager;
use ud_domain::config::LaunchConfig;
use ud_tools::ExecRegistry;

use crate::runtime::scheduler::Scheduler;
use crate::runtime::ExecutorDeps;

/// Everything the HTTP handlers and background tasks share. The daemon
/// process owns exactly one of these; there is no module-level state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<LaunchConfig>,
    /// Executor dependencies (run manager, bus, registry, transcripts,
    /// controls, prompt, usage, LLM client).
    pub deps: Arc<ExecutorDeps>,
    pub scheduler: Arc<Scheduler>,
    pub channels: Arc<ChannelManager>,
    pub exec: Arc<ExecRegistry>,
    /// SHA-256 of the bearer token; `None` = open (dev) mode.
    pub api_token_hash: Option<Vec<u8>>,
    pub shutdown: Arc<ShutdownHandlers>,
}

type HandlerFuture = Pin<Box<dyn std::future::Future<Output = ()> + Send>>;
type Handler = Box<dyn FnOnce() -> HandlerFuture + Send>;

/// Registered shutdown handlers, run in registration order, each
/// best-effort — a failing handler is logged and never stops the rest.
#[derive(Default)]
pub struct ShutdownHandlers {
    handlers: Mutex<Vec<(String, Handler)>>,
}

impl ShutdownHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&self, name: &str, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handlers
            .lock()
            .push((name.to_owned(), Box::new(move || Box::pin(f()))));
    }

    pub async fn run_all(&self) {
        let handlers = std::mem::take(&mut *self.handlers.lock());
        for (name, handler) in handlers {
            tracing::info!(handler = %name, "running shutdown handler");
            handler().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let handlers = ShutdownHandlers::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let order = order.clone();
            handlers.register(name, move || async move {
                order.lock().push(name);
            });
        }
        handlers.run_all().await;
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn run_all_is_idempotent() {
        let handlers = ShutdownHandlers::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        handlers.register("once", move || async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        handlers.run_all().await;
        handlers.run_all().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
