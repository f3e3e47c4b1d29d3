//! Channel → run bridge.
//!
//! Inbound chat messages (already filtered, rate-limited, and debounced
//! by the channel manager) become runs with a stable session id derived
//! from `(channel, chat)`, so every chat keeps one persistent
//! transcript. The run's final content is sent back over the channel.

use std::sync::Arc;

use ud_channels::{ChannelManager, InboundHandler, InboundMessage};
use ud_sessions::chat_session_key;

use super::events::RunEventKind;
use super::executor::{execute_run, ExecutorDeps};
use super::runs::NewRun;

/// Build the handler the channel manager drains its message queue into.
pub fn channel_bridge(deps: Arc<ExecutorDeps>, channels: Arc<ChannelManager>) -> InboundHandler {
    Arc::new(move |msg: InboundMessage| {
        let deps = deps.clone();
        let channels = channels.clone();
        tokio::spawn(async move {
            handle_inbound(deps, channels, msg).await;
        });
    })
}

async fn handle_inbound(
    deps: Arc<ExecutorDeps>,
    channels: Arc<ChannelManager>,
    msg: InboundMessage,
) {
    let session_id = chat_session_key(msg.channel.as_str(), &msg.chat_id);
    let run = match deps.runs.create(NewRun {
        instruction: msg.text.clone(),
        agent_id: None,
        user_id: msg.user_id.clone(),
        job_id: None,
        session_id: Some(session_id),
    }) {
        Ok(run) => run,
        Err(e) => {
            tracing::warn!(error = %e, "bridge failed to create run");
            return;
        }
    };
    tracing::info!(
        run_id = %run.id,
        channel = %msg.channel,
        chat = %msg.chat_id,
        "inbound message started run"
    );

    // Subscribe before the executor starts so no event is missed.
    let mut rx = deps.runs.bus().subscribe(Some(run.id));
    let run_id = run.id;
    let exec_deps = deps.clone();
    let exec = tokio::spawn(async move {
        execute_run(&exec_deps, run_id).await;
    });

    let mut reply: Option<String> = None;
    while let Ok(event) = rx.recv().await {
        match event.kind {
            RunEventKind::RunCompleted { content } => {
                reply = Some(content);
                break;
            }
            RunEventKind::RunFailed { error } => {
                reply = Some(format!("The run failed: {error}"));
                break;
            }
            _ => {}
        }
    }
    let _ = exec.await;

    if let Some(text) = reply.filter(|t| !t.is_empty()) {
        if let Err(e) = channels.send(msg.channel, &msg.chat_id, &text).await {
            tracing::warn!(
                run_id = %run_id,
                channel = %msg.channel,
                error = %e,
                "reply send failed"
            );
        }
    }
}
