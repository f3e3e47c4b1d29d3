//! Channel manager — owns every registered channel adapter.
//!
//! Starts enabled channels on daemon start, stops them on shutdown, and
//! wires each adapter's inbound stream through the shared policy filter,
//! per-user rate limiter, and debounced queue before handing messages to
//! the run bridge. The bridge handler is injected after construction so
//! the manager never depends on the executor at build time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;

use ud_domain::error::{Error, Result};

use crate::backoff::{BackoffPolicy, ReconnectBackoff};
use crate::channel::{
    derive_status, filter_inbound, Channel, ChannelConfig, ChannelId, ChannelRuntime,
    ChannelStatus, InboundHandler, InboundMessage,
};
use crate::queue::MessageQueue;
use crate::rate_limit::RateLimiter;

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(400);
const QUEUE_MAX: usize = 256;

pub struct ChannelManager {
    channels: RwLock<HashMap<ChannelId, Arc<dyn Channel>>>,
    configs: RwLock<HashMap<ChannelId, ChannelConfig>>,
    /// Manager-maintained runtime overlay for channels that never started.
    runtimes: RwLock<HashMap<ChannelId, ChannelRuntime>>,
    config_dir: PathBuf,
    /// Shared with each channel's queue-drain closure.
    bridge: Arc<RwLock<Option<InboundHandler>>>,
    backoff_policy: BackoffPolicy,
    debounce: Duration,
}

impl ChannelManager {
    pub fn new(config_dir: &Path) -> Result<Arc<Self>> {
        std::fs::create_dir_all(config_dir)?;
        let manager = Arc::new(Self {
            channels: RwLock::new(HashMap::new()),
            configs: RwLock::new(HashMap::new()),
            runtimes: RwLock::new(HashMap::new()),
            config_dir: config_dir.to_path_buf(),
            bridge: Arc::new(RwLock::new(None)),
            backoff_policy: BackoffPolicy::default(),
            debounce: DEFAULT_DEBOUNCE,
        });
        manager.load_configs();
        Ok(manager)
    }

    /// Inject the channel→run bridge (post-construction, breaks the
    /// manager↔executor cycle).
    pub fn set_bridge(&self, handler: InboundHandler) {
        *self.bridge.write() = Some(handler);
    }

    pub fn register(&self, channel: Arc<dyn Channel>) {
        let id = channel.id();
        self.channels.write().insert(id, channel);
        self.configs
            .write()
            .entry(id)
            .or_insert_with(|| ChannelConfig::new(id));
    }

    pub fn get(&self, id: ChannelId) -> Option<Arc<dyn Channel>> {
        self.channels.read().get(&id).cloned()
    }

    // ── Config ────────────────────────────────────────────────────────

    pub fn config(&self, id: ChannelId) -> Option<ChannelConfig> {
        self.configs.read().get(&id).cloned()
    }

    /// Update and persist a channel's config. Applied on next (re)start.
    pub fn update_config(&self, config: ChannelConfig) -> Result<()> {
        let id = config.channel_id;
        self.persist_config(&config)?;
        self.configs.write().insert(id, config);
        Ok(())
    }

    fn persist_config(&self, config: &ChannelConfig) -> Result<()> {
        let dir = self.config_dir.join(config.channel_id.as_str());
        std::fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(config)?;
        let path = dir.join("config.json");
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load_configs(&self) {
        let mut configs = self.configs.write();
        for id in [
            ChannelId::Telegram,
            ChannelId::Discord,
            ChannelId::Slack,
            ChannelId::Whatsapp,
        ] {
            let path = self.config_dir.join(id.as_str()).join("config.json");
            if let Ok(raw) = std::fs::read_to_string(&path) {
                match serde_json::from_str::<ChannelConfig>(&raw) {
                    Ok(config) => {
                        configs.insert(id, config);
                    }
                    Err(e) => {
                        tracing::warn!(channel = %id, error = %e, "corrupt channel config, ignoring");
                    }
                }
            }
        }
    }

    // ── Status ────────────────────────────────────────────────────────

    pub fn status(&self, id: ChannelId) -> Option<ChannelStatus> {
        let config = self.config(id)?;
        let runtime = self
            .channels
            .read()
            .get(&id)
            .map(|c| c.runtime())
            .or_else(|| self.runtimes.read().get(&id).cloned())
            .unwrap_or_default();
        Some(derive_status(&config, &runtime))
    }

    pub fn list_status(&self) -> Vec<ChannelStatus> {
        let ids: Vec<ChannelId> = self.configs.read().keys().copied().collect();
        let mut statuses: Vec<ChannelStatus> =
            ids.into_iter().filter_map(|id| self.status(id)).collect();
        statuses.sort_by_key(|s| s.channel_id.as_str());
        statuses
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Start every enabled, registered channel.
    pub async fn start_all(&self) {
        let ids: Vec<ChannelId> = self.channels.read().keys().copied().collect();
        for id in ids {
            let enabled = self.config(id).map_or(false, |c| c.enabled);
            if enabled {
                self.start_channel(id).await;
            }
        }
    }

    /// Start one channel with reconnect backoff. Returns after the first
    /// successful connect or once the backoff budget is exhausted.
    pub async fn start_channel(&self, id: ChannelId) {
        let Some(channel) = self.get(id) else {
            tracing::warn!(channel = %id, "start requested for unregistered channel");
            return;
        };
        let Some(config) = self.config(id) else {
            return;
        };

        let handler = self.build_inbound_chain(&config);
        let mut backoff = ReconnectBackoff::new(self.backoff_policy.clone());

        loop {
            match channel.start(&config, handler.clone()).await {
                Ok(()) => {
                    backoff.reset();
                    self.runtimes.write().insert(
                        id,
                        ChannelRuntime {
                            connected: true,
                            last_connected_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    );
                    tracing::info!(channel = %id, "channel connected");
                    return;
                }
                Err(e) => {
                    self.runtimes.write().insert(
                        id,
                        ChannelRuntime {
                            last_error: Some(e.to_string()),
                            ..Default::default()
                        },
                    );
                    match backoff.next_backoff() {
                        Some(delay) => {
                            tracing::warn!(
                                channel = %id,
                                error = %e,
                                delay_ms = delay.as_millis() as u64,
                                "channel connect failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            tracing::error!(channel = %id, error = %e, "channel connect gave up");
                            return;
                        }
                    }
                }
            }
        }
    }

    pub async fn stop_all(&self) {
        let channels: Vec<Arc<dyn Channel>> = self.channels.read().values().cloned().collect();
        for channel in channels {
            if let Err(e) = channel.stop().await {
                tracing::warn!(channel = %channel.id(), error = %e, "channel stop failed");
            }
        }
    }

    /// Send through a registered channel (used by the `channel_send` tool).
    pub async fn send(&self, id: ChannelId, to: &str, text: &str) -> Result<()> {
        let channel = self
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("channel '{id}' not registered")))?;
        channel.send(to, text).await
    }

    /// Build the per-channel inbound pipeline:
    /// policy filter → rate limiter → debounced queue → bridge.
    fn build_inbound_chain(&self, config: &ChannelConfig) -> InboundHandler {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit));
        let bridge = self.bridge.clone();
        let queue = Arc::new(MessageQueue::new(
            QUEUE_MAX,
            self.debounce,
            move |msg: InboundMessage| {
                if let Some(handler) = bridge.read().clone() {
                    handler(msg);
                } else {
                    tracing::warn!("inbound message dropped: no bridge installed");
                }
            },
        ));

        let config = config.clone();
        Arc::new(move |msg: InboundMessage| {
            if let Some(reason) = filter_inbound(&config, &msg) {
                tracing::debug!(
                    channel = %msg.channel,
                    user = %msg.user_id,
                    ?reason,
                    "inbound message dropped by policy"
                );
                return;
            }
            if !limiter.allow(&msg.user_id) {
                tracing::debug!(channel = %msg.channel, user = %msg.user_id, "rate limited");
                return;
            }
            queue.enqueue(msg);
        })
    }
}
