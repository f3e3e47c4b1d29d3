//! The uniform channel contract and its config/status model.
//!
//! A `Channel` adapts one chat platform. The daemon core only ever sees
//! this trait plus the [`ChannelConfig`] / [`ChannelStatus`] pair; the
//! platform SDK lives behind the implementation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ud_domain::error::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Identity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelId {
    Telegram,
    Discord,
    Slack,
    Whatsapp,
}

impl ChannelId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::Discord => "discord",
            Self::Slack => "slack",
            Self::Whatsapp => "whatsapp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "telegram" => Some(Self::Telegram),
            "discord" => Some(Self::Discord),
            "slack" => Some(Self::Slack),
            "whatsapp" => Some(Self::Whatsapp),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn default_true() -> bool {
    true
}

fn default_rate_limit() -> u32 {
    20
}

fn default_max_media_bytes() -> u64 {
    16 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel_id: ChannelId,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Free-form platform extras (e.g. Slack `app_token`, `dm_policy`).
    #[serde(default)]
    pub extra: HashMap<String, String>,
    #[serde(default)]
    pub user_allowlist: Vec<String>,
    #[serde(default)]
    pub user_blocklist: Vec<String>,
    #[serde(default = "default_true")]
    pub allow_dms: bool,
    #[serde(default = "default_true")]
    pub allow_groups: bool,
    /// Inbound messages allowed per user per rolling minute.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    #[serde(default = "default_max_media_bytes")]
    pub max_media_bytes: u64,
}

impl ChannelConfig {
    pub fn new(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            enabled: false,
            token: None,
            extra: HashMap::new(),
            user_allowlist: Vec::new(),
            user_blocklist: Vec::new(),
            allow_dms: true,
            allow_groups: true,
            rate_limit: default_rate_limit(),
            max_media_bytes: default_max_media_bytes(),
        }
    }

    /// A channel counts as configured once it has credentials. WhatsApp
    /// pairs via QR scan instead of a token.
    pub fn is_configured(&self) -> bool {
        match self.channel_id {
            ChannelId::Whatsapp => self.enabled,
            _ => self.token.as_deref().map_or(false, |t| !t.is_empty()),
        }
    }
}

/// Media size gate.
pub fn is_media_within_limit(size_bytes: u64, max_bytes: u64) -> bool {
    max_bytes == 0 || size_bytes <= max_bytes
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound messages & policy filter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel: ChannelId,
    pub chat_id: String,
    pub user_id: String,
    pub text: String,
    pub is_direct: bool,
    pub is_from_self: bool,
    /// Size of attached media, if any.
    pub media_bytes: Option<u64>,
}

/// Why an inbound message was dropped by policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    FromSelf,
    DmsDisabled,
    GroupsDisabled,
    Blocklisted,
    NotAllowlisted,
    MediaTooLarge,
}

/// Apply the inbound policy. `None` = accepted.
pub fn filter_inbound(config: &ChannelConfig, msg: &InboundMessage) -> Option<DropReason> {
    if msg.is_from_self {
        return Some(DropReason::FromSelf);
    }
    if msg.is_direct && !config.allow_dms {
        return Some(DropReason::DmsDisabled);
    }
    if !msg.is_direct && !config.allow_groups {
        return Some(DropReason::GroupsDisabled);
    }
    if config.user_blocklist.iter().any(|u| u == &msg.user_id) {
        return Some(DropReason::Blocklisted);
    }
    if !config.user_allowlist.is_empty()
        && !config.user_allowlist.iter().any(|u| u == &msg.user_id)
    {
        return Some(DropReason::NotAllowlisted);
    }
    if let Some(size) = msg.media_bytes {
        if !is_media_within_limit(size, config.max_media_bytes) {
            return Some(DropReason::MediaTooLarge);
        }
    }
    None
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Connected,
    AwaitingScan,
    Error,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DmPolicy {
    Pairing,
    Allowlist,
    Open,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: String,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery: Option<String>,
}

/// Live connection fields an adapter maintains.
#[derive(Debug, Clone, Default)]
pub struct ChannelRuntime {
    pub connected: bool,
    pub awaiting_scan: bool,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// The derived channel status — a pure function of config + runtime.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub channel_id: ChannelId,
    pub configured: bool,
    pub connected: bool,
    pub status: StatusKind,
    pub dm_policy: DmPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<DateTime<Utc>>,
    pub diagnostics: Vec<Diagnostic>,
}

pub fn derive_status(config: &ChannelConfig, runtime: &ChannelRuntime) -> ChannelStatus {
    let configured = config.is_configured();

    let status = if runtime.awaiting_scan {
        StatusKind::AwaitingScan
    } else if runtime.connected {
        StatusKind::Connected
    } else if runtime.last_error.is_some() {
        StatusKind::Error
    } else {
        StatusKind::Offline
    };

    let dm_policy = if !config.allow_dms {
        DmPolicy::Disabled
    } else if let Some(p) = config.extra.get("dm_policy").and_then(|s| parse_dm_policy(s)) {
        p
    } else if !config.user_allowlist.is_empty() {
        DmPolicy::Allowlist
    } else if config.channel_id == ChannelId::Whatsapp {
        DmPolicy::Pairing
    } else {
        DmPolicy::Open
    };

    let mut diagnostics = Vec::new();
    if config.enabled && !configured {
        diagnostics.push(Diagnostic {
            code: "token_missing".into(),
            severity: Severity::Error,
            message: format!("{} is enabled but has no token", config.channel_id),
            recovery: Some("set the token and restart the channel".into()),
        });
    }
    if let Some(err) = &runtime.last_error {
        diagnostics.push(Diagnostic {
            code: "channel_error".into(),
            severity: Severity::Error,
            message: err.clone(),
            recovery: Some("the adapter reconnects with backoff; check credentials if this persists".into()),
        });
    }
    if runtime.awaiting_scan {
        diagnostics.push(Diagnostic {
            code: "awaiting_scan".into(),
            severity: Severity::Info,
            message: "pair the device by scanning the QR code".into(),
            recovery: None,
        });
    }

    ChannelStatus {
        channel_id: config.channel_id,
        configured,
        connected: runtime.connected,
        status,
        dm_policy,
        last_connected_at: runtime.last_connected_at,
        diagnostics,
    }
}

fn parse_dm_policy(s: &str) -> Option<DmPolicy> {
    match s {
        "pairing" => Some(DmPolicy::Pairing),
        "allowlist" => Some(DmPolicy::Allowlist),
        "open" => Some(DmPolicy::Open),
        "disabled" => Some(DmPolicy::Disabled),
        _ => None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub type InboundHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// One chat-platform adapter.
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    fn id(&self) -> ChannelId;
    fn name(&self) -> &str;

    /// Connect and begin delivering inbound messages to `on_message`.
    /// Returns once the connection is established; the adapter keeps its
    /// own driver task alive afterwards.
    async fn start(&self, config: &ChannelConfig, on_message: InboundHandler) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn send(&self, to: &str, text: &str) -> Result<()>;

    /// The adapter's live runtime fields (feeds [`derive_status`]).
    fn runtime(&self) -> ChannelRuntime;
}
