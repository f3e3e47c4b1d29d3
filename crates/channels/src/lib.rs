//! Chat channel layer: the uniform `Channel` contract in front of
//! heterogeneous chat backends, plus the machinery every adapter shares —
//! reconnect backoff, inbound policy filtering, debounced message
//! queueing, and per-user rate limiting.

pub mod backoff;
pub mod channel;
pub mod manager;
pub mod queue;
pub mod rate_limit;

pub use backoff::ReconnectBackoff;
pub use channel::{
    Channel, ChannelConfig, ChannelId, ChannelRuntime, ChannelStatus, Diagnostic, DmPolicy,
    InboundHandler, InboundMessage, Severity, StatusKind,
};
pub use manager::ChannelManager;
pub use queue::MessageQueue;
pub use rate_limit::RateLimiter;
