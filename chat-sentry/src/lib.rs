//! Admission control and abuse mitigation for chat-automation dashboards.
//!
//! One [`Sentry`] instance owns all admission state: per-category rate-limit
//! ledgers with fixed-window-plus-block semantics, a spam detector for
//! inbound chat traffic, a blacklist/whitelist manager, and a concurrency
//! gate for persistent connections. A background janitor reclaims expired
//! state. Everything is in-memory by design.

pub mod policy;
pub mod sentry;

pub(crate) mod human_duration;
pub(crate) mod keyed;

pub use policy::{
    ApiPolicy, AuthPolicy, BroadcastPolicy, ChatUserPolicy, ConfigError, MessagePolicy, RatePolicy,
    SentryConfig, SocketPolicy,
};
pub use sentry::{
    BlacklistInfoEntry, BroadcastClearance, Clearance, Denial, Sentry, SentryStats, SpamVerdict,
    SweepReport, chat_user_key, janitor::start_janitor,
};
