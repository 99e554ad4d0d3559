//! Per-category admission policies.
//!
//! Every rate-limited traffic category gets its own typed configuration
//! struct with its own defaults, parsed from CLI flags and environment
//! variables. All numeric values are validated once at startup; a bad policy
//! is fatal before the service begins accepting work, never at request time.

use conf::Conf;
use std::time::Duration;

/// Errors detected when validating admission policies at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A category's counting window is zero.
    #[error("{0} policy: window must be nonzero")]
    ZeroWindow(&'static str),
    /// A category's admitted count per window is zero.
    #[error("{0} policy: max count must be nonzero")]
    ZeroMaxCount(&'static str),
    /// A category's block duration is zero.
    #[error("{0} policy: block duration must be nonzero")]
    ZeroBlockDuration(&'static str),
    /// The spam warn threshold is zero.
    #[error("chat-user policy: warn threshold must be nonzero")]
    ZeroWarnThreshold,
    /// The spam warn threshold exceeds the spam message limit.
    #[error("chat-user policy: warn threshold ({warn}) must not exceed max messages ({max})")]
    WarnAboveMax {
        /// Configured warn threshold.
        warn: u32,
        /// Configured message limit.
        max: u32,
    },
    /// The broadcast recipient cap is zero.
    #[error("broadcast policy: max recipients must be nonzero")]
    ZeroRecipientCap,
    /// The concurrent-connection cap is zero.
    #[error("socket policy: max connections must be nonzero")]
    ZeroConnectionCap,
    /// The janitor sweep interval is zero.
    #[error("sweep interval must be nonzero")]
    ZeroSweepInterval,
}

/// Runtime policy consumed by an admission ledger: a fixed counting window,
/// the number of units admitted per window, and the lockout length once the
/// count is exceeded. Immutable after startup.
#[derive(Clone, Copy, Debug)]
pub struct RatePolicy {
    /// Length of the counting window.
    pub window: Duration,
    /// Units admitted per window before a block engages.
    pub max_count: u32,
    /// Lockout length once the window count is exceeded.
    pub block_duration: Duration,
}

impl RatePolicy {
    pub(crate) fn window_ms(&self) -> i64 {
        self.window.as_millis() as i64
    }

    pub(crate) fn block_ms(&self) -> i64 {
        self.block_duration.as_millis() as i64
    }

    fn validate(&self, category: &'static str) -> Result<(), ConfigError> {
        if self.window.is_zero() {
            return Err(ConfigError::ZeroWindow(category));
        }
        if self.max_count == 0 {
            return Err(ConfigError::ZeroMaxCount(category));
        }
        if self.block_duration.is_zero() {
            return Err(ConfigError::ZeroBlockDuration(category));
        }
        Ok(())
    }
}

/// Admission policy for general API traffic, keyed by client address.
#[derive(Clone, Conf, Debug)]
pub struct ApiPolicy {
    /// Length of the counting window.
    #[conf(long, env, default_value = "60s", value_parser = humantime::parse_duration)]
    pub window: Duration,
    /// Requests admitted per window before a block engages.
    #[conf(long, env, default_value = "100")]
    pub max_count: u32,
    /// Lockout length once the window count is exceeded.
    #[conf(long, env, default_value = "5m", value_parser = humantime::parse_duration)]
    pub block_duration: Duration,
}

impl ApiPolicy {
    /// The runtime rate policy for this category.
    pub fn rate_policy(&self) -> RatePolicy {
        RatePolicy {
            window: self.window,
            max_count: self.max_count,
            block_duration: self.block_duration,
        }
    }
}

impl Default for ApiPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_count: 100,
            block_duration: Duration::from_secs(5 * 60),
        }
    }
}

/// Admission policy for authentication attempts, keyed by client address.
/// Far stricter than the API policy: failed-credential stuffing is the
/// main abuse vector here.
#[derive(Clone, Conf, Debug)]
pub struct AuthPolicy {
    /// Length of the counting window.
    #[conf(long, env, default_value = "15m", value_parser = humantime::parse_duration)]
    pub window: Duration,
    /// Attempts admitted per window before a block engages.
    #[conf(long, env, default_value = "5")]
    pub max_count: u32,
    /// Lockout length once the window count is exceeded.
    #[conf(long, env, default_value = "30m", value_parser = humantime::parse_duration)]
    pub block_duration: Duration,
}

impl AuthPolicy {
    /// The runtime rate policy for this category.
    pub fn rate_policy(&self) -> RatePolicy {
        RatePolicy {
            window: self.window,
            max_count: self.max_count,
            block_duration: self.block_duration,
        }
    }
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(15 * 60),
            max_count: 5,
            block_duration: Duration::from_secs(30 * 60),
        }
    }
}

/// Admission policy for outbound message sends, keyed by session.
#[derive(Clone, Conf, Debug)]
pub struct MessagePolicy {
    /// Length of the counting window.
    #[conf(long, env, default_value = "60s", value_parser = humantime::parse_duration)]
    pub window: Duration,
    /// Sends admitted per window before a block engages.
    #[conf(long, env, default_value = "30")]
    pub max_count: u32,
    /// Lockout length once the window count is exceeded.
    #[conf(long, env, default_value = "5m", value_parser = humantime::parse_duration)]
    pub block_duration: Duration,
}

impl MessagePolicy {
    /// The runtime rate policy for this category.
    pub fn rate_policy(&self) -> RatePolicy {
        RatePolicy {
            window: self.window,
            max_count: self.max_count,
            block_duration: self.block_duration,
        }
    }
}

impl Default for MessagePolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_count: 30,
            block_duration: Duration::from_secs(5 * 60),
        }
    }
}

/// Admission policy for broadcast operations, keyed by the originating
/// session, plus the static per-operation recipient cap and the pacing
/// delay handed back to callers on success.
#[derive(Clone, Conf, Debug)]
pub struct BroadcastPolicy {
    /// Length of the counting window.
    #[conf(long, env, default_value = "1h", value_parser = humantime::parse_duration)]
    pub window: Duration,
    /// Broadcast operations admitted per window before a block engages.
    #[conf(long, env, default_value = "10")]
    pub max_count: u32,
    /// Lockout length once the window count is exceeded.
    #[conf(long, env, default_value = "1h", value_parser = humantime::parse_duration)]
    pub block_duration: Duration,
    /// Hard cap on recipients per broadcast, regardless of the window.
    #[conf(long, env, default_value = "500")]
    pub max_recipients: u32,
    /// Suggested delay between per-recipient sends, returned to the caller.
    #[conf(long, env, default_value = "3s", value_parser = humantime::parse_duration)]
    pub per_message_delay: Duration,
}

impl BroadcastPolicy {
    /// The runtime rate policy for this category.
    pub fn rate_policy(&self) -> RatePolicy {
        RatePolicy {
            window: self.window,
            max_count: self.max_count,
            block_duration: self.block_duration,
        }
    }
}

impl Default for BroadcastPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60 * 60),
            max_count: 10,
            block_duration: Duration::from_secs(60 * 60),
            max_recipients: 500,
            per_message_delay: Duration::from_secs(3),
        }
    }
}

/// Spam policy for inbound chat-user traffic, keyed by the composite
/// `session:chat_user` identity. This one classifies rather than rejects:
/// the ingestion layer decides what to do with the verdict.
#[derive(Clone, Conf, Debug)]
pub struct ChatUserPolicy {
    /// Length of the counting window.
    #[conf(long, env, default_value = "60s", value_parser = humantime::parse_duration)]
    pub window: Duration,
    /// Inbound messages per window beyond which traffic is classified as spam.
    #[conf(long, env, default_value = "12")]
    pub max_messages: u32,
    /// Message count at which a warning fires (at most once per window).
    #[conf(long, env, default_value = "8")]
    pub warn_threshold: u32,
    /// Minimum interval between automatic replies to one chat user.
    #[conf(long, env, default_value = "60s", value_parser = humantime::parse_duration)]
    pub auto_reply_throttle: Duration,
}

impl Default for ChatUserPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_messages: 12,
            warn_threshold: 8,
            auto_reply_throttle: Duration::from_secs(60),
        }
    }
}

/// Concurrency policy for persistent real-time channels, keyed by client
/// address. Not time-windowed: a pure cap with release-on-disconnect.
#[derive(Clone, Conf, Debug)]
pub struct SocketPolicy {
    /// Maximum concurrently-open connections per client address.
    #[conf(long, env, default_value = "5")]
    pub max_connections: u32,
}

impl Default for SocketPolicy {
    fn default() -> Self {
        Self { max_connections: 5 }
    }
}

/// Top-level configuration for the admission-control subsystem.
#[derive(Clone, Conf, Debug)]
pub struct SentryConfig {
    /// Policy for general API traffic.
    #[conf(flatten, prefix)]
    pub api: ApiPolicy,
    /// Policy for authentication attempts.
    #[conf(flatten, prefix)]
    pub auth: AuthPolicy,
    /// Policy for outbound message sends.
    #[conf(flatten, prefix)]
    pub message: MessagePolicy,
    /// Policy for broadcast operations.
    #[conf(flatten, prefix)]
    pub broadcast: BroadcastPolicy,
    /// Spam policy for inbound chat-user traffic.
    #[conf(flatten, prefix)]
    pub chat_user: ChatUserPolicy,
    /// Concurrency policy for persistent channels.
    #[conf(flatten, prefix)]
    pub socket: SocketPolicy,
    /// Addresses exempt from all rate and block logic, as a JSON array.
    /// Example: `["10.0.0.1", "192.168.1.20"]`
    #[conf(long, env, value_parser = serde_json::from_str, default_value = "[]")]
    pub whitelist: Vec<String>,
    /// Blacklist duration applied when an administrative action provides none.
    #[conf(long, env, default_value = "24h", value_parser = humantime::parse_duration)]
    pub default_blacklist_duration: Duration,
    /// Interval between janitor sweeps of expired windows, blocks, and
    /// blacklist entries. A safety net for memory, not for correctness:
    /// every read path re-checks expiry itself.
    #[conf(long, env, default_value = "60s", value_parser = humantime::parse_duration)]
    pub sweep_interval: Duration,
}

impl SentryConfig {
    /// Validate every numeric policy value. Called before the subsystem is
    /// built, so a misconfigured category can never be discovered mid-request.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.api.rate_policy().validate("api")?;
        self.auth.rate_policy().validate("auth")?;
        self.message.rate_policy().validate("message")?;
        self.broadcast.rate_policy().validate("broadcast")?;

        if self.broadcast.max_recipients == 0 {
            return Err(ConfigError::ZeroRecipientCap);
        }
        if self.chat_user.window.is_zero() {
            return Err(ConfigError::ZeroWindow("chat-user"));
        }
        if self.chat_user.max_messages == 0 {
            return Err(ConfigError::ZeroMaxCount("chat-user"));
        }
        if self.chat_user.warn_threshold == 0 {
            return Err(ConfigError::ZeroWarnThreshold);
        }
        if self.chat_user.warn_threshold > self.chat_user.max_messages {
            return Err(ConfigError::WarnAboveMax {
                warn: self.chat_user.warn_threshold,
                max: self.chat_user.max_messages,
            });
        }
        if self.socket.max_connections == 0 {
            return Err(ConfigError::ZeroConnectionCap);
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroSweepInterval);
        }
        Ok(())
    }
}

impl Default for SentryConfig {
    fn default() -> Self {
        Self {
            api: Default::default(),
            auth: Default::default(),
            message: Default::default(),
            broadcast: Default::default(),
            chat_user: Default::default(),
            socket: Default::default(),
            whitelist: Vec::new(),
            default_blacklist_duration: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}
