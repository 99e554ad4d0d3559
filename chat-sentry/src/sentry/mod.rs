//! The admission-control subsystem for a chat-automation dashboard.
//!
//! [`Sentry`] owns every piece of admission state: per-category rate-limit
//! ledgers, the spam detector, the blacklist/whitelist, and the persistent
//! connection gate. One instance is constructed from a validated
//! [`SentryConfig`] at process start and injected into the request,
//! handshake, and ingestion layers; there are no module-level singletons.
//!
//! Every check follows the same ordering contract: blacklist first (it is
//! authoritative, and whitelist membership cannot override it), whitelist
//! second, the category's windowed policy last. All decisions are synchronous
//! computations over in-memory state; nothing here suspends or performs I/O.

use crate::{
    human_duration::HumanMillis,
    policy::{ConfigError, SentryConfig},
};
use chrono::Utc;
use serde::Serialize;
use std::{fmt, time::Duration};
use tracing::{debug, info};

mod access_list;
mod broadcast;
mod connection;
mod ledger;
mod spam;

pub mod janitor;

pub use access_list::{AccessList, BlacklistEntry, BlacklistInfoEntry};
pub use broadcast::{BroadcastGuard, BroadcastOutcome};
pub use connection::ConnectionGate;
pub use ledger::{AdmissionLedger, CounterRecord, Verdict};
pub use spam::{SpamDetector, SpamVerdict, chat_user_key};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Why a unit of work was denied. Each variant carries a stable
/// machine-readable code (see [`Denial::code`]) so clients can implement
/// backoff without parsing prose.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Denial {
    /// The identity is blacklisted, manually or by spam promotion.
    Blacklisted {
        /// The reason recorded on the blacklist entry.
        reason: String,
    },
    /// The identity exhausted a rate window and is locked out.
    RateLimited {
        /// How long until the lockout clears.
        retry_after_ms: i64,
    },
    /// The session exhausted its broadcast window and is locked out.
    BroadcastLimited {
        /// How long until the lockout clears.
        retry_after_ms: i64,
    },
    /// The broadcast recipient list exceeds the static cap.
    TooManyRecipients {
        /// The configured cap.
        max: u32,
        /// What the caller asked for.
        requested: u32,
    },
    /// The address is at its concurrent-connection cap.
    TooManyConnections {
        /// The configured cap.
        max: u32,
    },
}

impl Denial {
    /// The stable machine-readable code for this denial.
    pub fn code(&self) -> &'static str {
        match self {
            Denial::Blacklisted { .. } => "IP_BLACKLISTED",
            Denial::RateLimited { .. } => "RATE_LIMITED",
            Denial::BroadcastLimited { .. } => "BROADCAST_LIMITED",
            Denial::TooManyRecipients { .. } => "TOO_MANY_RECIPIENTS",
            Denial::TooManyConnections { .. } => "TOO_MANY_CONNECTIONS",
        }
    }

    /// Retry hint in whole seconds (rounded up), where applicable.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Denial::RateLimited { retry_after_ms } | Denial::BroadcastLimited { retry_after_ms } => {
                Some(((*retry_after_ms).max(0) as u64 + 999) / 1000)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denial::Blacklisted { reason } => write!(f, "identity is blacklisted: {reason}"),
            Denial::RateLimited { retry_after_ms } => {
                write!(f, "rate limit exceeded, retry in {}", HumanMillis(*retry_after_ms))
            }
            Denial::BroadcastLimited { retry_after_ms } => {
                write!(
                    f,
                    "broadcast limit exceeded, retry in {}",
                    HumanMillis(*retry_after_ms)
                )
            }
            Denial::TooManyRecipients { max, requested } => {
                write!(f, "too many recipients: {requested} exceeds the cap of {max}")
            }
            Denial::TooManyConnections { max } => {
                write!(f, "too many concurrent connections (cap {max})")
            }
        }
    }
}

/// Quota metadata attached to an allowed unit of work, for observability
/// headers on the caller's side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Clearance {
    /// Units left in the current window.
    pub remaining: u32,
    /// Timestamp at which the current window lapses.
    pub resets_at_ms: i64,
}

/// Clearance for a broadcast, with the pacing delay the caller should apply
/// between per-recipient sends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BroadcastClearance {
    /// Broadcast operations left in the current window.
    pub remaining: u32,
    /// Timestamp at which the current window lapses.
    pub resets_at_ms: i64,
    /// Suggested delay between per-recipient sends.
    pub per_message_delay: Duration,
}

/// Tracked-key counts per category plus access-list sizes, for operator
/// dashboards.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SentryStats {
    /// Keys tracked by the API ledger.
    pub api_tracked: usize,
    /// Keys tracked by the auth ledger.
    pub auth_tracked: usize,
    /// Keys tracked by the message ledger.
    pub message_tracked: usize,
    /// Sessions tracked by the broadcast guard.
    pub broadcast_tracked: usize,
    /// Chat-user identities tracked by the spam detector.
    pub chat_user_tracked: usize,
    /// Addresses with at least one open persistent connection.
    pub connection_identities: usize,
    /// Total open persistent connections.
    pub open_connections: usize,
    /// Blacklist entries (including any expired but not yet evicted).
    pub blacklist_entries: usize,
    /// Whitelisted addresses.
    pub whitelist_entries: usize,
}

/// What one janitor sweep evicted, per area.
#[derive(Clone, Copy, Debug, Default)]
pub struct SweepReport {
    /// Idle records evicted from the API ledger.
    pub api: usize,
    /// Idle records evicted from the auth ledger.
    pub auth: usize,
    /// Idle records evicted from the message ledger.
    pub message: usize,
    /// Idle session records evicted from the broadcast guard.
    pub broadcast: usize,
    /// Idle records evicted from the spam detector.
    pub chat_user: usize,
    /// Expired blacklist entries evicted.
    pub blacklist: usize,
}

impl SweepReport {
    /// Total evictions across all areas.
    pub fn total(&self) -> usize {
        self.api + self.auth + self.message + self.broadcast + self.chat_user + self.blacklist
    }
}

/// The admission-control subsystem. See the module docs for the ordering
/// contract every check follows.
pub struct Sentry {
    config: SentryConfig,
    access: AccessList,
    api: AdmissionLedger,
    auth: AdmissionLedger,
    message: AdmissionLedger,
    broadcast: BroadcastGuard,
    spam: SpamDetector,
    connections: ConnectionGate,
}

impl Sentry {
    /// Build the subsystem from a validated configuration.
    ///
    /// Fails (and should abort startup) on any invalid policy value; a bad
    /// policy must never be discoverable at request time.
    pub fn new(config: SentryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            access: AccessList::new(config.whitelist.iter().cloned()),
            api: AdmissionLedger::new(config.api.rate_policy()),
            auth: AdmissionLedger::new(config.auth.rate_policy()),
            message: AdmissionLedger::new(config.message.rate_policy()),
            broadcast: BroadcastGuard::new(&config.broadcast),
            spam: SpamDetector::new(config.chat_user.clone()),
            connections: ConnectionGate::new(config.socket.max_connections as usize),
            config,
        })
    }

    /// Blacklist check, whitelist check, then the given ledger.
    fn gate_at(&self, ledger: &AdmissionLedger, key: &str, now_ms: i64) -> Result<Clearance, Denial> {
        if let Some(reason) = self.access.blacklisted_at(key, now_ms) {
            debug!("Denied blacklisted identity {key}");
            return Err(Denial::Blacklisted { reason });
        }
        if self.access.is_whitelisted(key) {
            return Ok(Clearance {
                remaining: ledger.policy().max_count,
                resets_at_ms: now_ms + ledger.policy().window_ms(),
            });
        }
        match ledger.check_at(key, now_ms) {
            Verdict::Allowed {
                remaining,
                resets_at_ms,
            } => Ok(Clearance {
                remaining,
                resets_at_ms,
            }),
            Verdict::Blocked { retry_after_ms } => {
                debug!("Rate limited {key}, retry in {}", HumanMillis(retry_after_ms));
                Err(Denial::RateLimited { retry_after_ms })
            }
        }
    }

    /// Admit one API request from `key`.
    pub fn check_api(&self, key: &str) -> Result<Clearance, Denial> {
        self.check_api_at(key, now_ms())
    }

    /// Admit one API request from `key` at an explicit time.
    pub fn check_api_at(&self, key: &str, now_ms: i64) -> Result<Clearance, Denial> {
        self.gate_at(&self.api, key, now_ms)
    }

    /// Admit one authentication attempt from `key`.
    pub fn check_auth(&self, key: &str) -> Result<Clearance, Denial> {
        self.check_auth_at(key, now_ms())
    }

    /// Admit one authentication attempt from `key` at an explicit time.
    pub fn check_auth_at(&self, key: &str, now_ms: i64) -> Result<Clearance, Denial> {
        self.gate_at(&self.auth, key, now_ms)
    }

    /// Admit one outbound message send for `session`.
    pub fn check_message(&self, session: &str) -> Result<Clearance, Denial> {
        self.check_message_at(session, now_ms())
    }

    /// Admit one outbound message send for `session` at an explicit time.
    pub fn check_message_at(&self, session: &str, now_ms: i64) -> Result<Clearance, Denial> {
        self.gate_at(&self.message, session, now_ms)
    }

    /// Admit one broadcast of `recipient_count` recipients for `session`.
    pub fn check_broadcast(
        &self,
        session: &str,
        recipient_count: u32,
    ) -> Result<BroadcastClearance, Denial> {
        self.check_broadcast_at(session, recipient_count, now_ms())
    }

    /// Admit one broadcast for `session` at an explicit time.
    ///
    /// The recipient cap applies even to whitelisted sessions: an oversized
    /// recipient list is a caller input error, not a rate condition.
    pub fn check_broadcast_at(
        &self,
        session: &str,
        recipient_count: u32,
        now_ms: i64,
    ) -> Result<BroadcastClearance, Denial> {
        if let Some(reason) = self.access.blacklisted_at(session, now_ms) {
            return Err(Denial::Blacklisted { reason });
        }
        if recipient_count > self.broadcast.max_recipients() {
            return Err(Denial::TooManyRecipients {
                max: self.broadcast.max_recipients(),
                requested: recipient_count,
            });
        }
        if self.access.is_whitelisted(session) {
            return Ok(BroadcastClearance {
                remaining: self.config.broadcast.max_count,
                resets_at_ms: now_ms + self.config.broadcast.window.as_millis() as i64,
                per_message_delay: self.broadcast.per_message_delay(),
            });
        }
        match self.broadcast.check_at(session, recipient_count, now_ms) {
            BroadcastOutcome::Cleared {
                remaining,
                resets_at_ms,
                per_message_delay,
            } => Ok(BroadcastClearance {
                remaining,
                resets_at_ms,
                per_message_delay,
            }),
            BroadcastOutcome::TooManyRecipients { max, requested } => {
                Err(Denial::TooManyRecipients { max, requested })
            }
            BroadcastOutcome::Limited { retry_after_ms } => {
                debug!(
                    "Broadcast limited {session}, retry in {}",
                    HumanMillis(retry_after_ms)
                );
                Err(Denial::BroadcastLimited { retry_after_ms })
            }
        }
    }

    /// Classify one inbound message from `chat_user` within `session`.
    ///
    /// Never rejects the transport; the ingestion layer decides what to do
    /// with the verdict, including promotion to the blacklist via
    /// [`Sentry::blacklist`] with [`chat_user_key`].
    pub fn observe_chat_user(&self, session: &str, chat_user: &str) -> SpamVerdict {
        self.observe_chat_user_at(session, chat_user, now_ms())
    }

    /// Classify one inbound chat-user message at an explicit time.
    pub fn observe_chat_user_at(&self, session: &str, chat_user: &str, now_ms: i64) -> SpamVerdict {
        self.spam.observe_at(session, chat_user, now_ms)
    }

    /// Record that an automatic reply was just sent to `chat_user`.
    pub fn mark_auto_reply_sent(&self, session: &str, chat_user: &str) {
        self.mark_auto_reply_sent_at(session, chat_user, now_ms())
    }

    /// Record an automatic reply at an explicit time.
    pub fn mark_auto_reply_sent_at(&self, session: &str, chat_user: &str, now_ms: i64) {
        self.spam.mark_auto_reply_sent_at(session, chat_user, now_ms)
    }

    /// Admit a new persistent connection `connection_id` from `addr`.
    ///
    /// On success the connection is tracked until
    /// [`Sentry::release_connection`] is called from the disconnect hook.
    pub fn admit_connection(&self, addr: &str, connection_id: &str) -> Result<(), Denial> {
        self.admit_connection_at(addr, connection_id, now_ms())
    }

    /// Admit a persistent connection at an explicit time.
    pub fn admit_connection_at(
        &self,
        addr: &str,
        connection_id: &str,
        now_ms: i64,
    ) -> Result<(), Denial> {
        if let Some(reason) = self.access.blacklisted_at(addr, now_ms) {
            debug!("Refused connection from blacklisted {addr}");
            return Err(Denial::Blacklisted { reason });
        }
        if self.access.is_whitelisted(addr) {
            self.connections.force_admit(addr, connection_id);
            return Ok(());
        }
        if self.connections.try_admit(addr, connection_id) {
            Ok(())
        } else {
            debug!("Refused connection from {addr}: at cap");
            Err(Denial::TooManyConnections {
                max: self.connections.max_per_identity() as u32,
            })
        }
    }

    /// Release a persistent connection on disconnect.
    pub fn release_connection(&self, addr: &str, connection_id: &str) {
        self.connections.release(addr, connection_id)
    }

    /// Whether `key` is currently blacklisted.
    pub fn is_blacklisted(&self, key: &str) -> bool {
        self.access.is_blacklisted_at(key, now_ms())
    }

    /// Whether `key` is blacklisted at an explicit time.
    pub fn is_blacklisted_at(&self, key: &str, now_ms: i64) -> bool {
        self.access.is_blacklisted_at(key, now_ms)
    }

    /// Blacklist `key`. `duration: None` makes the entry permanent.
    ///
    /// Works for network addresses and for composite chat-user identities
    /// (see [`chat_user_key`]), so spam promotion is one call.
    pub fn blacklist(&self, key: &str, reason: &str, duration: Option<Duration>) {
        self.blacklist_at(key, reason, duration, now_ms())
    }

    /// Blacklist `key` at an explicit time.
    pub fn blacklist_at(&self, key: &str, reason: &str, duration: Option<Duration>, now_ms: i64) {
        self.access.blacklist_at(key, reason, duration, now_ms)
    }

    /// Remove `key` from the blacklist. A no-op if absent.
    pub fn unblacklist(&self, key: &str) -> bool {
        self.access.unblacklist(key)
    }

    /// Exempt `key` from all rate and block logic.
    pub fn whitelist(&self, key: &str) -> bool {
        self.access.whitelist(key)
    }

    /// Remove `key` from the whitelist. A no-op if absent.
    pub fn unwhitelist(&self, key: &str) -> bool {
        self.access.unwhitelist(key)
    }

    /// Enumerate the blacklist with remaining time, for operator tooling.
    pub fn blacklist_info(&self) -> Vec<BlacklistInfoEntry> {
        self.blacklist_info_at(now_ms())
    }

    /// Enumerate the blacklist at an explicit time.
    pub fn blacklist_info_at(&self, now_ms: i64) -> Vec<BlacklistInfoEntry> {
        self.access.info_at(now_ms)
    }

    /// Tracked-key counts per category plus access-list sizes.
    pub fn stats(&self) -> SentryStats {
        SentryStats {
            api_tracked: self.api.len(),
            auth_tracked: self.auth.len(),
            message_tracked: self.message.len(),
            broadcast_tracked: self.broadcast.len(),
            chat_user_tracked: self.spam.len(),
            connection_identities: self.connections.tracked_identities(),
            open_connections: self.connections.open_connections(),
            blacklist_entries: self.access.blacklist_len(),
            whitelist_entries: self.access.whitelist_len(),
        }
    }

    /// Reset every rate-limit ledger and the spam detector. The access lists
    /// and open-connection tracking are untouched: bans are administrative
    /// state, and open connections are real.
    ///
    /// An operator escape hatch, not part of normal request flow. Returns how
    /// many records were dropped.
    pub fn clear_all_limits(&self) -> usize {
        let dropped = self.api.clear()
            + self.auth.clear()
            + self.message.clear()
            + self.broadcast.clear()
            + self.spam.clear();
        info!("Cleared all rate limits ({dropped} records dropped)");
        dropped
    }

    /// Evict expired windows, blocks, spam records, and blacklist entries.
    ///
    /// A memory safety net only: every read path re-checks expiry itself, so
    /// this never changes externally observable decisions.
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(now_ms())
    }

    /// Sweep at an explicit time.
    pub fn sweep_at(&self, now_ms: i64) -> SweepReport {
        SweepReport {
            api: self.api.sweep_at(now_ms),
            auth: self.auth.sweep_at(now_ms),
            message: self.message.sweep_at(now_ms),
            broadcast: self.broadcast.sweep_at(now_ms),
            chat_user: self.spam.sweep_at(now_ms),
            blacklist: self.access.sweep_at(now_ms),
        }
    }

    /// The blacklist duration to apply when an admin action provides none.
    pub fn default_blacklist_duration(&self) -> Duration {
        self.config.default_blacklist_duration
    }

    /// The configured janitor sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        self.config.sweep_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::SentryConfig;

    fn sentry() -> Sentry {
        Sentry::new(SentryConfig::default()).unwrap()
    }

    #[test]
    fn test_blacklist_short_circuits_all_categories() {
        let s = sentry();
        s.blacklist_at("1.2.3.4", "manual", None, 0);

        assert!(matches!(
            s.check_api_at("1.2.3.4", 10),
            Err(Denial::Blacklisted { .. })
        ));
        assert!(matches!(
            s.check_auth_at("1.2.3.4", 10),
            Err(Denial::Blacklisted { .. })
        ));
        assert!(matches!(
            s.check_message_at("1.2.3.4", 10),
            Err(Denial::Blacklisted { .. })
        ));
        assert!(matches!(
            s.check_broadcast_at("1.2.3.4", 1, 10),
            Err(Denial::Blacklisted { .. })
        ));
        assert!(matches!(
            s.admit_connection_at("1.2.3.4", "c1", 10),
            Err(Denial::Blacklisted { .. })
        ));
    }

    #[test]
    fn test_blacklist_wins_over_whitelist() {
        let s = sentry();
        s.whitelist("1.2.3.4");
        s.blacklist_at("1.2.3.4", "compromised", None, 0);

        assert!(matches!(
            s.check_api_at("1.2.3.4", 10),
            Err(Denial::Blacklisted { .. })
        ));

        // Once unblacklisted, whitelist membership applies again
        s.unblacklist("1.2.3.4");
        assert!(s.check_api_at("1.2.3.4", 20).is_ok());
    }

    #[test]
    fn test_whitelist_bypasses_rate_limits() {
        let s = sentry();
        s.whitelist("10.0.0.1");

        // Far beyond the auth policy's max count of 5
        for i in 0..1_000 {
            let clearance = s.check_auth_at("10.0.0.1", i).unwrap();
            assert_eq!(clearance.remaining, 5);
        }
        // And nothing was tracked for the whitelisted key
        assert_eq!(s.stats().auth_tracked, 0);
    }

    #[test]
    fn test_denial_codes_are_stable() {
        assert_eq!(
            Denial::Blacklisted {
                reason: "x".into()
            }
            .code(),
            "IP_BLACKLISTED"
        );
        assert_eq!(Denial::RateLimited { retry_after_ms: 1 }.code(), "RATE_LIMITED");
        assert_eq!(
            Denial::BroadcastLimited { retry_after_ms: 1 }.code(),
            "BROADCAST_LIMITED"
        );
        assert_eq!(
            Denial::TooManyRecipients { max: 1, requested: 2 }.code(),
            "TOO_MANY_RECIPIENTS"
        );
        assert_eq!(
            Denial::TooManyConnections { max: 1 }.code(),
            "TOO_MANY_CONNECTIONS"
        );
    }

    #[test]
    fn test_retry_after_rounds_up_to_seconds() {
        assert_eq!(
            Denial::RateLimited {
                retry_after_ms: 1_001
            }
            .retry_after_secs(),
            Some(2)
        );
        assert_eq!(
            Denial::RateLimited { retry_after_ms: 999 }.retry_after_secs(),
            Some(1)
        );
        assert_eq!(
            Denial::Blacklisted { reason: "x".into() }.retry_after_secs(),
            None
        );
    }

    #[test]
    fn test_recipient_cap_applies_to_whitelisted_sessions() {
        let s = sentry();
        s.whitelist("vip-session");

        assert!(matches!(
            s.check_broadcast_at("vip-session", 501, 0),
            Err(Denial::TooManyRecipients {
                max: 500,
                requested: 501
            })
        ));
        assert!(s.check_broadcast_at("vip-session", 500, 0).is_ok());
    }

    #[test]
    fn test_connection_cap_and_stats() {
        let s = sentry();

        for i in 0..5 {
            s.admit_connection_at("1.2.3.4", &format!("c{i}"), 0).unwrap();
        }
        assert!(matches!(
            s.admit_connection_at("1.2.3.4", "c5", 0),
            Err(Denial::TooManyConnections { max: 5 })
        ));

        // One release frees one slot
        s.release_connection("1.2.3.4", "c0");
        s.admit_connection_at("1.2.3.4", "c5", 0).unwrap();

        let stats = s.stats();
        assert_eq!(stats.connection_identities, 1);
        assert_eq!(stats.open_connections, 5);

        for i in 1..6 {
            s.release_connection("1.2.3.4", &format!("c{i}"));
        }
        assert_eq!(s.stats().connection_identities, 0);
    }

    #[test]
    fn test_clear_all_limits_spares_access_lists() {
        let s = sentry();

        s.check_api_at("a", 0).unwrap();
        s.check_auth_at("b", 0).unwrap();
        s.observe_chat_user_at("s", "u", 0);
        s.blacklist_at("banned", "spam", None, 0);

        let dropped = s.clear_all_limits();
        assert_eq!(dropped, 3);

        let stats = s.stats();
        assert_eq!(stats.api_tracked, 0);
        assert_eq!(stats.auth_tracked, 0);
        assert_eq!(stats.chat_user_tracked, 0);
        assert_eq!(stats.blacklist_entries, 1);
    }

    #[test]
    fn test_sweep_report_totals() {
        let s = sentry();

        s.check_api_at("a", 0).unwrap();
        s.check_auth_at("b", 0).unwrap();
        s.blacklist_at("c", "spam", Some(Duration::from_secs(1)), 0);

        // Far past every window and the blacklist expiry
        let report = s.sweep_at(100_000_000);
        assert_eq!(report.api, 1);
        assert_eq!(report.auth, 1);
        assert_eq!(report.blacklist, 1);
        assert_eq!(report.total(), 3);
    }
}
