//! Broadcast admission: a windowed operation count plus a static recipient cap.
//!
//! The recipient cap is checked first and rejects on payload shape alone,
//! without consuming a unit of the window. On success the caller receives the
//! configured per-recipient pacing delay; pacing itself is the caller's job.

use crate::{
    policy::BroadcastPolicy,
    sentry::ledger::{AdmissionLedger, Verdict},
};
use std::time::Duration;

/// Result of a broadcast admission check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BroadcastOutcome {
    /// The operation may proceed. The caller should wait `per_message_delay`
    /// between per-recipient sends.
    Cleared {
        /// Broadcast operations left in the current window.
        remaining: u32,
        /// Timestamp at which the current window lapses.
        resets_at_ms: i64,
        /// Suggested delay between per-recipient sends.
        per_message_delay: Duration,
    },
    /// The recipient list is too large. No window unit was consumed.
    TooManyRecipients {
        /// The configured cap.
        max: u32,
        /// What the caller asked for.
        requested: u32,
    },
    /// The session exhausted its broadcast window and is locked out.
    Limited {
        /// How long until the lockout clears.
        retry_after_ms: i64,
    },
}

/// Gate for broadcast-send operations, keyed by the originating session.
#[derive(Debug)]
pub struct BroadcastGuard {
    ledger: AdmissionLedger,
    max_recipients: u32,
    per_message_delay: Duration,
}

impl BroadcastGuard {
    /// Create an empty guard governed by `policy`.
    pub fn new(policy: &BroadcastPolicy) -> Self {
        Self {
            ledger: AdmissionLedger::new(policy.rate_policy()),
            max_recipients: policy.max_recipients,
            per_message_delay: policy.per_message_delay,
        }
    }

    /// Decide whether `session` may broadcast to `recipient_count` recipients
    /// at `now_ms`.
    pub fn check_at(&self, session: &str, recipient_count: u32, now_ms: i64) -> BroadcastOutcome {
        // Payload-shape rejection comes first and never touches the window
        if recipient_count > self.max_recipients {
            return BroadcastOutcome::TooManyRecipients {
                max: self.max_recipients,
                requested: recipient_count,
            };
        }

        match self.ledger.check_at(session, now_ms) {
            Verdict::Allowed {
                remaining,
                resets_at_ms,
            } => BroadcastOutcome::Cleared {
                remaining,
                resets_at_ms,
                per_message_delay: self.per_message_delay,
            },
            Verdict::Blocked { retry_after_ms } => BroadcastOutcome::Limited { retry_after_ms },
        }
    }

    /// The configured per-recipient pacing delay.
    pub fn per_message_delay(&self) -> Duration {
        self.per_message_delay
    }

    /// The configured recipient cap.
    pub fn max_recipients(&self) -> u32 {
        self.max_recipients
    }

    /// Evict idle session records. Returns how many were evicted.
    pub fn sweep_at(&self, now_ms: i64) -> usize {
        self.ledger.sweep_at(now_ms)
    }

    /// Drop every session record. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        self.ledger.clear()
    }

    /// Number of sessions currently tracked.
    pub fn len(&self) -> usize {
        self.ledger.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> BroadcastGuard {
        BroadcastGuard::new(&BroadcastPolicy {
            window: Duration::from_millis(60_000),
            max_count: 2,
            block_duration: Duration::from_millis(120_000),
            max_recipients: 500,
            per_message_delay: Duration::from_secs(3),
        })
    }

    #[test]
    fn test_recipient_cap_rejects_without_consuming_quota() {
        let g = guard();

        assert_eq!(
            g.check_at("s1", 501, 0),
            BroadcastOutcome::TooManyRecipients {
                max: 500,
                requested: 501
            }
        );

        // The rejection above consumed nothing: full quota remains
        assert_eq!(
            g.check_at("s1", 500, 10),
            BroadcastOutcome::Cleared {
                remaining: 1,
                resets_at_ms: 60_010,
                per_message_delay: Duration::from_secs(3),
            }
        );
    }

    #[test]
    fn test_window_limit_after_cap_passes() {
        let g = guard();

        assert!(matches!(
            g.check_at("s1", 10, 0),
            BroadcastOutcome::Cleared { remaining: 1, .. }
        ));
        assert!(matches!(
            g.check_at("s1", 10, 100),
            BroadcastOutcome::Cleared { remaining: 0, .. }
        ));
        assert_eq!(
            g.check_at("s1", 10, 200),
            BroadcastOutcome::Limited {
                retry_after_ms: 120_000
            }
        );

        // While locked out, an oversized payload still reports the cap error
        assert!(matches!(
            g.check_at("s1", 501, 300),
            BroadcastOutcome::TooManyRecipients { .. }
        ));
    }

    #[test]
    fn test_sessions_are_independent() {
        let g = guard();

        g.check_at("s1", 10, 0);
        g.check_at("s1", 10, 1);
        assert!(matches!(
            g.check_at("s1", 10, 2),
            BroadcastOutcome::Limited { .. }
        ));
        assert!(matches!(
            g.check_at("s2", 10, 2),
            BroadcastOutcome::Cleared { .. }
        ));
        assert_eq!(g.len(), 2);
    }
}
