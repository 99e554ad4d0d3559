//! Spam detection for inbound chat-user traffic.
//!
//! Classifies rather than rejects: the ingestion layer reads the verdict and
//! decides whether to suppress processing, send a warning, or promote the
//! identity to the blacklist. Counting reuses the ledger's window-reset
//! shape, with two extras on the record: a warn flag that fires at most once
//! per window, and an auto-reply stamp that throttles reply frequency
//! independently of the count.

use crate::{keyed::KeyedStore, policy::ChatUserPolicy, sentry::ledger::CounterRecord};
use serde::Serialize;
use std::sync::Mutex;

/// Build the composite key the detector (and blacklist promotion) uses for
/// one chat user within one session.
pub fn chat_user_key(session: &str, chat_user: &str) -> String {
    format!("{session}:{chat_user}")
}

/// Per chat-user state: the window counter plus warn/auto-reply bookkeeping.
#[derive(Debug, Default)]
struct SpamRecord {
    counter: CounterRecord,
    /// Whether the warn threshold already fired in the current window.
    warned: bool,
    /// When an automatic reply was last dispatched to this identity.
    /// Survives window resets: the throttle is independent of the count.
    last_auto_reply: Option<i64>,
}

/// What one observed message means for the sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpamVerdict {
    /// The sender exceeded the per-window message limit.
    pub is_spam: bool,
    /// The warn threshold was just crossed; fires at most once per window.
    pub should_warn: bool,
    /// Messages counted in the current window, including this one.
    pub message_count: u32,
    /// Whether an automatic reply may be sent (throttle elapsed or never sent).
    pub can_auto_reply: bool,
}

/// Per chat-user inbound-message counter with warn and auto-reply layers.
#[derive(Debug)]
pub struct SpamDetector {
    policy: ChatUserPolicy,
    records: KeyedStore<Mutex<SpamRecord>>,
}

impl SpamDetector {
    /// Create an empty detector governed by `policy`.
    pub fn new(policy: ChatUserPolicy) -> Self {
        Self {
            policy,
            records: KeyedStore::new(),
        }
    }

    /// Count one inbound message from `chat_user` at `now_ms` and classify.
    ///
    /// The detector only reports; whether to warn, reply, or blacklist is the
    /// caller's decision. `should_warn` is consumed by this call: a given
    /// window warns at most once.
    pub fn observe_at(&self, session: &str, chat_user: &str, now_ms: i64) -> SpamVerdict {
        let window_ms = self.policy.window.as_millis() as i64;
        let throttle_ms = self.policy.auto_reply_throttle.as_millis() as i64;

        self.records.get(&chat_user_key(session, chat_user), |cell| {
            let mut rec = cell.lock().unwrap();

            if rec
                .counter
                .window_start
                .is_some_and(|start| now_ms - start > window_ms)
            {
                // New window, new warning
                rec.counter = CounterRecord::default();
                rec.warned = false;
            }
            rec.counter.bump(now_ms);

            let is_spam = rec.counter.count > self.policy.max_messages;
            let should_warn = rec.counter.count >= self.policy.warn_threshold && !rec.warned;
            if should_warn {
                rec.warned = true;
            }
            let can_auto_reply = rec
                .last_auto_reply
                .is_none_or(|t| now_ms - t > throttle_ms);

            SpamVerdict {
                is_spam,
                should_warn,
                message_count: rec.counter.count,
                can_auto_reply,
            }
        })
    }

    /// Record that an automatic reply was just sent to `chat_user`.
    ///
    /// A separate call so the caller decides, after inspecting the verdict,
    /// whether to actually emit a reply. A no-op if the identity has never
    /// been observed.
    pub fn mark_auto_reply_sent_at(&self, session: &str, chat_user: &str, now_ms: i64) {
        self.records
            .peek(&chat_user_key(session, chat_user), |cell| {
                cell.lock().unwrap().last_auto_reply = Some(now_ms);
            });
    }

    /// Evict records with no live window and no recent auto-reply stamp.
    /// Returns how many were evicted.
    pub fn sweep_at(&self, now_ms: i64) -> usize {
        let window_ms = self.policy.window.as_millis() as i64;
        let throttle_ms = self.policy.auto_reply_throttle.as_millis() as i64;
        let before = self.records.len();
        let after = self.records.retain(|_key, cell| {
            let rec = cell.lock().unwrap();
            rec.counter.is_live(now_ms, window_ms)
                || rec.last_auto_reply.is_some_and(|t| now_ms - t <= throttle_ms)
        });
        before.saturating_sub(after)
    }

    /// Drop every record. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        self.records.clear()
    }

    /// Number of chat-user identities currently tracked.
    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn detector() -> SpamDetector {
        SpamDetector::new(ChatUserPolicy {
            window: Duration::from_millis(60_000),
            max_messages: 10,
            warn_threshold: 5,
            auto_reply_throttle: Duration::from_millis(30_000),
        })
    }

    #[test]
    fn test_spam_classification_past_limit() {
        let det = detector();

        for i in 1..=10 {
            let verdict = det.observe_at("s1", "u1", i);
            assert!(!verdict.is_spam, "message {i} is under the limit");
            assert_eq!(verdict.message_count, i as u32);
        }

        let verdict = det.observe_at("s1", "u1", 11);
        assert!(verdict.is_spam);
        assert_eq!(verdict.message_count, 11);
    }

    #[test]
    fn test_warn_fires_exactly_once_per_window() {
        let det = detector();

        let mut warns = 0;
        for i in 1..=55 {
            if det.observe_at("s1", "u1", i).should_warn {
                warns += 1;
            }
        }
        assert_eq!(warns, 1, "warn fires once despite 50 calls past threshold");

        // A lapsed window re-arms the warning
        let mut warned_again = false;
        for i in 0..5 {
            if det.observe_at("s1", "u1", 100_000 + i).should_warn {
                warned_again = true;
            }
        }
        assert!(warned_again);
    }

    #[test]
    fn test_warn_fires_at_threshold() {
        let det = detector();

        for i in 1..=4 {
            assert!(!det.observe_at("s1", "u1", i).should_warn);
        }
        assert!(det.observe_at("s1", "u1", 5).should_warn);
        assert!(!det.observe_at("s1", "u1", 6).should_warn);
    }

    #[test]
    fn test_auto_reply_throttle() {
        let det = detector();

        assert!(det.observe_at("s1", "u1", 0).can_auto_reply);
        det.mark_auto_reply_sent_at("s1", "u1", 0);

        // Within the throttle interval
        assert!(!det.observe_at("s1", "u1", 10_000).can_auto_reply);
        assert!(!det.observe_at("s1", "u1", 30_000).can_auto_reply);

        // Past it
        assert!(det.observe_at("s1", "u1", 30_001).can_auto_reply);
    }

    #[test]
    fn test_throttle_survives_window_reset() {
        let det = detector();

        det.observe_at("s1", "u1", 0);
        det.mark_auto_reply_sent_at("s1", "u1", 59_999);

        // New window at t=70000, but the reply stamp is only 10s old
        let verdict = det.observe_at("s1", "u1", 70_000);
        assert_eq!(verdict.message_count, 1);
        assert!(!verdict.can_auto_reply);
    }

    #[test]
    fn test_mark_auto_reply_on_unknown_identity_is_noop() {
        let det = detector();
        det.mark_auto_reply_sent_at("s1", "never-seen", 0);
        assert_eq!(det.len(), 0);
    }

    #[test]
    fn test_sessions_and_users_are_independent() {
        let det = detector();

        for i in 1..=11 {
            det.observe_at("s1", "u1", i);
        }
        assert!(det.observe_at("s1", "u1", 12).is_spam);
        assert!(!det.observe_at("s2", "u1", 12).is_spam);
        assert!(!det.observe_at("s1", "u2", 12).is_spam);
    }

    #[test]
    fn test_sweep_keeps_recent_reply_stamps() {
        let det = detector();

        det.observe_at("s1", "idle", 0);
        det.observe_at("s1", "replied", 0);
        det.mark_auto_reply_sent_at("s1", "replied", 65_000);
        det.observe_at("s1", "active", 80_000);

        // At t=90000: "idle" has a lapsed window and no stamp; "replied" has
        // a lapsed window but a 25s-old stamp; "active" has a live window.
        assert_eq!(det.sweep_at(90_000), 1);
        assert_eq!(det.len(), 2);
    }
}
