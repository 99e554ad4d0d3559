//! Keyed admission ledger with fixed-window-plus-block semantics.
//!
//! Each key accumulates a count over a fixed window. Exceeding the policy's
//! max count engages a block for the configured duration; while blocked, the
//! count does not grow. Expiry of either the window or the block is detected
//! on the read path itself, so correctness never depends on the janitor.

use crate::{keyed::KeyedStore, policy::RatePolicy};
use std::sync::Mutex;

/// Per-key admission state.
///
/// If `blocked_until` is set and in the future, the key is blocked regardless
/// of `count`. Once it elapses, block and counter are cleared together before
/// any new counting. A record that has never been seen behaves identically to
/// one freshly reset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterRecord {
    /// Units counted in the current window.
    pub count: u32,
    /// When the current window began; absent until the first unit arrives.
    pub window_start: Option<i64>,
    /// Lockout deadline; absent unless the window count was exceeded.
    pub blocked_until: Option<i64>,
}

impl CounterRecord {
    /// Reset the record if its window has lapsed. The block is only cleared
    /// here as part of the full reset; an unexpired block is handled by the
    /// caller before this runs.
    pub(crate) fn roll_window(&mut self, now_ms: i64, window_ms: i64) {
        if let Some(start) = self.window_start {
            if now_ms - start > window_ms {
                *self = CounterRecord::default();
            }
        }
    }

    /// Start the window if absent, then count one unit. Returns the window
    /// start in effect.
    pub(crate) fn bump(&mut self, now_ms: i64) -> i64 {
        let start = *self.window_start.get_or_insert(now_ms);
        self.count += 1;
        start
    }

    /// Whether this record still holds live state at `now_ms`: an unexpired
    /// block, or an unexpired window.
    pub(crate) fn is_live(&self, now_ms: i64, window_ms: i64) -> bool {
        if let Some(until) = self.blocked_until {
            return now_ms < until;
        }
        match self.window_start {
            Some(start) => now_ms - start <= window_ms,
            None => false,
        }
    }
}

/// Result of an admission check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The unit was admitted. `remaining` is the quota left in this window,
    /// `resets_at_ms` when the window lapses.
    Allowed {
        /// Units left in the current window.
        remaining: u32,
        /// Timestamp at which the current window lapses.
        resets_at_ms: i64,
    },
    /// The unit was rejected; the key is locked out for `retry_after_ms`.
    Blocked {
        /// How long until the lockout clears.
        retry_after_ms: i64,
    },
}

impl Verdict {
    /// True when the unit was admitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed { .. })
    }
}

/// A keyed counter store governed by one [`RatePolicy`].
///
/// Every rate-limited category owns one of these; key spaces are independent
/// across categories. The read-modify-write of a check runs under the
/// record's own mutex, so concurrent checks for one key serialize while
/// different keys proceed in parallel.
#[derive(Debug)]
pub struct AdmissionLedger {
    policy: RatePolicy,
    records: KeyedStore<Mutex<CounterRecord>>,
}

impl AdmissionLedger {
    /// Create an empty ledger governed by `policy`.
    pub fn new(policy: RatePolicy) -> Self {
        Self {
            policy,
            records: KeyedStore::new(),
        }
    }

    /// The policy governing this ledger.
    pub fn policy(&self) -> &RatePolicy {
        &self.policy
    }

    /// Count one unit of work for `key` at `now_ms` and decide admission.
    ///
    /// Exactly `max_count` units succeed per window; the overflowing unit is
    /// itself rejected and engages the block. While blocked, the count does
    /// not grow and `retry_after_ms` shrinks toward zero.
    pub fn check_at(&self, key: &str, now_ms: i64) -> Verdict {
        let window_ms = self.policy.window_ms();
        self.records.get(key, |cell| {
            let mut rec = cell.lock().unwrap();

            if let Some(until) = rec.blocked_until {
                if now_ms < until {
                    return Verdict::Blocked {
                        retry_after_ms: until - now_ms,
                    };
                }
                // Lapsed block: clear block and counter together so counting
                // resumes from a fresh window.
                *rec = CounterRecord::default();
            }

            rec.roll_window(now_ms, window_ms);
            let start = rec.bump(now_ms);

            if rec.count > self.policy.max_count {
                rec.blocked_until = Some(now_ms + self.policy.block_ms());
                return Verdict::Blocked {
                    retry_after_ms: self.policy.block_ms(),
                };
            }

            Verdict::Allowed {
                remaining: self.policy.max_count - rec.count,
                resets_at_ms: start + window_ms,
            }
        })
    }

    /// Evict records with no live window or block. Returns how many were evicted.
    ///
    /// An evicted record is indistinguishable from a fresh one, so this only
    /// reclaims memory from long-idle keys.
    pub fn sweep_at(&self, now_ms: i64) -> usize {
        let window_ms = self.policy.window_ms();
        let before = self.records.len();
        let after = self
            .records
            .retain(|_key, cell| cell.lock().unwrap().is_live(now_ms, window_ms));
        before.saturating_sub(after)
    }

    /// Drop every record. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        self.records.clear()
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
