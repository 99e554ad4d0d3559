//! Blacklist and whitelist for network addresses and chat-user identities.
//!
//! These are the fast-path decisions that preempt every windowed policy:
//! blacklist membership short-circuits to reject, whitelist membership to
//! allow, and blacklist always wins when an identity is somehow on both.
//! Blacklist entries may be permanent or expire; expired entries are evicted
//! on first read after expiry, and the janitor sweeps the rest.

use crate::human_duration::HumanMillis;
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    sync::RwLock,
    time::Duration,
};
use tracing::info;

/// One blacklist entry. `expires_at: None` means permanent.
#[derive(Clone, Debug)]
pub struct BlacklistEntry {
    /// Why the identity was blacklisted (manual action or spam promotion).
    pub reason: String,
    /// When the entry was created.
    pub created_at: i64,
    /// When the entry lapses; `None` is permanent.
    pub expires_at: Option<i64>,
}

/// One row of the operator-facing blacklist enumeration.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlacklistInfoEntry {
    /// The blacklisted identity.
    pub key: String,
    /// Why it was blacklisted.
    pub reason: String,
    /// When the entry was created (ms since epoch).
    pub created_at: i64,
    /// Milliseconds until the entry lapses; `None` is permanent.
    pub remaining_ms: Option<i64>,
    /// Human-readable remaining time ("3h2m", or "permanent").
    pub remaining: String,
}

/// Blacklist and whitelist with the precedence contract baked into the
/// accessors: callers check [`AccessList::blacklisted_at`] first, then
/// [`AccessList::is_whitelisted`], then any windowed policy.
///
/// Read-mostly, so both lists sit behind reader-writer locks; the write lock
/// is only taken for admin mutations and expiry eviction.
#[derive(Debug, Default)]
pub struct AccessList {
    blacklist: RwLock<HashMap<String, BlacklistEntry>>,
    whitelist: RwLock<HashSet<String>>,
}

impl AccessList {
    /// Create an access list seeded with the configured whitelist addresses.
    pub fn new(seed_whitelist: impl IntoIterator<Item = String>) -> Self {
        Self {
            blacklist: Default::default(),
            whitelist: RwLock::new(seed_whitelist.into_iter().collect()),
        }
    }

    /// If `key` is blacklisted at `now_ms`, return the recorded reason.
    ///
    /// An expired entry is evicted as a side effect and reads as absent.
    pub fn blacklisted_at(&self, key: &str, now_ms: i64) -> Option<String> {
        {
            let guard = self.blacklist.read().unwrap();
            match guard.get(key) {
                None => return None,
                Some(entry) => {
                    if entry.expires_at.is_none_or(|t| now_ms < t) {
                        return Some(entry.reason.clone());
                    }
                }
            }
        }

        // Entry found but expired: upgrade to a write lock and evict.
        // Re-check under the write lock in case an admin re-blacklisted
        // the key in the meantime.
        let mut guard = self.blacklist.write().unwrap();
        if let Some(entry) = guard.get(key) {
            if entry.expires_at.is_some_and(|t| now_ms >= t) {
                guard.remove(key);
            } else {
                return Some(entry.reason.clone());
            }
        }
        None
    }

    /// Whether `key` is blacklisted at `now_ms` (evicting if expired).
    pub fn is_blacklisted_at(&self, key: &str, now_ms: i64) -> bool {
        self.blacklisted_at(key, now_ms).is_some()
    }

    /// Upsert a blacklist entry. `duration: None` makes it permanent.
    pub fn blacklist_at(&self, key: &str, reason: &str, duration: Option<Duration>, now_ms: i64) {
        let expires_at = duration.map(|d| now_ms + d.as_millis() as i64);
        match expires_at {
            Some(t) => info!(
                "Blacklisted {key} for {} ({reason})",
                HumanMillis(t - now_ms)
            ),
            None => info!("Blacklisted {key} permanently ({reason})"),
        }
        self.blacklist.write().unwrap().insert(
            key.to_owned(),
            BlacklistEntry {
                reason: reason.to_owned(),
                created_at: now_ms,
                expires_at,
            },
        );
    }

    /// Remove a blacklist entry. A no-op (returning false) if absent.
    pub fn unblacklist(&self, key: &str) -> bool {
        let removed = self.blacklist.write().unwrap().remove(key).is_some();
        if removed {
            info!("Unblacklisted {key}");
        }
        removed
    }

    /// Add an address to the whitelist. Returns false if already present.
    pub fn whitelist(&self, key: &str) -> bool {
        self.whitelist.write().unwrap().insert(key.to_owned())
    }

    /// Remove an address from the whitelist. A no-op if absent.
    pub fn unwhitelist(&self, key: &str) -> bool {
        self.whitelist.write().unwrap().remove(key)
    }

    /// Whether an address is whitelisted. Never expires on its own.
    pub fn is_whitelisted(&self, key: &str) -> bool {
        self.whitelist.read().unwrap().contains(key)
    }

    /// Number of blacklist entries (including any not yet evicted).
    pub fn blacklist_len(&self) -> usize {
        self.blacklist.read().unwrap().len()
    }

    /// Number of whitelisted addresses.
    pub fn whitelist_len(&self) -> usize {
        self.whitelist.read().unwrap().len()
    }

    /// Enumerate unexpired blacklist entries with their remaining time.
    pub fn info_at(&self, now_ms: i64) -> Vec<BlacklistInfoEntry> {
        let guard = self.blacklist.read().unwrap();
        let mut entries: Vec<BlacklistInfoEntry> = guard
            .iter()
            .filter(|(_key, e)| e.expires_at.is_none_or(|t| now_ms < t))
            .map(|(key, e)| {
                let remaining_ms = e.expires_at.map(|t| t - now_ms);
                BlacklistInfoEntry {
                    key: key.clone(),
                    reason: e.reason.clone(),
                    created_at: e.created_at,
                    remaining_ms,
                    remaining: match remaining_ms {
                        Some(ms) => HumanMillis(ms).to_string(),
                        None => "permanent".to_owned(),
                    },
                }
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Evict expired blacklist entries. Returns how many were evicted.
    pub fn sweep_at(&self, now_ms: i64) -> usize {
        let mut guard = self.blacklist.write().unwrap();
        let before = guard.len();
        guard.retain(|_key, e| e.expires_at.is_none_or(|t| now_ms < t));
        before - guard.len()
    }
}
