//! Concurrency cap for persistent real-time channels.
//!
//! Not time-windowed: each client address may hold at most a fixed number of
//! simultaneously-open connections, released on disconnect. Admit and release
//! race from independent events, so the size-check-and-insert sequence is
//! serialized behind one mutex; identity cardinality is small enough that a
//! coarse lock is fine.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

/// Tracks open connection ids per client address and enforces the cap.
#[derive(Debug)]
pub struct ConnectionGate {
    max_per_identity: usize,
    open: Mutex<HashMap<String, HashSet<String>>>,
}

impl ConnectionGate {
    /// Create an empty gate admitting up to `max_per_identity` connections
    /// per address.
    pub fn new(max_per_identity: usize) -> Self {
        Self {
            max_per_identity,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Try to open `connection_id` for `identity`. Returns false when the
    /// identity is at its cap; on success the id is tracked until released.
    pub fn try_admit(&self, identity: &str, connection_id: &str) -> bool {
        let mut open = self.open.lock().unwrap();
        match open.get_mut(identity) {
            Some(set) if set.len() >= self.max_per_identity => false,
            Some(set) => {
                set.insert(connection_id.to_owned());
                true
            }
            None => {
                if self.max_per_identity == 0 {
                    return false;
                }
                open.insert(
                    identity.to_owned(),
                    HashSet::from([connection_id.to_owned()]),
                );
                true
            }
        }
    }

    /// Track `connection_id` for `identity` regardless of the cap.
    /// Used for whitelisted addresses, which are admitted unconditionally
    /// but still released symmetrically on disconnect.
    pub fn force_admit(&self, identity: &str, connection_id: &str) {
        self.open
            .lock()
            .unwrap()
            .entry(identity.to_owned())
            .or_default()
            .insert(connection_id.to_owned());
    }

    /// Close `connection_id` for `identity`. Once an identity's set drains,
    /// its tracking entry is removed entirely.
    pub fn release(&self, identity: &str, connection_id: &str) {
        let mut open = self.open.lock().unwrap();
        if let Some(set) = open.get_mut(identity) {
            set.remove(connection_id);
            if set.is_empty() {
                open.remove(identity);
            }
        }
    }

    /// Open connections for one identity.
    pub fn count(&self, identity: &str) -> usize {
        self.open
            .lock()
            .unwrap()
            .get(identity)
            .map_or(0, HashSet::len)
    }

    /// Number of identities with at least one open connection.
    pub fn tracked_identities(&self) -> usize {
        self.open.lock().unwrap().len()
    }

    /// Total open connections across all identities.
    pub fn open_connections(&self) -> usize {
        self.open.lock().unwrap().values().map(HashSet::len).sum()
    }

    /// The configured per-identity cap.
    pub fn max_per_identity(&self) -> usize {
        self.max_per_identity
    }
}
