//! Fingerprint-keyed store of delivered messages, bounded by capacity and
//! per-entry TTL.

use std::collections::HashMap;
use std::time::Instant;

/// Share of entries dropped when the cache is crowded.
const EVICT_FRACTION: f64 = 0.3;

/// Delivery metadata remembered for one content fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CacheEntry {
    /// Remote message id returned by the endpoint on creation.
    pub message_id: i64,
    /// How many times this content has been seen while the entry was live.
    pub duplicates: u32,
    /// Absolute deadline; past it the entry counts as a miss.
    pub expire_at: Instant,
}

/// Capacity-bounded map from content fingerprint to [`CacheEntry`].
///
/// Every operation is total over the key space: absent keys are no-ops,
/// `false`, or `None` — never errors.
#[derive(Debug)]
pub(crate) struct MessageCache {
    entries: HashMap<String, CacheEntry>,
    max_size: usize,
}

impl MessageCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_size,
        }
    }

    /// Insert or overwrite, evicting the soonest-to-expire share first when
    /// the cache is crowded.
    pub fn insert(&mut self, key: &str, entry: CacheEntry) {
        if self.is_crowded() {
            self.evict(EVICT_FRACTION);
        }
        self.entries.insert(key.to_string(), entry);
    }

    /// Bump the duplicate count and return the updated entry. No-op for
    /// absent keys.
    pub fn increment(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.get_mut(key)?;
        entry.duplicates += 1;
        Some(entry.clone())
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Absent keys count as expired, so callers treat missing and stale
    /// entries the same way: create fresh.
    pub fn is_expired(&self, key: &str, now: Instant) -> bool {
        match self.entries.get(key) {
            Some(entry) => now > entry.expire_at,
            None => true,
        }
    }

    pub fn is_crowded(&self) -> bool {
        self.entries.len() >= self.max_size
    }

    /// Remove the `floor(len * fraction)` entries closest to expiry. Entries
    /// near their deadline are the cheapest to lose, which approximates a
    /// TTL-aware LRU without per-entry access timestamps.
    pub fn evict(&mut self, fraction: f64) {
        let count = (self.entries.len() as f64 * fraction).floor() as usize;
        if count == 0 {
            return;
        }

        let mut by_expiry: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.expire_at))
            .collect();
        by_expiry.sort_by_key(|(_, expire_at)| *expire_at);

        for (key, _) in by_expiry.into_iter().take(count) {
            self.entries.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
