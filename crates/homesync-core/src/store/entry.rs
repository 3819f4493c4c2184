// ── Memory-resident cache entries ──
//
// Insertion-ordered storage with last-writer-by-time semantics and a FIFO
// bound. Updates to an existing key keep its insertion position, so the
// bound evicts the oldest-inserted key regardless of how recently it was
// read or written.

use chrono::{DateTime, Utc};
use homesync_api::{EntityKey, StateValue};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Which producer wrote an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    /// Unsolicited update from the real-time channel.
    Push,
    /// Polling fallback refresh.
    Poll,
    /// Resolution of a pending `get` batch.
    BatchFetch,
    /// Restored from the durable cache.
    Durable,
}

/// One cached entity state.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: EntityKey,
    pub value: StateValue,
    pub written_at: DateTime<Utc>,
    pub origin: Origin,
}

impl CacheEntry {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.written_at
    }

    /// Younger than `ttl` at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        self.age(now) < ttl
    }
}

/// Result of offering a write to the memory cache.
#[derive(Debug, PartialEq)]
pub(crate) enum Applied {
    /// Older than the stored entry; nothing changed.
    Stale,
    /// Same value; only the timestamp moved forward.
    Unchanged,
    /// New or different value. Carries the keys evicted by the bound.
    Changed { evicted: Vec<EntityKey> },
}

pub(crate) struct MemoryCache {
    entries: IndexMap<EntityKey, CacheEntry>,
    max_entries: usize,
}

impl MemoryCache {
    pub(crate) fn new(max_entries: usize) -> Self {
        Self {
            entries: IndexMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn apply(&mut self, entry: CacheEntry) -> Applied {
        if let Some(existing) = self.entries.get_mut(&entry.key) {
            if entry.written_at < existing.written_at {
                return Applied::Stale;
            }
            let changed = existing.value != entry.value;
            existing.written_at = entry.written_at;
            existing.origin = entry.origin;
            if !changed {
                return Applied::Unchanged;
            }
            existing.value = entry.value;
            return Applied::Changed {
                evicted: Vec::new(),
            };
        }

        self.entries.insert(entry.key.clone(), entry);
        let mut evicted = Vec::new();
        while self.entries.len() > self.max_entries {
            match self.entries.shift_remove_index(0) {
                Some((key, _)) => evicted.push(key),
                None => break,
            }
        }
        Applied::Changed { evicted }
    }

    /// Drop entries older than `ttl`, returning how many were removed.
    pub(crate) fn sweep(&mut self, now: DateTime<Utc>, ttl: chrono::Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh(now, ttl));
        before - self.entries.len()
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        self.entries.shift_remove(key)
    }
}
