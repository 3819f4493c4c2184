// ── Durable cache ──
//
// One JSON record per storage key, shaped `{ key: { value, timestamp } }`
// with `timestamp` in epoch milliseconds. The record survives restarts so
// a cold dashboard can paint before the hub answers.
//
// Changed values are staged in memory and merged into the stored record
// by `flush`, one read-modify-write per flush. Storage failures never reach
// callers: a quota error prunes old entries and retries once, anything else
// is logged and dropped.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};
use homesync_api::{EntityKey, StateValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised by a [`DurableStorage`] backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage quota exceeded ({needed} bytes needed, {quota} allowed)")]
    QuotaExceeded { needed: usize, quota: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A synchronous string key-value store.
///
/// Records are small (a few hundred entities at most), so backends do
/// blocking I/O directly.
pub trait DurableStorage: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn write(&self, key: &str, data: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

// ── File backend ─────────────────────────────────────────────────────

/// Stores each key as `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
    quota: Option<usize>,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            quota: None,
        }
    }

    /// Reject writes larger than `bytes`.
    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota = Some(bytes);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl DurableStorage for FileStorage {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, data: &str) -> Result<(), StorageError> {
        if let Some(quota) = self.quota {
            check_quota(data.len(), quota)?;
        }
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ── Memory backend ───────────────────────────────────────────────────

/// In-process storage for tests and for running without a cache directory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: Mutex<HashMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes larger than `bytes`, simulating an exhausted quota.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            data: Mutex::default(),
            quota: Some(bytes),
        }
    }
}

impl DurableStorage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(data.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if let Some(quota) = self.quota {
            check_quota(value.len(), quota)?;
        }
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

fn check_quota(needed: usize, quota: usize) -> Result<(), StorageError> {
    if needed > quota {
        return Err(StorageError::QuotaExceeded { needed, quota });
    }
    Ok(())
}

// ── Record codec ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DurableRecord {
    value: StateValue,
    /// Epoch milliseconds.
    timestamp: i64,
}

impl DurableRecord {
    fn written_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }

    fn is_younger_than(&self, now: DateTime<Utc>, age: TimeDelta) -> bool {
        self.written_at().is_some_and(|at| now - at < age)
    }
}

type Snapshot = BTreeMap<EntityKey, DurableRecord>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The durable half of the state cache.
pub(crate) struct DurableCache {
    storage: Arc<dyn DurableStorage>,
    storage_key: String,
    ttl: TimeDelta,
    prune_age: TimeDelta,
    /// Accepted writes not yet merged into storage.
    staged: Mutex<Snapshot>,
    /// Serializes read-modify-write cycles against storage.
    io: Mutex<()>,
}

impl DurableCache {
    pub(crate) fn new(
        storage: Arc<dyn DurableStorage>,
        storage_key: String,
        ttl: TimeDelta,
        prune_age: TimeDelta,
    ) -> Self {
        Self {
            storage,
            storage_key,
            ttl,
            prune_age,
            staged: Mutex::new(Snapshot::new()),
            io: Mutex::new(()),
        }
    }

    /// Unexpired durable value for `key` with its original timestamp.
    /// Staged writes count.
    pub(crate) fn lookup(
        &self,
        key: &EntityKey,
        now: DateTime<Utc>,
    ) -> Option<(StateValue, DateTime<Utc>)> {
        let staged = lock(&self.staged).get(key).cloned();
        let record = match staged {
            Some(record) => record,
            None => self.load().remove(key)?,
        };
        let written_at = record.written_at()?;
        if now - written_at >= self.ttl {
            return None;
        }
        Some((record.value, written_at))
    }

    /// Queue one entry for the next [`flush`](Self::flush).
    ///
    /// Returns `true` when nothing else was staged, i.e. the caller must
    /// schedule a flush.
    pub(crate) fn stage(
        &self,
        key: &EntityKey,
        value: &StateValue,
        written_at: DateTime<Utc>,
    ) -> bool {
        let mut staged = lock(&self.staged);
        let first = staged.is_empty();
        staged.insert(
            key.clone(),
            DurableRecord {
                value: value.clone(),
                timestamp: written_at.timestamp_millis(),
            },
        );
        first
    }

    /// Write one entry through to storage immediately.
    pub(crate) fn store(
        &self,
        key: &EntityKey,
        value: &StateValue,
        written_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.stage(key, value, written_at);
        self.flush(now);
    }

    /// Merge every staged entry into the stored record in one write.
    /// Returns how many entries were staged.
    pub(crate) fn flush(&self, now: DateTime<Utc>) -> usize {
        let _io = lock(&self.io);
        let staged = std::mem::take(&mut *lock(&self.staged));
        if staged.is_empty() {
            return 0;
        }
        let count = staged.len();

        let mut snapshot = self.load();
        snapshot.retain(|_, record| record.is_younger_than(now, self.ttl));
        snapshot.extend(staged.iter().map(|(k, record)| (k.clone(), record.clone())));

        match self.save(&snapshot) {
            Ok(()) => {}
            Err(StorageError::QuotaExceeded { needed, quota }) => {
                debug!(needed, quota, "durable cache over quota, pruning");
                snapshot.retain(|k, record| {
                    staged.contains_key(k) || record.is_younger_than(now, self.prune_age)
                });
                if let Err(e) = self.save(&snapshot) {
                    debug!(error = %e, keys = count, "durable write dropped after prune");
                }
            }
            Err(e) => warn!(error = %e, keys = count, "durable cache write failed"),
        }
        count
    }

    /// Remove expired entries. Returns how many were dropped.
    pub(crate) fn prune(&self, now: DateTime<Utc>) -> usize {
        let _io = lock(&self.io);
        let mut snapshot = self.load();
        let before = snapshot.len();
        snapshot.retain(|_, record| record.is_younger_than(now, self.ttl));
        let removed = before - snapshot.len();
        if removed > 0 {
            let result = if snapshot.is_empty() {
                self.storage.remove(&self.storage_key)
            } else {
                self.save(&snapshot)
            };
            if let Err(e) = result {
                warn!(error = %e, "durable cache prune failed");
            }
        }
        removed
    }

    fn load(&self) -> Snapshot {
        let raw = match self.storage.read(&self.storage_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Snapshot::new(),
            Err(e) => {
                warn!(error = %e, "durable cache read failed");
                return Snapshot::new();
            }
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!(error = %e, "durable cache record is corrupt, starting empty");
            Snapshot::new()
        })
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let data = serde_json::to_string(snapshot)?;
        self.storage.write(&self.storage_key, &data)
    }
}
