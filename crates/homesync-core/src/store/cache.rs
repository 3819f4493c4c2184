// ── State cache ──
//
// Two-tier entity state cache: a bounded memory map with a short TTL in
// front of the durable record, plus a coalescing batch for cache misses.
// `update` is the only mutation path; push, poll, batch fetch and durable
// restore all go through it, so change detection, write-through and
// subscriber fan-out happen in exactly one place.
//
// Locks are std mutexes held only for map operations, never across an
// `.await` or a subscriber callback.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use homesync_api::{EntityKey, StateFetcher, StateValue};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::batch::PendingBatch;
use super::durable::{DurableCache, DurableStorage};
use super::entry::{Applied, CacheEntry, MemoryCache, Origin};
use crate::config::CacheConfig;
use crate::event::HubEvent;
use crate::subscription::{SubscribeOptions, Subscription, SubscriptionRegistry};

fn to_time_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct CacheInner {
    settings: CacheConfig,
    ttl: TimeDelta,
    memory: Mutex<MemoryCache>,
    durable: DurableCache,
    batch: Mutex<PendingBatch>,
    fetcher: Arc<dyn StateFetcher>,
    registry: SubscriptionRegistry,
    events: broadcast::Sender<HubEvent>,
}

/// Shared handle to the entity state cache. Cloning is cheap.
#[derive(Clone)]
pub struct StateCache {
    inner: Arc<CacheInner>,
}

impl StateCache {
    pub fn new(
        settings: CacheConfig,
        fetcher: Arc<dyn StateFetcher>,
        storage: Arc<dyn DurableStorage>,
        registry: SubscriptionRegistry,
        events: broadcast::Sender<HubEvent>,
    ) -> Self {
        let ttl = to_time_delta(settings.ttl);
        let durable = DurableCache::new(
            storage,
            settings.storage_key.clone(),
            to_time_delta(settings.durable_ttl),
            to_time_delta(settings.quota_prune_age),
        );
        Self {
            inner: Arc::new(CacheInner {
                memory: Mutex::new(MemoryCache::new(settings.max_entries)),
                ttl,
                durable,
                batch: Mutex::new(PendingBatch::default()),
                fetcher,
                registry,
                events,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &CacheConfig {
        &self.inner.settings
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Current value of `key`. Never fails.
    ///
    /// A fresh memory entry is returned without any I/O. Otherwise an
    /// unexpired durable entry is restored and returned (and refreshed in
    /// the background if it is older than the memory TTL). Otherwise the
    /// key joins the pending batch; if that does not resolve within
    /// `get_timeout` the result is `"unavailable"`.
    pub async fn get(&self, key: &EntityKey) -> StateValue {
        if let Some(value) = self.fresh(key) {
            trace!(key = %key, "memory hit");
            return value;
        }

        let now = Utc::now();
        if let Some((value, written_at)) = self.inner.durable.lookup(key, now) {
            debug!(key = %key, "restored from durable cache");
            self.apply(
                CacheEntry {
                    key: key.clone(),
                    value: value.clone(),
                    written_at,
                    origin: Origin::Durable,
                },
                false,
            );
            if now - written_at >= self.inner.ttl {
                self.enqueue(key.clone(), None, now);
            }
            // A newer (if stale) memory entry wins over the durable copy.
            return self.peek(key).map_or(value, |entry| entry.value);
        }

        let (tx, rx) = oneshot::channel();
        self.enqueue(key.clone(), Some(tx), now);
        match tokio::time::timeout(self.inner.settings.get_timeout, rx).await {
            Ok(Ok(value)) => value,
            Ok(Err(_)) | Err(_) => {
                debug!(key = %key, "pending fetch did not resolve in time");
                StateValue::unavailable()
            }
        }
    }

    /// Status string of `key`; `"unavailable"` when it cannot be resolved.
    pub async fn get_status(&self, key: &EntityKey) -> String {
        self.get(key).await.status
    }

    /// Memory entry for `key` regardless of age.
    pub fn peek(&self, key: &EntityKey) -> Option<CacheEntry> {
        lock(&self.inner.memory).get(key.as_str()).cloned()
    }

    /// Last value known for `key` at any age: memory first, then the
    /// unexpired durable record.
    pub fn last_known(&self, key: &EntityKey) -> Option<StateValue> {
        if let Some(entry) = self.peek(key) {
            return Some(entry.value);
        }
        self.inner
            .durable
            .lookup(key, Utc::now())
            .map(|(value, _)| value)
    }

    /// Memory value for `key` if younger than the TTL.
    pub fn fresh(&self, key: &EntityKey) -> Option<StateValue> {
        let now = Utc::now();
        lock(&self.inner.memory)
            .get(key.as_str())
            .filter(|entry| entry.is_fresh(now, self.inner.ttl))
            .map(|entry| entry.value.clone())
    }

    /// Number of memory entries.
    pub fn len(&self) -> usize {
        lock(&self.inner.memory).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys from `keys` that are missing or older than `factor × ttl`.
    pub fn keys_needing_refresh(
        &self,
        keys: &BTreeSet<EntityKey>,
        factor: f64,
    ) -> BTreeSet<EntityKey> {
        let threshold = to_time_delta(self.inner.settings.ttl.mul_f64(factor.max(0.0)));
        let now = Utc::now();
        let memory = lock(&self.inner.memory);
        keys.iter()
            .filter(|key| {
                memory
                    .get(key.as_str())
                    .is_none_or(|entry| entry.age(now) >= threshold)
            })
            .cloned()
            .collect()
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Offer a value for `key` written at `written_at`.
    ///
    /// Writes older than the stored entry are ignored. An equal value only
    /// moves the timestamp forward. A changed value is delivered to
    /// subscribers, broadcast as [`HubEvent::EntityStateChanged`] and staged
    /// for durable storage (except the `"unavailable"` sentinel).
    /// Returns whether the value changed.
    pub fn update(
        &self,
        key: EntityKey,
        value: StateValue,
        origin: Origin,
        written_at: DateTime<Utc>,
    ) -> bool {
        self.apply(
            CacheEntry {
                key,
                value,
                written_at,
                origin,
            },
            true,
        )
    }

    fn apply(&self, entry: CacheEntry, persist: bool) -> bool {
        let key = entry.key.clone();
        let value = entry.value.clone();
        let written_at = entry.written_at;
        let origin = entry.origin;

        let applied = lock(&self.inner.memory).apply(entry);
        let evicted = match applied {
            Applied::Stale => {
                trace!(key = %key, %origin, "ignoring out-of-order write");
                return false;
            }
            Applied::Unchanged => return false,
            Applied::Changed { evicted } => evicted,
        };

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted oldest cache entries");
        }
        if persist && !value.is_unavailable() {
            self.persist(&key, &value, written_at);
        }

        debug!(key = %key, %origin, status = %value.status, "entity state changed");
        self.inner.registry.notify(&key, &value);
        // No receivers is fine.
        let _ = self
            .inner
            .events
            .send(HubEvent::EntityStateChanged { key, value });
        true
    }

    /// Stage a durable write; the first one after a flush schedules the next.
    ///
    /// Flushes run on the blocking pool. Outside a runtime the write happens
    /// inline.
    fn persist(&self, key: &EntityKey, value: &StateValue, written_at: DateTime<Utc>) {
        if !self.inner.durable.stage(key, value, written_at) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let cache = self.clone();
                let delay = self.inner.settings.durable_flush_delay;
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    let flush = tokio::task::spawn_blocking(move || cache.flush_durable());
                    if let Err(e) = flush.await {
                        warn!(error = %e, "durable flush task failed");
                    }
                });
            }
            Err(_) => {
                self.flush_durable();
            }
        }
    }

    /// Write every staged value to durable storage now.
    pub fn flush_durable(&self) -> usize {
        let written = self.inner.durable.flush(Utc::now());
        if written > 0 {
            trace!(written, "flushed durable cache");
        }
        written
    }

    /// Fetch `keys` in one round trip and write the results with `origin`.
    ///
    /// Results are stamped with the request time. Returns how many entries
    /// changed; `0` if the fetch timed out.
    pub async fn refresh(&self, keys: &BTreeSet<EntityKey>, origin: Origin) -> usize {
        match self.fetch_into_cache(keys, origin, Utc::now()).await {
            Some(results) => results.into_iter().filter(|(_, changed)| *changed).count(),
            None => 0,
        }
    }

    async fn fetch_into_cache(
        &self,
        keys: &BTreeSet<EntityKey>,
        origin: Origin,
        stamp: DateTime<Utc>,
    ) -> Option<HashMap<EntityKey, bool>> {
        if keys.is_empty() {
            return Some(HashMap::new());
        }
        let fetch = self.inner.fetcher.request_once(keys);
        let Ok(results) = tokio::time::timeout(self.inner.settings.get_timeout, fetch).await
        else {
            warn!(keys = keys.len(), %origin, "state fetch timed out");
            return None;
        };
        Some(
            results
                .into_iter()
                .map(|(key, value)| {
                    let changed = self.update(key.clone(), value, origin, stamp);
                    (key, changed)
                })
                .collect(),
        )
    }

    // ── Batching ─────────────────────────────────────────────────────

    /// Queue `key` for the next batch fetch without waiting for it.
    pub fn request_refresh(&self, key: EntityKey) {
        self.enqueue(key, None, Utc::now());
    }

    fn enqueue(
        &self,
        key: EntityKey,
        waiter: Option<oneshot::Sender<StateValue>>,
        now: DateTime<Utc>,
    ) {
        let arm = lock(&self.inner.batch).enqueue(key, waiter, now);
        if arm {
            let cache = self.clone();
            let delay = self.inner.settings.batch_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                cache.flush_batch().await;
            });
        }
    }

    async fn flush_batch(&self) {
        let batch = lock(&self.inner.batch).take();
        if batch.keys.is_empty() {
            return;
        }
        debug!(keys = batch.keys.len(), "fetching pending batch");

        // Pushes that landed while the batch waited are newer than its values.
        if self
            .fetch_into_cache(&batch.keys, Origin::BatchFetch, batch.opened_at)
            .await
            .is_some()
        {
            // Results are in the cache before anyone waiting on them wakes.
            batch.resolve_with(|key| {
                self.peek(key)
                    .map_or_else(StateValue::unavailable, |entry| entry.value)
            });
        } else {
            batch.resolve_with(|_| StateValue::unavailable());
        }
    }

    // ── Subscriptions ────────────────────────────────────────────────

    /// Register `callback` for changes to `key`.
    ///
    /// With `immediate` set and a fresh value cached, the callback runs
    /// before this returns. Without a fresh value a background `get`
    /// populates the cache; the subscriber then hears the result through
    /// the normal fan-out (or directly, if the value did not change).
    pub fn subscribe<F>(
        &self,
        key: impl Into<EntityKey>,
        callback: F,
        options: SubscribeOptions,
    ) -> Subscription
    where
        F: Fn(&EntityKey, &StateValue) + Send + Sync + 'static,
    {
        let key = key.into();
        let subscription =
            self.inner
                .registry
                .register(key.clone(), Arc::new(callback), options.priority);

        if let Some(value) = self.fresh(&key) {
            if options.immediate {
                self.inner
                    .registry
                    .deliver_pending(&key, subscription.id(), &value);
            }
            return subscription;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let cache = self.clone();
                let id = subscription.id();
                let immediate = options.immediate;
                handle.spawn(async move {
                    let value = cache.get(&key).await;
                    if immediate {
                        cache.inner.registry.deliver_pending(&key, id, &value);
                    }
                });
            }
            Err(_) => warn!(key = %key, "no runtime; subscriber waits for the next update"),
        }
        subscription
    }

    // ── Maintenance ──────────────────────────────────────────────────

    /// Drop memory entries past the TTL and durable entries past theirs.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let removed = lock(&self.inner.memory).sweep(now, self.inner.ttl);
        let pruned = self.inner.durable.prune(now);
        if removed + pruned > 0 {
            debug!(removed, pruned, "cache sweep");
        }
        removed
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `sweep_interval`
    /// until `cancel` fires.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        let period = self.inner.settings.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        cache.sweep_expired();
                    }
                }
            }
        })
    }

    /// Remove `key` from memory without notifying anyone.
    pub fn evict(&self, key: &EntityKey) -> bool {
        lock(&self.inner.memory).remove(key.as_str()).is_some()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::FutureExt;
    use futures_util::future::BoxFuture;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::store::MemoryStorage;
    use crate::subscription::Priority;

    /// Serves fixed values and counts round trips.
    #[derive(Default)]
    struct FakeFetcher {
        values: Mutex<HashMap<EntityKey, StateValue>>,
        calls: AtomicUsize,
        requested: Mutex<Vec<BTreeSet<EntityKey>>>,
        delay: Option<Duration>,
    }

    impl FakeFetcher {
        fn with(values: &[(&str, &str)]) -> Self {
            let fetcher = Self::default();
            for (key, status) in values {
                fetcher.set(key, status);
            }
            fetcher
        }

        fn set(&self, key: &str, status: &str) {
            self.values
                .lock()
                .unwrap()
                .insert(EntityKey::from(key), StateValue::new(status));
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl StateFetcher for FakeFetcher {
        fn request_once<'a>(
            &'a self,
            keys: &'a BTreeSet<EntityKey>,
        ) -> BoxFuture<'a, HashMap<EntityKey, StateValue>> {
            async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.requested.lock().unwrap().push(keys.clone());
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                let found = self.values.lock().unwrap().clone();
                homesync_api::fetch::complete_with_unavailable(keys, found)
            }
            .boxed()
        }
    }

    fn cache_with(fetcher: Arc<FakeFetcher>, storage: Arc<dyn DurableStorage>) -> StateCache {
        let (events, _) = broadcast::channel(16);
        StateCache::new(
            CacheConfig::default(),
            fetcher,
            storage,
            SubscriptionRegistry::new(),
            events,
        )
    }

    fn key(id: &str) -> EntityKey {
        EntityKey::from(id)
    }

    #[tokio::test(start_paused = true)]
    async fn cold_get_fetches_then_serves_from_memory() {
        let fetcher = Arc::new(FakeFetcher::with(&[("sensor.temp_living_room", "21.5")]));
        let cache = cache_with(fetcher.clone(), Arc::new(MemoryStorage::new()));

        let first = cache.get(&key("sensor.temp_living_room")).await;
        assert_eq!(first.status, "21.5");
        assert_eq!(fetcher.calls(), 1);

        let second = cache.get(&key("sensor.temp_living_room")).await;
        assert_eq!(second.status, "21.5");
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(
            cache.peek(&key("sensor.temp_living_room")).unwrap().origin,
            Origin::BatchFetch
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_entry_is_served_without_fetching() {
        let fetcher = Arc::new(FakeFetcher::default());
        let cache = cache_with(fetcher.clone(), Arc::new(MemoryStorage::new()));
        cache.update(key("light.kitchen"), StateValue::new("on"), Origin::Push, Utc::now());

        assert_eq!(cache.get_status(&key("light.kitchen")).await, "on");
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_gets_coalesce_into_one_fetch() {
        let fetcher = Arc::new(FakeFetcher::with(&[
            ("switch.a", "on"),
            ("switch.c", "off"),
        ]));
        let cache = cache_with(fetcher.clone(), Arc::new(MemoryStorage::new()));

        let (ka, kb, kc) = (key("switch.a"), key("switch.b"), key("switch.c"));
        let (a, b, c) = tokio::join!(cache.get(&ka), cache.get(&kb), cache.get(&kc));

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(fetcher.requested.lock().unwrap()[0].len(), 3);
        assert_eq!(a.status, "on");
        assert!(b.is_unavailable());
        assert_eq!(c.status, "off");
    }

    #[tokio::test(start_paused = true)]
    async fn push_during_batch_wait_beats_fetched_value() {
        let fetcher = Arc::new(FakeFetcher::with(&[("light.kitchen", "off")]));
        let cache = cache_with(fetcher.clone(), Arc::new(MemoryStorage::new()));

        let getter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(&key("light.kitchen")).await })
        };
        tokio::task::yield_now().await;
        assert!(cache.update(key("light.kitchen"), StateValue::new("on"), Origin::Push, Utc::now()));

        let value = getter.await.unwrap();
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(value.status, "on");
        let entry = cache.peek(&key("light.kitchen")).unwrap();
        assert_eq!(entry.value.status, "on");
        assert_eq!(entry.origin, Origin::Push);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_resolves_unavailable_without_caching() {
        let fetcher = Arc::new(FakeFetcher {
            delay: Some(Duration::from_secs(10)),
            ..FakeFetcher::with(&[("sensor.slow", "1")])
        });
        let cache = cache_with(fetcher, Arc::new(MemoryStorage::new()));

        let value = cache.get(&key("sensor.slow")).await;
        assert!(value.is_unavailable());
        assert!(cache.peek(&key("sensor.slow")).is_none());
    }

    #[tokio::test]
    async fn out_of_order_update_is_rejected() {
        let cache = cache_with(Arc::new(FakeFetcher::default()), Arc::new(MemoryStorage::new()));
        let t1 = Utc::now();
        let t0 = t1 - TimeDelta::seconds(2);

        assert!(cache.update(key("light.a"), StateValue::new("on"), Origin::Push, t1));
        assert!(!cache.update(key("light.a"), StateValue::new("off"), Origin::Poll, t0));
        assert_eq!(cache.peek(&key("light.a")).unwrap().value.status, "on");
    }

    #[tokio::test]
    async fn unchanged_value_does_not_notify() {
        let cache = cache_with(Arc::new(FakeFetcher::default()), Arc::new(MemoryStorage::new()));
        let hits = Arc::new(AtomicUsize::new(0));
        cache.update(key("light.a"), StateValue::new("on"), Origin::Push, Utc::now());

        let counter = Arc::clone(&hits);
        let _sub = cache.subscribe(
            "light.a",
            move |_: &EntityKey, _: &StateValue| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            SubscribeOptions::default().deferred(),
        );

        assert!(!cache.update(key("light.a"), StateValue::new("on"), Origin::Poll, Utc::now()));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(cache.update(key("light.a"), StateValue::new("off"), Origin::Push, Utc::now()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn changed_values_persist_but_sentinel_does_not() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = cache_with(Arc::new(FakeFetcher::default()), storage.clone());

        cache.update(key("light.a"), StateValue::new("on"), Origin::Push, Utc::now());
        cache.update(key("light.b"), StateValue::unavailable(), Origin::Push, Utc::now());
        assert_eq!(cache.flush_durable(), 1);

        let raw = storage.read(crate::config::DEFAULT_STORAGE_KEY).unwrap().unwrap();
        let record: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(record["light.a"]["value"]["status"], "on");
        assert!(record.get("light.b").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn durable_hit_restores_and_refreshes_in_background() {
        let storage: Arc<dyn DurableStorage> = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(FakeFetcher::with(&[("light.hall", "off")]));

        // Earlier session wrote the entry two minutes ago.
        let earlier = cache_with(Arc::new(FakeFetcher::default()), Arc::clone(&storage));
        earlier.update(
            key("light.hall"),
            StateValue::new("on"),
            Origin::Push,
            Utc::now() - TimeDelta::minutes(2),
        );
        earlier.flush_durable();

        let cache = cache_with(fetcher.clone(), storage);
        let value = cache.get(&key("light.hall")).await;
        assert_eq!(value.status, "on");
        assert_eq!(cache.peek(&key("light.hall")).unwrap().origin, Origin::Durable);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(cache.peek(&key("light.hall")).unwrap().value.status, "off");
    }

    /// Counts writes reaching the backing store.
    #[derive(Default)]
    struct CountingStorage {
        inner: MemoryStorage,
        writes: AtomicUsize,
    }

    impl DurableStorage for CountingStorage {
        fn read(&self, key: &str) -> Result<Option<String>, crate::store::StorageError> {
            self.inner.read(key)
        }
        fn write(&self, key: &str, data: &str) -> Result<(), crate::store::StorageError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.write(key, data)
        }
        fn remove(&self, key: &str) -> Result<(), crate::store::StorageError> {
            self.inner.remove(key)
        }
    }

    #[tokio::test]
    async fn burst_of_changes_is_persisted_in_one_write() {
        let storage = Arc::new(CountingStorage::default());
        let (events, _) = broadcast::channel(16);
        let cache = StateCache::new(
            CacheConfig {
                durable_flush_delay: Duration::from_millis(20),
                ..CacheConfig::default()
            },
            Arc::new(FakeFetcher::default()),
            storage.clone(),
            SubscriptionRegistry::new(),
            events,
        );

        for (id, status) in [("light.a", "on"), ("light.b", "on"), ("light.a", "off")] {
            cache.update(key(id), StateValue::new(status), Origin::Push, Utc::now());
        }
        assert_eq!(storage.writes.load(Ordering::SeqCst), 0);

        for _ in 0..50 {
            if storage.writes.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(storage.writes.load(Ordering::SeqCst), 1);

        let raw = storage.read(crate::config::DEFAULT_STORAGE_KEY).unwrap().unwrap();
        let record: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(record["light.a"]["value"]["status"], "off");
        assert_eq!(record["light.b"]["value"]["status"], "on");
    }

    #[tokio::test]
    async fn last_known_falls_back_to_durable_after_sweep() {
        let cache = cache_with(Arc::new(FakeFetcher::default()), Arc::new(MemoryStorage::new()));
        cache.update(key("light.a"), StateValue::new("on"), Origin::Push, Utc::now() - TimeDelta::seconds(40));
        cache.sweep_expired();

        assert!(cache.peek(&key("light.a")).is_none());
        assert_eq!(cache.last_known(&key("light.a")).unwrap().status, "on");
        assert!(cache.last_known(&key("light.never")).is_none());
    }

    #[tokio::test]
    async fn memory_bound_evicts_first_inserted() {
        let (events, _) = broadcast::channel(16);
        let cache = StateCache::new(
            CacheConfig {
                max_entries: 2,
                ..CacheConfig::default()
            },
            Arc::new(FakeFetcher::default()),
            Arc::new(MemoryStorage::new()),
            SubscriptionRegistry::new(),
            events,
        );
        let now = Utc::now();
        cache.update(key("a.one"), StateValue::new("1"), Origin::Push, now);
        cache.update(key("a.two"), StateValue::new("1"), Origin::Push, now);
        cache.update(key("a.three"), StateValue::new("1"), Origin::Push, now);

        assert_eq!(cache.len(), 2);
        assert!(cache.peek(&key("a.one")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_delivers_fresh_value_synchronously() {
        let cache = cache_with(Arc::new(FakeFetcher::default()), Arc::new(MemoryStorage::new()));
        cache.update(key("light.a"), StateValue::new("on"), Origin::Push, Utc::now());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = cache.subscribe(
            "light.a",
            move |_: &EntityKey, v: &StateValue| sink.lock().unwrap().push(v.status.clone()),
            SubscribeOptions::default().with_priority(Priority::High),
        );

        assert_eq!(*seen.lock().unwrap(), vec!["on".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_without_cached_value_fetches_in_background() {
        let fetcher = Arc::new(FakeFetcher::with(&[("sensor.temp_living_room", "21.5")]));
        let cache = cache_with(fetcher.clone(), Arc::new(MemoryStorage::new()));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = cache.subscribe(
            "sensor.temp_living_room",
            move |_: &EntityKey, v: &StateValue| sink.lock().unwrap().push(v.status.clone()),
            SubscribeOptions::default(),
        );
        assert!(seen.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["21.5".to_string()]);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_needing_refresh_skips_recent_entries() {
        let cache = cache_with(Arc::new(FakeFetcher::default()), Arc::new(MemoryStorage::new()));
        let now = Utc::now();
        cache.update(key("a.recent"), StateValue::new("1"), Origin::Push, now);
        cache.update(key("a.aging"), StateValue::new("1"), Origin::Push, now - TimeDelta::seconds(25));

        let wanted: BTreeSet<EntityKey> =
            ["a.recent", "a.aging", "a.missing"].into_iter().map(EntityKey::from).collect();
        let stale = cache.keys_needing_refresh(&wanted, 0.8);

        assert_eq!(
            stale,
            ["a.aging", "a.missing"].into_iter().map(EntityKey::from).collect()
        );
    }

    #[tokio::test]
    async fn sweep_removes_expired_memory_entries() {
        let cache = cache_with(Arc::new(FakeFetcher::default()), Arc::new(MemoryStorage::new()));
        cache.update(key("a.old"), StateValue::new("1"), Origin::Push, Utc::now() - TimeDelta::seconds(45));
        cache.update(key("a.new"), StateValue::new("1"), Origin::Push, Utc::now());

        assert_eq!(cache.sweep_expired(), 1);
        assert!(cache.peek(&key("a.old")).is_none());
    }
}
