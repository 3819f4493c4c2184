// ── Polling fallback ──
//
// Keeps subscribed entities reasonably current while the real-time channel
// is down. Follows the supervisor's connection state: any state other than
// `Connected` runs the loop, `Connected` stops it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::PollingConfig;
use crate::store::{Origin, StateCache};
use crate::supervisor::ConnectionState;

/// Tick interval for `key_count` subscribed keys.
pub fn interval_for(key_count: usize, config: &PollingConfig) -> Duration {
    if key_count <= config.small_max_keys {
        config.small_interval
    } else if key_count <= config.medium_max_keys {
        config.medium_interval
    } else {
        config.large_interval
    }
}

struct PollerInner {
    cache: StateCache,
    config: PollingConfig,
    parent: CancellationToken,
    running: Mutex<Option<CancellationToken>>,
    ticks: AtomicU64,
}

impl PollerInner {
    fn running(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared handle to the polling loop. Cloning is cheap.
#[derive(Clone)]
pub struct PollingScheduler {
    inner: Arc<PollerInner>,
}

impl PollingScheduler {
    pub fn new(cache: StateCache, config: PollingConfig, parent: CancellationToken) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                cache,
                config,
                parent,
                running: Mutex::new(None),
                ticks: AtomicU64::new(0),
            }),
        }
    }

    /// Start the loop. Returns `false` if it was already running.
    pub fn start(&self) -> bool {
        let mut running = self.inner.running();
        if running.is_some() {
            return false;
        }
        let cancel = self.inner.parent.child_token();
        *running = Some(cancel.clone());
        drop(running);

        info!("polling fallback started");
        tokio::spawn(poll_loop(self.clone(), cancel));
        true
    }

    /// Stop the loop. Returns `false` if it was not running.
    pub fn stop(&self) -> bool {
        let Some(cancel) = self.inner.running().take() else {
            return false;
        };
        cancel.cancel();
        info!("polling fallback stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.inner.running().is_some()
    }

    /// Number of ticks executed since creation.
    pub fn tick_count(&self) -> u64 {
        self.inner.ticks.load(Ordering::Relaxed)
    }

    /// One tick: refresh subscribed keys that are missing or getting stale.
    ///
    /// Returns how many entries changed.
    pub async fn poll_once(&self) -> usize {
        self.inner.ticks.fetch_add(1, Ordering::Relaxed);
        let subscribed = self.inner.cache.registry().keys();
        let stale = self
            .inner
            .cache
            .keys_needing_refresh(&subscribed, self.inner.config.staleness_factor);
        if stale.is_empty() {
            return 0;
        }
        debug!(keys = stale.len(), subscribed = subscribed.len(), "polling stale entities");
        self.inner.cache.refresh(&stale, Origin::Poll).await
    }

    /// Start or stop with each connection state change until `cancel` fires.
    pub fn follow(
        &self,
        mut state: watch::Receiver<ConnectionState>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let poller = self.clone();
        tokio::spawn(async move {
            loop {
                let current = *state.borrow_and_update();
                if current == ConnectionState::Connected {
                    poller.stop();
                } else {
                    poller.start();
                }

                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            poller.stop();
        })
    }
}

async fn poll_loop(poller: PollingScheduler, cancel: CancellationToken) {
    loop {
        let key_count = poller.inner.cache.registry().key_count();
        let period = interval_for(key_count, &poller.inner.config);

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(period) => {}
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            changed = poller.poll_once() => {
                debug!(changed, "poll tick complete");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::{BTreeSet, HashMap};
    use std::sync::atomic::AtomicUsize;

    use chrono::{TimeDelta, Utc};
    use futures_util::FutureExt;
    use futures_util::future::BoxFuture;
    use homesync_api::{EntityKey, StateFetcher, StateValue};
    use tokio::sync::broadcast;

    use super::*;
    use crate::config::CacheConfig;
    use crate::store::MemoryStorage;
    use crate::subscription::{SubscribeOptions, SubscriptionRegistry};

    #[derive(Default)]
    struct Recorder {
        requested: Mutex<Vec<BTreeSet<EntityKey>>>,
        calls: AtomicUsize,
    }

    impl StateFetcher for Recorder {
        fn request_once<'a>(
            &'a self,
            keys: &'a BTreeSet<EntityKey>,
        ) -> BoxFuture<'a, HashMap<EntityKey, StateValue>> {
            async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.requested.lock().unwrap().push(keys.clone());
                keys.iter()
                    .map(|k| (k.clone(), StateValue::new("polled")))
                    .collect()
            }
            .boxed()
        }
    }

    fn scheduler(fetcher: Arc<Recorder>) -> (PollingScheduler, StateCache) {
        let (events, _) = broadcast::channel(16);
        let cache = StateCache::new(
            CacheConfig::default(),
            fetcher,
            Arc::new(MemoryStorage::new()),
            SubscriptionRegistry::new(),
            events,
        );
        let poller = PollingScheduler::new(
            cache.clone(),
            PollingConfig::default(),
            CancellationToken::new(),
        );
        (poller, cache)
    }

    fn watch_key(cache: &StateCache, id: &str) {
        let _ = cache.subscribe(
            id,
            |_: &EntityKey, _: &StateValue| {},
            SubscribeOptions::default().deferred(),
        );
    }

    #[test]
    fn interval_grows_with_subscribed_keys() {
        let config = PollingConfig::default();
        assert_eq!(interval_for(0, &config), Duration::from_secs(5));
        assert_eq!(interval_for(10, &config), Duration::from_secs(5));
        assert_eq!(interval_for(11, &config), Duration::from_secs(7));
        assert_eq!(interval_for(20, &config), Duration::from_secs(7));
        assert_eq!(interval_for(21, &config), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn tick_refreshes_only_stale_or_missing_keys() {
        let fetcher = Arc::new(Recorder::default());
        let (poller, cache) = scheduler(fetcher.clone());
        let now = Utc::now();
        cache.update("light.recent".into(), StateValue::new("on"), Origin::Push, now);
        cache.update("light.aging".into(), StateValue::new("on"), Origin::Push, now - TimeDelta::seconds(26));
        watch_key(&cache, "light.recent");
        watch_key(&cache, "light.aging");
        watch_key(&cache, "light.cold");
        // Let the background gets for the non-fresh keys settle first.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let before = fetcher.calls.load(Ordering::SeqCst);
        assert!(cache.evict(&"light.cold".into()));

        poller.poll_once().await;

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), before + 1);
        let last = fetcher.requested.lock().unwrap().last().cloned().unwrap();
        let expected: BTreeSet<EntityKey> =
            ["light.aging", "light.cold"].into_iter().map(EntityKey::from).collect();
        assert_eq!(last, expected);
        assert_eq!(cache.peek(&"light.cold".into()).unwrap().origin, Origin::Poll);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let (poller, _cache) = scheduler(Arc::new(Recorder::default()));

        assert!(poller.start());
        assert!(!poller.start());
        assert!(poller.is_running());
        assert!(poller.stop());
        assert!(!poller.stop());
        assert!(!poller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn follows_connection_state() {
        let (poller, cache) = scheduler(Arc::new(Recorder::default()));
        watch_key(&cache, "sensor.outdoor");
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();
        let task = poller.follow(rx, cancel.clone());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(poller.is_running());
        assert!(poller.tick_count() >= 2);

        tx.send(ConnectionState::Connected).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!poller.is_running());
        let ticks = poller.tick_count();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(poller.tick_count(), ticks);

        cancel.cancel();
        task.await.unwrap();
    }
}
