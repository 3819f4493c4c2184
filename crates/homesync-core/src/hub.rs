// ── Hub facade ──
//
// Wires the components together once per hub: one cache, one registry,
// one supervisor, one poller. Consumers hold a cheap `Hub` clone and never
// construct the pieces themselves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use homesync_api::{EntityKey, RestClient, StateFetcher, StateValue, TransportConfig};

use crate::config::HubConfig;
use crate::error::CoreError;
use crate::event::HubEvent;
use crate::poller::PollingScheduler;
use crate::store::{DurableStorage, FileStorage, MemoryStorage, StateCache};
use crate::subscription::{SubscribeOptions, Subscription, SubscriptionRegistry};
use crate::supervisor::{ConnectionState, Supervisor};

const EVENT_CHANNEL_SIZE: usize = 256;

/// Entry point for consumers.
///
/// [`start`](Hub::start) opens the real-time channel and arms the polling
/// fallback and cache sweeper; reads work before that too, over REST.
/// A hub cannot be restarted after [`shutdown`](Hub::shutdown).
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    config: HubConfig,
    cache: StateCache,
    supervisor: Supervisor,
    poller: PollingScheduler,
    rest: Option<RestClient>,
    events: broadcast::Sender<HubEvent>,
    cancel: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    /// Build a hub backed by REST and, when `storage_dir` is set, a
    /// file-backed durable cache.
    pub fn new(config: HubConfig) -> Result<Self, CoreError> {
        let transport = TransportConfig {
            tls: config.tls.clone(),
            timeout: config.timeout,
        };
        let rest = RestClient::new(config.url.clone(), &config.token, &transport)?;
        let storage: Arc<dyn DurableStorage> = match &config.storage_dir {
            Some(dir) => Arc::new(FileStorage::new(dir)),
            None => Arc::new(MemoryStorage::new()),
        };
        Ok(Self::with_parts(
            config,
            Arc::new(rest.clone()),
            storage,
            Some(rest),
        ))
    }

    /// Build a hub from explicit parts.
    ///
    /// `rest` is only used as the service-call fallback while the channel
    /// is down; `None` makes such calls fail with `HubDisconnected`.
    pub fn with_parts(
        config: HubConfig,
        fetcher: Arc<dyn StateFetcher>,
        storage: Arc<dyn DurableStorage>,
        rest: Option<RestClient>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let cancel = CancellationToken::new();
        let cache = StateCache::new(
            config.cache.clone(),
            fetcher,
            storage,
            SubscriptionRegistry::new(),
            events.clone(),
        );
        let supervisor = Supervisor::new(
            config.url.clone(),
            config.token.clone(),
            config.connection.clone(),
            cache.clone(),
            rest.clone(),
            events.clone(),
        );
        let poller = PollingScheduler::new(cache.clone(), config.polling.clone(), cancel.clone());

        Self {
            inner: Arc::new(HubInner {
                config,
                cache,
                supervisor,
                poller,
                rest,
                events,
                cancel,
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Connect the real-time channel and start background maintenance.
    ///
    /// Returns `false` if already started.
    pub fn start(&self) -> bool {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!(url = %self.inner.config.url, "starting hub sync");
        self.inner.supervisor.connect(&self.inner.cancel);
        let follow = self
            .inner
            .poller
            .follow(self.inner.supervisor.state(), self.inner.cancel.child_token());
        let sweeper = self.inner.cache.spawn_sweeper(self.inner.cancel.child_token());

        let mut tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tasks.push(follow);
        tasks.push(sweeper);
        true
    }

    /// Stop every background task, close the channel and flush staged
    /// durable writes.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.supervisor.disconnect().await;
        self.inner.poller.stop();
        let tasks: Vec<_> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        self.inner.cache.flush_durable();
        info!("hub sync stopped");
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Current value of `key`; `"unavailable"` if it cannot be resolved.
    pub async fn get(&self, key: impl Into<EntityKey>) -> StateValue {
        self.inner.cache.get(&key.into()).await
    }

    pub async fn get_status(&self, key: impl Into<EntityKey>) -> String {
        self.inner.cache.get_status(&key.into()).await
    }

    /// Register `callback` for `key` and ask the hub to push its changes.
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
        self.inner.supervisor.watch_entities([key.clone()]);
        self.inner.cache.subscribe(key, callback, options)
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Call `domain.service` on the hub.
    pub async fn invoke(
        &self,
        domain: &str,
        service: &str,
        data: Option<Value>,
    ) -> Result<Value, CoreError> {
        self.inner.supervisor.invoke(domain, service, data).await
    }

    // ── Observability ────────────────────────────────────────────────

    pub fn events(&self) -> broadcast::Receiver<HubEvent> {
        self.inner.events.subscribe()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.supervisor.state()
    }

    // ── Component access ─────────────────────────────────────────────

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &StateCache {
        &self.inner.cache
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        self.inner.cache.registry()
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.inner.supervisor
    }

    pub fn poller(&self) -> &PollingScheduler {
        &self.inner.poller
    }

    /// REST client, when built by [`Hub::new`].
    pub fn rest(&self) -> Option<&RestClient> {
        self.inner.rest.as_ref()
    }
}
