// ── Connection supervisor ──
//
// Owns the real-time channel to the hub: connect + authenticate, replay
// entity subscriptions, heartbeat, route inbound frames, correlate service
// calls, and reconnect with exponential backoff. Connection state is
// published on a `watch` channel; the polling fallback follows it.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde_json::Value;
use strum::Display;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use homesync_api::protocol::{
    ClientFrame, EntityChange, EntityUpdate, STATE_CHANGED, ServerFrame, decode_event,
};
use homesync_api::websocket::{FrameReader, FrameWriter, calculate_backoff, websocket_url};
use homesync_api::{EntityKey, HubChannel, RestClient, StateValue};

use crate::config::ConnectionConfig;
use crate::error::CoreError;
use crate::event::HubEvent;
use crate::store::{Origin, StateCache};

// ── ConnectionState ──────────────────────────────────────────────────

/// Real-time channel state observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Authenticating,
    Connected,
    /// Terminal: the credential was rejected or reconnection gave up.
    Failed,
}

type CallResult = Result<Value, CoreError>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How a connected session ended.
enum SessionEnd {
    Cancelled,
    Closed,
}

// ── Supervisor ───────────────────────────────────────────────────────

/// Shared handle to the connection supervisor. Cloning is cheap.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    url: Url,
    token: SecretString,
    settings: ConnectionConfig,
    cache: StateCache,
    /// REST fallback for `invoke` while the channel is down.
    rest: Option<RestClient>,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<HubEvent>,
    /// Present only while a session is connected.
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    pending_calls: Mutex<HashMap<u64, oneshot::Sender<CallResult>>>,
    /// Every entity ever requested; replayed on each connect.
    requested: Mutex<BTreeSet<EntityKey>>,
    next_id: AtomicU64,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(
        url: Url,
        token: SecretString,
        settings: ConnectionConfig,
        cache: StateCache,
        rest: Option<RestClient>,
        events: broadcast::Sender<HubEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(SupervisorInner {
                url,
                token,
                settings,
                cache,
                rest,
                state_tx,
                events,
                outbound: Mutex::new(None),
                pending_calls: Mutex::new(HashMap::new()),
                requested: Mutex::new(BTreeSet::new()),
                next_id: AtomicU64::new(1),
                cancel: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Spawn the connection loop. Returns `false` if it is already running.
    pub fn connect(&self, parent: &CancellationToken) -> bool {
        let mut task = lock(&self.inner.task);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return false;
        }
        let cancel = parent.child_token();
        *lock(&self.inner.cancel) = Some(cancel.clone());
        *task = Some(tokio::spawn(run(self.clone(), cancel)));
        true
    }

    /// Stop the connection loop and wait for it to wind down.
    ///
    /// No reconnection is attempted afterwards.
    pub async fn disconnect(&self) {
        if let Some(cancel) = lock(&self.inner.cancel).take() {
            cancel.cancel();
        }
        let task = lock(&self.inner.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    // ── Outbound ─────────────────────────────────────────────────────

    /// Queue `frame` on the open channel. Returns `false` when disconnected.
    pub fn send(&self, frame: ClientFrame) -> bool {
        lock(&self.inner.outbound)
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok())
    }

    /// Ask the hub to push changes for `keys`.
    ///
    /// Keys are remembered and replayed on every reconnect. Returns how many
    /// were new.
    pub fn watch_entities(&self, keys: impl IntoIterator<Item = EntityKey>) -> usize {
        let mut requested = lock(&self.inner.requested);
        let fresh: Vec<EntityKey> = keys
            .into_iter()
            .filter(|key| requested.insert(key.clone()))
            .collect();
        if fresh.is_empty() {
            return 0;
        }
        let count = fresh.len();
        let frame = ClientFrame::SubscribeEntities {
            id: self.next_id(),
            entity_ids: fresh,
        };
        // Disconnected: the next connect replays the whole set.
        self.send(frame);
        count
    }

    pub fn watched(&self) -> BTreeSet<EntityKey> {
        lock(&self.inner.requested).clone()
    }

    /// Service calls awaiting their result frame.
    pub fn pending_calls(&self) -> usize {
        lock(&self.inner.pending_calls).len()
    }

    /// Call a hub service.
    ///
    /// Over the open channel the call is correlated by id and bounded by
    /// `call_timeout`. While disconnected it goes through REST instead.
    pub async fn invoke(
        &self,
        domain: &str,
        service: &str,
        data: Option<Value>,
    ) -> Result<Value, CoreError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        let frame = ClientFrame::CallService {
            id,
            domain: domain.to_owned(),
            service: service.to_owned(),
            service_data: data.clone(),
        };

        let queued = {
            let outbound = lock(&self.inner.outbound);
            match outbound.as_ref() {
                Some(out) => {
                    lock(&self.inner.pending_calls).insert(id, tx);
                    out.send(frame).is_ok()
                }
                None => false,
            }
        };

        if !queued {
            lock(&self.inner.pending_calls).remove(&id);
            let Some(rest) = &self.inner.rest else {
                return Err(CoreError::HubDisconnected);
            };
            debug!(domain, service, "channel down, calling service over REST");
            return Ok(rest.call_service(domain, service, data.as_ref()).await?);
        }

        let timeout = self.inner.settings.call_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::HubDisconnected),
            Err(_) => {
                lock(&self.inner.pending_calls).remove(&id);
                warn!(id, domain, service, "service call timed out");
                Err(CoreError::Timeout {
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }

    // ── Internals ────────────────────────────────────────────────────

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = %current, to = %state, "connection state");
            *current = state;
            true
        });
    }

    fn emit(&self, event: HubEvent) {
        let _ = self.inner.events.send(event);
    }

    /// One connect → authenticate → pump cycle.
    ///
    /// Errors before the channel is up are returned; a session that reached
    /// `Connected` always ends with `Ok`.
    async fn session(
        &self,
        ws_url: &Url,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, homesync_api::Error> {
        let handshake = self.inner.settings.handshake_timeout;
        let open = tokio::time::timeout(handshake, HubChannel::open(ws_url, &self.inner.token));
        let channel = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            opened = open => match opened {
                Ok(channel) => channel?,
                Err(_) => {
                    return Err(homesync_api::Error::Timeout {
                        timeout_secs: handshake.as_secs(),
                    });
                }
            },
        };
        let hub_version = channel.ha_version().map(ToOwned::to_owned);
        let (mut writer, mut reader) = channel.into_split();

        writer
            .send(&ClientFrame::SubscribeEvents {
                id: self.next_id(),
                event_type: Some(STATE_CHANGED.into()),
            })
            .await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let backlog: Vec<EntityKey> = {
            let requested = lock(&self.inner.requested);
            *lock(&self.inner.outbound) = Some(tx);
            requested.iter().cloned().collect()
        };
        if !backlog.is_empty() {
            debug!(keys = backlog.len(), "replaying entity subscriptions");
            let replay = ClientFrame::SubscribeEntities {
                id: self.next_id(),
                entity_ids: backlog,
            };
            if let Err(e) = writer.send(&replay).await {
                self.teardown();
                return Err(e);
            }
        }

        self.set_state(ConnectionState::Connected);
        info!(url = %ws_url, hub_version = ?hub_version, "connected to hub");
        self.emit(HubEvent::Connected);

        let end = self.pump(&mut writer, &mut reader, &mut rx, cancel).await;

        self.teardown();
        writer.close().await;
        self.set_state(ConnectionState::Disconnected);
        self.emit(HubEvent::Disconnected);
        Ok(end)
    }

    async fn pump(
        &self,
        writer: &mut FrameWriter,
        reader: &mut FrameReader,
        outbound: &mut mpsc::UnboundedReceiver<ClientFrame>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let mut heartbeat = tokio::time::interval(self.inner.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;
        let mut unanswered: u32 = 0;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return SessionEnd::Cancelled,
                frame = reader.next_frame() => match frame {
                    Some(Ok(frame)) => self.handle_frame(frame, &mut unanswered),
                    Some(Err(e)) => {
                        warn!(error = %e, "hub channel error");
                        return SessionEnd::Closed;
                    }
                    None => {
                        info!("hub closed the channel");
                        return SessionEnd::Closed;
                    }
                },
                Some(frame) = outbound.recv() => {
                    if let Err(e) = writer.send(&frame).await {
                        warn!(error = %e, kind = frame.kind(), "failed to send frame");
                        return SessionEnd::Closed;
                    }
                }
                _ = heartbeat.tick() => {
                    if unanswered >= 2 {
                        warn!("hub stopped answering pings, dropping channel");
                        return SessionEnd::Closed;
                    }
                    let ping = ClientFrame::Ping { id: self.next_id() };
                    if let Err(e) = writer.send(&ping).await {
                        warn!(error = %e, "failed to send ping");
                        return SessionEnd::Closed;
                    }
                    unanswered += 1;
                }
            }
        }
    }

    fn handle_frame(&self, frame: ServerFrame, unanswered: &mut u32) {
        match frame {
            ServerFrame::Event { event, .. } => {
                let received_at = Utc::now();
                for update in decode_event(&event) {
                    self.apply_push(update, received_at);
                }
            }
            ServerFrame::Result {
                id,
                success,
                result,
                error,
            } => {
                let outcome = if success {
                    Ok(result.unwrap_or(Value::Null))
                } else {
                    let error = error.unwrap_or_default();
                    Err(CoreError::ServiceCallFailed {
                        code: error.code,
                        message: error.message,
                    })
                };
                match lock(&self.inner.pending_calls).remove(&id) {
                    Some(waiter) => {
                        let _ = waiter.send(outcome);
                    }
                    None => {
                        if let Err(e) = outcome {
                            warn!(id, error = %e, "hub rejected request");
                        }
                    }
                }
            }
            ServerFrame::Pong { .. } => *unanswered = 0,
            other => debug!(frame = ?other, "ignoring frame"),
        }
    }

    /// Write one decoded update into the cache.
    ///
    /// A diff applies to the last known value (memory, then durable). With
    /// neither, a diff carrying a status stands on its own; one without a
    /// status is dropped and the full state is fetched instead.
    fn apply_push(&self, update: EntityUpdate, received_at: DateTime<Utc>) {
        let EntityUpdate { key, change } = update;
        let value = match change {
            EntityChange::Replace(value) => value,
            EntityChange::Patch {
                status,
                changed,
                removed,
            } => {
                let base = self
                    .inner
                    .cache
                    .last_known(&key)
                    .or_else(|| status.as_deref().map(StateValue::new));
                let Some(base) = base else {
                    debug!(key = %key, "diff for an unknown entity, fetching full state");
                    self.inner.cache.request_refresh(key);
                    return;
                };
                base.patched(status.as_deref(), &changed, &removed)
            }
            EntityChange::Removed => StateValue::unavailable(),
        };
        self.inner
            .cache
            .update(key, value, Origin::Push, received_at);
    }

    /// Close the outbound queue and fail every in-flight call.
    fn teardown(&self) {
        lock(&self.inner.outbound).take();
        let pending: Vec<_> = lock(&self.inner.pending_calls).drain().collect();
        if !pending.is_empty() {
            debug!(count = pending.len(), "failing in-flight calls");
        }
        for (_, waiter) in pending {
            let _ = waiter.send(Err(CoreError::HubDisconnected));
        }
    }
}

// ── Connection loop ──────────────────────────────────────────────────

async fn run(supervisor: Supervisor, cancel: CancellationToken) {
    let reconnect = supervisor.inner.settings.reconnect.clone();
    let ws_url = match websocket_url(&supervisor.inner.url) {
        Ok(url) => url,
        Err(e) => {
            error!(error = %e, "cannot derive hub WebSocket URL");
            supervisor.set_state(ConnectionState::Failed);
            return;
        }
    };

    let mut attempt: u32 = 0;
    loop {
        supervisor.set_state(ConnectionState::Authenticating);
        match supervisor.session(&ws_url, &cancel).await {
            Ok(SessionEnd::Cancelled) => break,
            Ok(SessionEnd::Closed) => attempt = 0,
            Err(homesync_api::Error::Authentication { message }) => {
                error!(%message, "hub rejected the access token");
                supervisor.set_state(ConnectionState::Failed);
                supervisor.emit(HubEvent::AuthFailed { message });
                return;
            }
            Err(e) => {
                warn!(error = %e, attempt, "hub connection attempt failed");
                supervisor.set_state(ConnectionState::Disconnected);
            }
        }

        if reconnect.max_retries.is_some_and(|max| attempt >= max) {
            error!(attempts = attempt, "giving up on hub connection");
            supervisor.set_state(ConnectionState::Failed);
            supervisor.emit(HubEvent::ConnectionFailed { attempts: attempt });
            return;
        }

        let delay = calculate_backoff(attempt, &reconnect);
        attempt += 1;
        info!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnecting to hub"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    supervisor.set_state(ConnectionState::Disconnected);
}
