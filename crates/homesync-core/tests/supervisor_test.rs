#![allow(clippy::unwrap_used)]
// Integration tests for the connection supervisor against an in-process
// WebSocket hub.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};
use url::Url;

use homesync_api::StateFetcher;
use homesync_core::{
    ConnectionState, CoreError, EntityKey, Hub, HubConfig, HubEvent, MemoryStorage, Origin,
    StateValue, SubscribeOptions,
};

const GOOD_TOKEN: &str = "good-token";
const WAIT: Duration = Duration::from_secs(5);

// ── Fake hub ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Control {
    Push(Value),
    Drop,
}

/// Which requests the fake hub answers.
#[derive(Debug, Clone, Copy)]
struct Behavior {
    answer_calls: bool,
    answer_pings: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            answer_calls: true,
            answer_pings: true,
        }
    }
}

struct FakeHub {
    url: Url,
    seen: mpsc::UnboundedReceiver<Value>,
    control: broadcast::Sender<Control>,
}

impl FakeHub {
    async fn start() -> Self {
        Self::start_with(Behavior::default()).await
    }

    async fn start_with(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen) = mpsc::unbounded_channel();
        let (control, _) = broadcast::channel(16);

        let control_tx = control.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, behavior, seen_tx.clone(), control_tx.subscribe()));
            }
        });

        Self {
            url: Url::parse(&format!("http://{addr}")).unwrap(),
            seen,
            control,
        }
    }

    /// Next frame of `kind` the client sent, skipping others.
    async fn expect_frame(&mut self, kind: &str) -> Value {
        tokio::time::timeout(WAIT, async {
            loop {
                let frame = self.seen.recv().await.unwrap();
                if frame["type"] == kind {
                    return frame;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {kind} frame within {WAIT:?}"))
    }

    fn push(&self, event: Value) {
        self.control.send(Control::Push(event)).unwrap();
    }

    fn drop_connections(&self) {
        self.control.send(Control::Drop).unwrap();
    }
}

type Ws = WebSocketStream<TcpStream>;

async fn send(ws: &mut Ws, frame: Value) {
    let _ = ws.send(Message::Text(frame.to_string().into())).await;
}

async fn serve(
    stream: TcpStream,
    behavior: Behavior,
    seen: mpsc::UnboundedSender<Value>,
    mut control: broadcast::Receiver<Control>,
) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };
    send(&mut ws, json!({ "type": "auth_required", "ha_version": "2026.2.0" })).await;

    let Some(Ok(Message::Text(text))) = ws.next().await else {
        return;
    };
    let auth: Value = serde_json::from_str(&text).unwrap();
    let accepted = auth["access_token"] == GOOD_TOKEN;
    let _ = seen.send(auth);
    if !accepted {
        send(&mut ws, json!({ "type": "auth_invalid", "message": "Invalid access token" })).await;
        let _ = ws.close(None).await;
        return;
    }
    send(&mut ws, json!({ "type": "auth_ok", "ha_version": "2026.2.0" })).await;

    loop {
        tokio::select! {
            msg = ws.next() => {
                let Some(Ok(Message::Text(text))) = msg else { return };
                let frame: Value = serde_json::from_str(&text).unwrap();
                let id = frame["id"].clone();
                match frame["type"].as_str() {
                    Some("ping") if !behavior.answer_pings => {}
                    Some("call_service") if !behavior.answer_calls => {}
                    Some("ping") => send(&mut ws, json!({ "id": id, "type": "pong" })).await,
                    Some("call_service") => {
                        send(&mut ws, json!({
                            "id": id,
                            "type": "result",
                            "success": true,
                            "result": { "context": { "id": "ctx-1" } }
                        }))
                        .await;
                    }
                    _ => send(&mut ws, json!({ "id": id, "type": "result", "success": true, "result": null })).await,
                }
                let _ = seen.send(frame);
            }
            cmd = control.recv() => match cmd {
                Ok(Control::Push(event)) => {
                    send(&mut ws, json!({ "id": 1, "type": "event", "event": event })).await;
                }
                Ok(Control::Drop) | Err(_) => {
                    let _ = ws.close(None).await;
                    return;
                }
            }
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

#[derive(Default)]
struct CountingFetcher {
    calls: AtomicUsize,
}

impl StateFetcher for CountingFetcher {
    fn request_once<'a>(
        &'a self,
        keys: &'a BTreeSet<EntityKey>,
    ) -> BoxFuture<'a, HashMap<EntityKey, StateValue>> {
        async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            keys.iter()
                .map(|k| (k.clone(), StateValue::new("off")))
                .collect()
        }
        .boxed()
    }
}

fn hub_for(url: &Url, token: &str) -> Hub {
    let mut config = HubConfig::new(url.clone(), SecretString::from(token.to_string()));
    config.connection.reconnect.initial_delay = Duration::from_millis(400);
    config.connection.reconnect.max_retries = Some(3);
    config.polling.small_interval = Duration::from_millis(100);
    Hub::with_parts(
        config,
        Arc::new(CountingFetcher::default()),
        Arc::new(MemoryStorage::new()),
        None,
    )
}

async fn wait_for_state(hub: &Hub, target: ConnectionState) {
    let mut state = hub.connection_state();
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("state never became {target}"))
        .unwrap();
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_replays_subscriptions_and_applies_pushes() {
    let mut fake = FakeHub::start().await;
    let hub = hub_for(&fake.url, GOOD_TOKEN);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = hub.subscribe(
        "light.kitchen",
        move |_: &EntityKey, value: &StateValue| sink.lock().unwrap().push(value.status.clone()),
        SubscribeOptions::default(),
    );

    assert!(hub.start());
    wait_for_state(&hub, ConnectionState::Connected).await;

    fake.expect_frame("auth").await;
    let events = fake.expect_frame("subscribe_events").await;
    assert_eq!(events["event_type"], "state_changed");
    let replay = fake.expect_frame("subscribe_entities").await;
    assert_eq!(replay["entity_ids"], json!(["light.kitchen"]));

    // The subscriber's initial fetch lands first; the push must replace it.
    assert!(eventually(|| seen.lock().unwrap().first().map(String::as_str) == Some("off")).await);
    fake.push(json!({
        "event_type": "state_changed",
        "data": {
            "entity_id": "light.kitchen",
            "new_state": { "state": "on", "attributes": { "brightness": 200 } }
        }
    }));

    assert!(eventually(|| *seen.lock().unwrap() == ["off", "on"]).await);
    let entry = hub.cache().peek(&EntityKey::from("light.kitchen")).unwrap();
    assert_eq!(entry.origin, Origin::Push);
    assert_eq!(entry.value.attribute("brightness"), Some(&json!(200)));

    hub.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_starts_polling_and_reconnect_stops_it() {
    let mut fake = FakeHub::start().await;
    let hub = hub_for(&fake.url, GOOD_TOKEN);
    let mut events = hub.events();
    let _sub = hub.subscribe(
        "sensor.outdoor",
        |_: &EntityKey, _: &StateValue| {},
        SubscribeOptions::default(),
    );

    hub.start();
    wait_for_state(&hub, ConnectionState::Connected).await;
    fake.expect_frame("subscribe_entities").await;
    assert!(eventually(|| !hub.poller().is_running()).await);

    fake.drop_connections();
    assert!(eventually(|| hub.poller().is_running()).await);
    let ticks_before = hub.poller().tick_count();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(hub.poller().tick_count() > ticks_before);

    // Backoff elapses, the channel comes back and replays the backlog.
    wait_for_state(&hub, ConnectionState::Connected).await;
    let replay = fake.expect_frame("subscribe_entities").await;
    assert_eq!(replay["entity_ids"], json!(["sensor.outdoor"]));
    assert!(eventually(|| !hub.poller().is_running()).await);

    let mut saw = Vec::new();
    while let Ok(event) = events.try_recv() {
        if matches!(event, HubEvent::Connected | HubEvent::Disconnected) {
            saw.push(event);
        }
    }
    assert_eq!(
        saw,
        vec![HubEvent::Connected, HubEvent::Disconnected, HubEvent::Connected]
    );

    hub.shutdown().await;
}

#[tokio::test]
async fn test_rejected_token_is_terminal() {
    let fake = FakeHub::start().await;
    let hub = hub_for(&fake.url, "wrong-token");
    let mut events = hub.events();

    hub.start();
    wait_for_state(&hub, ConnectionState::Failed).await;

    let event = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(HubEvent::AuthFailed { message }) = events.recv().await {
                return message;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(event, "Invalid access token");

    hub.shutdown().await;
}

// ── Service calls ───────────────────────────────────────────────────

#[tokio::test]
async fn test_invoke_correlates_result_frame() {
    let mut fake = FakeHub::start().await;
    let hub = hub_for(&fake.url, GOOD_TOKEN);
    hub.start();
    wait_for_state(&hub, ConnectionState::Connected).await;

    let result = hub
        .invoke(
            "light",
            "turn_on",
            Some(json!({ "entity_id": "light.kitchen" })),
        )
        .await
        .unwrap();
    assert_eq!(result["context"]["id"], "ctx-1");

    let call = fake.expect_frame("call_service").await;
    assert_eq!(call["domain"], "light");
    assert_eq!(call["service"], "turn_on");
    assert_eq!(call["service_data"]["entity_id"], "light.kitchen");

    hub.shutdown().await;
}

#[tokio::test]
async fn test_invoke_without_channel_or_rest_fails() {
    let url = Url::parse("http://127.0.0.1:1").unwrap();
    let hub = hub_for(&url, GOOD_TOKEN);

    let result = hub.invoke("light", "turn_off", None).await;
    assert!(matches!(result, Err(CoreError::HubDisconnected)));
}

#[tokio::test]
async fn test_unanswered_call_times_out_and_is_forgotten() {
    let fake = FakeHub::start_with(Behavior {
        answer_calls: false,
        ..Behavior::default()
    })
    .await;
    let mut config = HubConfig::new(fake.url.clone(), SecretString::from(GOOD_TOKEN.to_string()));
    config.connection.call_timeout = Duration::from_millis(200);
    let hub = Hub::with_parts(
        config,
        Arc::new(CountingFetcher::default()),
        Arc::new(MemoryStorage::new()),
        None,
    );
    hub.start();
    wait_for_state(&hub, ConnectionState::Connected).await;

    let result = hub.invoke("light", "turn_on", None).await;

    assert!(matches!(result, Err(CoreError::Timeout { .. })));
    assert_eq!(hub.supervisor().pending_calls(), 0);
    assert_eq!(hub.supervisor().current_state(), ConnectionState::Connected);

    hub.shutdown().await;
}

// ── Reconnection and heartbeat ──────────────────────────────────────

#[tokio::test]
async fn test_reconnect_gives_up_after_max_retries() {
    // Bind then release a port so nothing is listening on it.
    let addr = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();
    let url = Url::parse(&format!("http://{addr}")).unwrap();
    let mut config = HubConfig::new(url, SecretString::from(GOOD_TOKEN.to_string()));
    config.connection.reconnect.initial_delay = Duration::from_millis(50);
    config.connection.reconnect.max_retries = Some(1);
    let hub = Hub::with_parts(
        config,
        Arc::new(CountingFetcher::default()),
        Arc::new(MemoryStorage::new()),
        None,
    );
    let mut events = hub.events();

    hub.start();
    wait_for_state(&hub, ConnectionState::Failed).await;

    let attempts = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(HubEvent::ConnectionFailed { attempts }) = events.recv().await {
                return attempts;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(attempts, 1);
    // The poller keeps serving reads while the channel is gone.
    assert!(eventually(|| hub.poller().is_running()).await);

    hub.shutdown().await;
}

#[tokio::test]
async fn test_unanswered_pings_drop_the_channel() {
    let mut fake = FakeHub::start_with(Behavior {
        answer_pings: false,
        ..Behavior::default()
    })
    .await;
    let mut config = HubConfig::new(fake.url.clone(), SecretString::from(GOOD_TOKEN.to_string()));
    config.connection.heartbeat_interval = Duration::from_millis(100);
    config.connection.reconnect.initial_delay = Duration::from_secs(30);
    let hub = Hub::with_parts(
        config,
        Arc::new(CountingFetcher::default()),
        Arc::new(MemoryStorage::new()),
        None,
    );
    let mut events = hub.events();

    hub.start();
    wait_for_state(&hub, ConnectionState::Connected).await;
    fake.expect_frame("ping").await;
    fake.expect_frame("ping").await;

    let dropped = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(HubEvent::Disconnected) = events.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(dropped.is_ok(), "channel stayed up without pongs");
    assert_ne!(hub.supervisor().current_state(), ConnectionState::Connected);

    hub.shutdown().await;
}

