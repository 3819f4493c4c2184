// ── Runtime hub configuration ──
//
// These types describe *how* to talk to a hub and how the cache behaves.
// They carry the credential and tuning knobs but never touch disk.
// The CLI (through homesync-config) constructs a `HubConfig` and hands it in.

use std::path::PathBuf;
use std::time::Duration;

use homesync_api::{ReconnectConfig, TlsMode};
use secrecy::SecretString;
use url::Url;

/// Storage key the durable cache record lives under.
pub const DEFAULT_STORAGE_KEY: &str = "homesync.entity-cache";

/// State cache tuning.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Memory entries younger than this are served without a fetch.
    pub ttl: Duration,
    /// Durable entries older than this are discarded.
    pub durable_ttl: Duration,
    /// On a storage quota error, durable entries older than this are pruned
    /// before the single retry.
    pub quota_prune_age: Duration,
    /// Memory bound; the oldest-inserted entry is evicted beyond it.
    pub max_entries: usize,
    /// Fixed delay between the first enqueue of a batch and its fetch.
    pub batch_delay: Duration,
    /// Upper bound on how long `get` waits for a pending batch.
    pub get_timeout: Duration,
    /// Period of the proactive expiry sweep.
    pub sweep_interval: Duration,
    /// Changed values reach durable storage in one write at most this long
    /// after the first of them.
    pub durable_flush_delay: Duration,
    /// Key of the serialized durable record.
    pub storage_key: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            durable_ttl: Duration::from_secs(24 * 60 * 60),
            quota_prune_age: Duration::from_secs(12 * 60 * 60),
            max_entries: 500,
            batch_delay: Duration::from_millis(50),
            get_timeout: Duration::from_secs(3),
            sweep_interval: Duration::from_secs(60),
            durable_flush_delay: Duration::from_millis(250),
            storage_key: DEFAULT_STORAGE_KEY.into(),
        }
    }
}

/// Polling fallback tuning.
///
/// The interval grows with the number of subscribed keys to bound the
/// request volume while the real-time channel is down.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Interval while at most `small_max_keys` keys are subscribed.
    pub small_interval: Duration,
    pub small_max_keys: usize,
    /// Interval while at most `medium_max_keys` keys are subscribed.
    pub medium_interval: Duration,
    pub medium_max_keys: usize,
    /// Interval above `medium_max_keys`.
    pub large_interval: Duration,
    /// Entries older than `staleness_factor × ttl` are refreshed on a tick.
    pub staleness_factor: f64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            small_interval: Duration::from_secs(5),
            small_max_keys: 10,
            medium_interval: Duration::from_secs(7),
            medium_max_keys: 20,
            large_interval: Duration::from_secs(10),
            staleness_factor: 0.8,
        }
    }
}

/// Real-time channel tuning.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub reconnect: ReconnectConfig,
    /// Liveness ping period. Two periods without a pong drop the channel.
    pub heartbeat_interval: Duration,
    /// Deadline for a `call_service` result frame.
    pub call_timeout: Duration,
    /// Deadline for connect + authentication.
    pub handshake_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            heartbeat_interval: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration for one hub.
///
/// Built by the CLI, passed to [`Hub`](crate::Hub) -- core never reads
/// config files.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Hub base URL (e.g., `http://homeassistant.local:8123`).
    pub url: Url,
    /// Long-lived access token, passed through untouched.
    pub token: SecretString,
    /// TLS verification strategy.
    pub tls: TlsMode,
    /// REST request timeout.
    pub timeout: Duration,
    pub cache: CacheConfig,
    pub polling: PollingConfig,
    pub connection: ConnectionConfig,
    /// Directory for the durable cache. `None` keeps it in memory only.
    pub storage_dir: Option<PathBuf>,
}

impl HubConfig {
    pub fn new(url: Url, token: SecretString) -> Self {
        Self {
            url,
            token,
            tls: TlsMode::default(),
            timeout: Duration::from_secs(10),
            cache: CacheConfig::default(),
            polling: PollingConfig::default(),
            connection: ConnectionConfig::default(),
            storage_dir: None,
        }
    }
}
