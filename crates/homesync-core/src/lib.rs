//! Device-state synchronization between a smart-home hub and a dashboard.
//!
//! - **[`Hub`]**: facade that owns one instance of each component and
//!   wires them together. Reads never fail; transport and auth problems
//!   surface as [`HubEvent`]s.
//!
//! - **[`StateCache`]**: TTL memory cache in front of a durable record,
//!   with concurrent misses coalesced into one batched fetch. Every
//!   producer (push, poll, batch, durable restore) writes through
//!   [`StateCache::update`].
//!
//! - **[`SubscriptionRegistry`]**: per-entity callbacks delivered in
//!   [`Priority`] order, isolated from each other's panics.
//!
//! - **[`Supervisor`]**: real-time channel lifecycle (authenticate,
//!   heartbeat, replay subscriptions, reconnect with backoff).
//!
//! - **[`PollingScheduler`]**: REST polling while the channel is down.

pub mod config;
pub mod error;
pub mod event;
pub mod hub;
pub mod poller;
pub mod store;
pub mod subscription;
pub mod supervisor;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{CacheConfig, ConnectionConfig, HubConfig, PollingConfig};
pub use error::CoreError;
pub use event::HubEvent;
pub use hub::Hub;
pub use poller::PollingScheduler;
pub use store::{
    CacheEntry, DurableStorage, FileStorage, MemoryStorage, Origin, StateCache, StorageError,
};
pub use subscription::{Priority, SubscribeOptions, Subscription, SubscriptionRegistry};
pub use supervisor::{ConnectionState, Supervisor};

pub use homesync_api::{EntityKey, StateValue};
