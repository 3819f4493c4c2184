// ── Hub lifecycle events ──
//
// Broadcast to the rest of the application: connection transitions and
// entity changes. Transport and auth failures surface here instead of
// being thrown into read call sites.

use homesync_api::{EntityKey, StateValue};

/// An observable event from a running [`Hub`](crate::Hub).
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    /// The real-time channel authenticated and subscriptions were replayed.
    Connected,
    /// The real-time channel dropped after having been connected.
    Disconnected,
    /// A cached entity changed value (from any producer).
    EntityStateChanged { key: EntityKey, value: StateValue },
    /// The hub rejected the credential. No further attempts are made.
    AuthFailed { message: String },
    /// Reconnection gave up after `attempts` tries.
    ConnectionFailed { attempts: u32 },
}
