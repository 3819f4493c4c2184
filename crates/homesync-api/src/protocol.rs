//! JSON frames exchanged over the hub WebSocket.
//!
//! Client frames are serialized from [`ClientFrame`]; inbound text frames
//! are parsed into [`ServerFrame`]. State pushes arrive either as classic
//! `state_changed` events or as the compressed `subscribe_entities` form
//! (`a` additions, `c` changes, `r` removals); [`decode_event`] flattens
//! both into [`EntityUpdate`]s.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Attributes, EntityKey, StateValue};

/// Event type the supervisor subscribes to for classic pushes.
pub const STATE_CHANGED: &str = "state_changed";

// ── Client → hub ─────────────────────────────────────────────────────

#[derive(Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        access_token: String,
    },
    SubscribeEvents {
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        event_type: Option<String>,
    },
    SubscribeEntities {
        id: u64,
        entity_ids: Vec<EntityKey>,
    },
    CallService {
        id: u64,
        domain: String,
        service: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        service_data: Option<Value>,
    },
    Ping {
        id: u64,
    },
}

impl ClientFrame {
    /// Correlation id carried by the frame (`auth` has none).
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Auth { .. } => None,
            Self::SubscribeEvents { id, .. }
            | Self::SubscribeEntities { id, .. }
            | Self::CallService { id, .. }
            | Self::Ping { id } => Some(*id),
        }
    }

    /// Frame `type` as sent on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::SubscribeEvents { .. } => "subscribe_events",
            Self::SubscribeEntities { .. } => "subscribe_entities",
            Self::CallService { .. } => "call_service",
            Self::Ping { .. } => "ping",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// Hand-written so the access token never ends up in logs.
impl fmt::Debug for ClientFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth { .. } => f
                .debug_struct("Auth")
                .field("access_token", &"[REDACTED]")
                .finish(),
            Self::SubscribeEvents { id, event_type } => f
                .debug_struct("SubscribeEvents")
                .field("id", id)
                .field("event_type", event_type)
                .finish(),
            Self::SubscribeEntities { id, entity_ids } => f
                .debug_struct("SubscribeEntities")
                .field("id", id)
                .field("entity_ids", entity_ids)
                .finish(),
            Self::CallService {
                id,
                domain,
                service,
                service_data,
            } => f
                .debug_struct("CallService")
                .field("id", id)
                .field("domain", domain)
                .field("service", service)
                .field("service_data", service_data)
                .finish(),
            Self::Ping { id } => f.debug_struct("Ping").field("id", id).finish(),
        }
    }
}

// ── Hub → client ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Event {
        #[serde(default)]
        id: Option<u64>,
        event: Value,
    },
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<ResultError>,
    },
    Pong {
        #[serde(default)]
        id: Option<u64>,
    },
    #[serde(other)]
    Unknown,
}

/// `error` object of an unsuccessful `result` frame.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl ServerFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// ── Event decoding ───────────────────────────────────────────────────

/// One entity-level change extracted from an `event` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityUpdate {
    pub key: EntityKey,
    pub change: EntityChange,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntityChange {
    /// Full replacement state.
    Replace(StateValue),
    /// Partial change relative to the last known state.
    Patch {
        status: Option<String>,
        changed: Attributes,
        removed: Vec<String>,
    },
    /// The hub no longer knows the entity.
    Removed,
}

#[derive(Deserialize)]
struct StateChangedData {
    entity_id: EntityKey,
    #[serde(default)]
    new_state: Option<WireState>,
}

#[derive(Deserialize)]
struct WireState {
    state: String,
    #[serde(default)]
    attributes: Attributes,
}

#[derive(Deserialize)]
struct CompressedState {
    #[serde(default)]
    s: Option<String>,
    #[serde(default)]
    a: Attributes,
}

#[derive(Deserialize)]
struct CompressedRemoval {
    #[serde(default)]
    a: Vec<String>,
}

#[derive(Deserialize)]
struct CompressedDiff {
    #[serde(default, rename = "+")]
    plus: Option<CompressedState>,
    #[serde(default, rename = "-")]
    minus: Option<CompressedRemoval>,
}

/// Flatten the payload of an `event` frame into entity updates.
///
/// Unknown event types and malformed entries yield nothing; a push that
/// cannot be understood is dropped rather than poisoning the stream.
pub fn decode_event(event: &Value) -> Vec<EntityUpdate> {
    if let Some(event_type) = event.get("event_type").and_then(Value::as_str) {
        if event_type != STATE_CHANGED {
            return Vec::new();
        }
        let Some(data) = event.get("data") else {
            return Vec::new();
        };
        return match serde_json::from_value::<StateChangedData>(data.clone()) {
            Ok(data) => {
                let change = match data.new_state {
                    Some(state) => EntityChange::Replace(StateValue::with_attributes(
                        state.state,
                        state.attributes,
                    )),
                    None => EntityChange::Removed,
                };
                vec![EntityUpdate {
                    key: data.entity_id,
                    change,
                }]
            }
            Err(e) => {
                tracing::debug!(error = %e, "malformed state_changed payload");
                Vec::new()
            }
        };
    }

    let mut updates = Vec::new();

    if let Some(added) = event.get("a").and_then(Value::as_object) {
        for (id, raw) in added {
            match serde_json::from_value::<CompressedState>(raw.clone()) {
                Ok(CompressedState { s: Some(status), a }) => updates.push(EntityUpdate {
                    key: EntityKey::from(id.as_str()),
                    change: EntityChange::Replace(StateValue::with_attributes(status, a)),
                }),
                Ok(_) => tracing::debug!(entity = %id, "compressed addition without state"),
                Err(e) => tracing::debug!(entity = %id, error = %e, "malformed compressed addition"),
            }
        }
    }

    if let Some(changed) = event.get("c").and_then(Value::as_object) {
        for (id, raw) in changed {
            match serde_json::from_value::<CompressedDiff>(raw.clone()) {
                Ok(diff) => {
                    let (status, changed) = diff
                        .plus
                        .map_or((None, Attributes::new()), |plus| (plus.s, plus.a));
                    let removed = diff.minus.map(|m| m.a).unwrap_or_default();
                    updates.push(EntityUpdate {
                        key: EntityKey::from(id.as_str()),
                        change: EntityChange::Patch {
                            status,
                            changed,
                            removed,
                        },
                    });
                }
                Err(e) => tracing::debug!(entity = %id, error = %e, "malformed compressed change"),
            }
        }
    }

    if let Some(removed) = event.get("r").and_then(Value::as_array) {
        updates.extend(removed.iter().filter_map(Value::as_str).map(|id| EntityUpdate {
            key: EntityKey::from(id),
            change: EntityChange::Removed,
        }));
    }

    updates
}
