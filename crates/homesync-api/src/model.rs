// ── Entity wire and value types ──
//
// `EntityKey` and `StateValue` are the normalized forms every producer
// (REST fetch, WebSocket push, durable restore) converts into.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status string the hub uses for entities it cannot reach, and the
/// sentinel this crate resolves unknown or unreachable entities to.
pub const UNAVAILABLE: &str = "unavailable";

/// Attribute bag attached to a state. Ordered so equality and
/// serialization are deterministic.
pub type Attributes = BTreeMap<String, Value>;

// ── EntityKey ────────────────────────────────────────────────────────

/// Hub-assigned entity identifier, e.g. `sensor.temp_living_room`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before the first `.` (`"sensor"` for `sensor.temp`).
    pub fn domain(&self) -> &str {
        self.0.split_once('.').map_or(self.0.as_str(), |(domain, _)| domain)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for EntityKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&EntityKey> for EntityKey {
    fn from(key: &EntityKey) -> Self {
        key.clone()
    }
}

impl AsRef<str> for EntityKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for EntityKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// ── StateValue ───────────────────────────────────────────────────────

/// Normalized entity state: a status string plus optional attributes.
///
/// A bare status is a `StateValue` with no attributes. Equality is
/// structural, so two values fetched at different times compare equal
/// when the hub reports the same thing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateValue {
    pub status: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
}

impl StateValue {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attributes(status: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            status: status.into(),
            attributes,
        }
    }

    /// The `"unavailable"` sentinel.
    pub fn unavailable() -> Self {
        Self::new(UNAVAILABLE)
    }

    pub fn is_unavailable(&self) -> bool {
        self.status == UNAVAILABLE
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Apply a partial change: a present status replaces the current one,
    /// listed attributes are replaced, `removed` attributes are dropped.
    pub fn patched(&self, status: Option<&str>, changed: &Attributes, removed: &[String]) -> Self {
        let mut next = self.clone();
        if let Some(status) = status {
            status.clone_into(&mut next.status);
        }
        for (name, value) in changed {
            next.attributes.insert(name.clone(), value.clone());
        }
        for name in removed {
            next.attributes.remove(name);
        }
        next
    }
}

impl From<&str> for StateValue {
    fn from(status: &str) -> Self {
        Self::new(status)
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.status)
    }
}

// ── EntityState (REST payload) ───────────────────────────────────────

/// One element of `GET /api/states`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: EntityKey,
    pub state: String,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub last_changed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl From<EntityState> for StateValue {
    fn from(state: EntityState) -> Self {
        Self::with_attributes(state.state, state.attributes)
    }
}
