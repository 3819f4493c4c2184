// ── Batched state fetch seam ──
//
// The state cache and the polling scheduler only need "give me the
// current state of these keys". `RestClient` is the production
// implementation; tests substitute counting fakes.

use std::collections::{BTreeSet, HashMap};

use futures_util::future::BoxFuture;

use crate::model::{EntityKey, StateValue};

/// Resolves a set of entity keys to their current state in one round trip.
///
/// Implementations never fail: every requested key must be present in the
/// returned map, resolving to [`StateValue::unavailable`] when the hub does
/// not know it or cannot be reached.
pub trait StateFetcher: Send + Sync {
    fn request_once<'a>(
        &'a self,
        keys: &'a BTreeSet<EntityKey>,
    ) -> BoxFuture<'a, HashMap<EntityKey, StateValue>>;
}

/// Fill in the sentinel for every requested key missing from `found`.
pub fn complete_with_unavailable(
    keys: &BTreeSet<EntityKey>,
    mut found: HashMap<EntityKey, StateValue>,
) -> HashMap<EntityKey, StateValue> {
    found.retain(|key, _| keys.contains(key));
    for key in keys {
        found
            .entry(key.clone())
            .or_insert_with(StateValue::unavailable);
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_become_unavailable_and_extras_are_dropped() {
        let keys: BTreeSet<EntityKey> = ["a.one", "a.two"].into_iter().map(EntityKey::from).collect();
        let mut found = HashMap::new();
        found.insert(EntityKey::from("a.one"), StateValue::new("on"));
        found.insert(EntityKey::from("a.extra"), StateValue::new("off"));

        let done = complete_with_unavailable(&keys, found);
        assert_eq!(done.len(), 2);
        assert_eq!(done["a.one"].status, "on");
        assert!(done["a.two"].is_unavailable());
    }
}
