// ── Subscription registry ──
//
// Per-key observer lists with priority ordering. The registry only
// delivers; deciding *when* a subscriber hears about a value (immediate
// delivery, background fetch) belongs to the state cache.

use std::collections::{BTreeSet, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use homesync_api::{EntityKey, StateValue};
use strum::{Display, EnumString};

/// Delivery priority within one key. Higher runs first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Subscriber callback: `(key, new value)`.
pub type StateCallback = Arc<dyn Fn(&EntityKey, &StateValue) + Send + Sync>;

/// Options for [`StateCache::subscribe`](crate::StateCache::subscribe).
#[derive(Debug, Clone, Copy)]
pub struct SubscribeOptions {
    /// Deliver the current value as soon as one is known.
    pub immediate: bool,
    pub priority: Priority,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            immediate: true,
            priority: Priority::Normal,
        }
    }
}

impl SubscribeOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn deferred(mut self) -> Self {
        self.immediate = false;
        self
    }
}

#[derive(Clone)]
struct Subscriber {
    id: u64,
    priority: Priority,
    callback: StateCallback,
    /// Set once the subscriber has seen any value.
    delivered: Arc<AtomicBool>,
}

#[derive(Default)]
struct RegistryInner {
    buckets: Mutex<HashMap<EntityKey, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl RegistryInner {
    fn buckets(&self) -> MutexGuard<'_, HashMap<EntityKey, Vec<Subscriber>>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, key: &EntityKey, id: u64) -> bool {
        let mut buckets = self.buckets();
        let Some(bucket) = buckets.get_mut(key) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|s| s.id != id);
        let removed = bucket.len() != before;
        if bucket.is_empty() {
            buckets.remove(key);
        }
        removed
    }
}

/// Shared registry handle. Cloning is cheap.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        key: EntityKey,
        callback: StateCallback,
        priority: Priority,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Subscriber {
            id,
            priority,
            callback,
            delivered: Arc::new(AtomicBool::new(false)),
        };

        let mut buckets = self.inner.buckets();
        let bucket = buckets.entry(key.clone()).or_default();
        // After every subscriber of equal or higher priority.
        let at = bucket
            .iter()
            .position(|s| s.priority < priority)
            .unwrap_or(bucket.len());
        bucket.insert(at, subscriber);
        drop(buckets);

        tracing::debug!(key = %key, id, %priority, "subscriber registered");
        Subscription {
            registry: Arc::downgrade(&self.inner),
            key,
            id,
        }
    }

    /// Remove one subscriber. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, key: &EntityKey, id: u64) -> bool {
        self.inner.remove(key, id)
    }

    /// Fan `value` out to every subscriber of `key` in priority order.
    ///
    /// Callbacks run on a snapshot, outside the lock, so they may subscribe
    /// or unsubscribe freely. Returns how many callbacks completed.
    pub fn notify(&self, key: &EntityKey, value: &StateValue) -> usize {
        let snapshot = match self.inner.buckets().get(key) {
            Some(bucket) => bucket.clone(),
            None => return 0,
        };
        snapshot
            .iter()
            .filter(|subscriber| invoke(subscriber, key, value))
            .count()
    }

    /// Deliver `value` to subscriber `id` if it has not seen any value yet.
    pub(crate) fn deliver_pending(&self, key: &EntityKey, id: u64, value: &StateValue) -> bool {
        let subscriber = self
            .inner
            .buckets()
            .get(key)
            .and_then(|bucket| bucket.iter().find(|s| s.id == id).cloned());
        match subscriber {
            Some(s) if !s.delivered.load(Ordering::Acquire) => invoke(&s, key, value),
            _ => false,
        }
    }

    /// Keys with at least one subscriber.
    pub fn keys(&self) -> BTreeSet<EntityKey> {
        self.inner.buckets().keys().cloned().collect()
    }

    pub fn key_count(&self) -> usize {
        self.inner.buckets().len()
    }

    pub fn subscriber_count(&self, key: &EntityKey) -> usize {
        self.inner.buckets().get(key).map_or(0, Vec::len)
    }
}

fn invoke(subscriber: &Subscriber, key: &EntityKey, value: &StateValue) -> bool {
    subscriber.delivered.store(true, Ordering::Release);
    let callback = &subscriber.callback;
    match catch_unwind(AssertUnwindSafe(|| callback(key, value))) {
        Ok(()) => true,
        Err(_) => {
            tracing::error!(key = %key, id = subscriber.id, "subscriber callback panicked");
            false
        }
    }
}

// ── Subscription handle ──────────────────────────────────────────────

/// Handle to one registered callback.
///
/// Dropping the handle does **not** unsubscribe; call
/// [`Subscription::unsubscribe`].
#[must_use = "keep the handle to be able to unsubscribe"]
#[derive(Debug)]
pub struct Subscription {
    registry: Weak<RegistryInner>,
    key: EntityKey,
    id: u64,
}

impl Subscription {
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.registry.upgrade().is_some_and(|inner| {
            inner
                .buckets()
                .get(&self.key)
                .is_some_and(|bucket| bucket.iter().any(|s| s.id == self.id))
        })
    }

    /// Remove this callback. Other subscribers of the key are untouched.
    pub fn unsubscribe(self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|inner| inner.remove(&self.key, self.id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &str) -> StateCallback {
        let log = Arc::clone(log);
        let name = name.to_owned();
        Arc::new(move |_key: &EntityKey, value: &StateValue| {
            log.lock().unwrap().push(format!("{name}:{}", value.status));
        })
    }

    #[test]
    fn delivers_by_priority_then_registration_order() {
        let registry = SubscriptionRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let key = EntityKey::from("light.kitchen");

        let _low = registry.register(key.clone(), recorder(&log, "low"), Priority::Low);
        let _n1 = registry.register(key.clone(), recorder(&log, "normal-1"), Priority::Normal);
        let _high = registry.register(key.clone(), recorder(&log, "high"), Priority::High);
        let _n2 = registry.register(key.clone(), recorder(&log, "normal-2"), Priority::Normal);

        registry.notify(&key, &StateValue::new("on"));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["high:on", "normal-1:on", "normal-2:on", "low:on"]
        );
    }

    #[test]
    fn unsubscribing_one_leaves_the_others() {
        let registry = SubscriptionRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let key = EntityKey::from("switch.fan");

        let first = registry.register(key.clone(), recorder(&log, "first"), Priority::Normal);
        let second = registry.register(key.clone(), recorder(&log, "second"), Priority::Normal);

        assert!(first.unsubscribe());
        registry.notify(&key, &StateValue::new("off"));

        assert_eq!(*log.lock().unwrap(), vec!["second:off"]);
        assert!(second.is_active());
        assert_eq!(registry.subscriber_count(&key), 1);
    }

    #[test]
    fn last_unsubscribe_removes_the_key() {
        let registry = SubscriptionRegistry::new();
        let key = EntityKey::from("sensor.temp");
        let sub = registry.register(key.clone(), Arc::new(|_: &EntityKey, _: &StateValue| {}), Priority::Normal);

        assert_eq!(registry.key_count(), 1);
        assert!(sub.unsubscribe());
        assert_eq!(registry.key_count(), 0);
        assert!(registry.keys().is_empty());
    }

    #[test]
    fn panicking_callback_does_not_stop_fan_out() {
        let registry = SubscriptionRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let key = EntityKey::from("sensor.flaky");

        let _boom = registry.register(
            key.clone(),
            Arc::new(|_: &EntityKey, _: &StateValue| panic!("widget exploded")),
            Priority::High,
        );
        let _ok = registry.register(key.clone(), recorder(&log, "ok"), Priority::Low);

        let completed = registry.notify(&key, &StateValue::new("3"));

        assert_eq!(completed, 1);
        assert_eq!(*log.lock().unwrap(), vec!["ok:3"]);
    }

    #[test]
    fn deliver_pending_skips_subscribers_that_already_saw_a_value() {
        let registry = SubscriptionRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let key = EntityKey::from("light.hall");
        let sub = registry.register(key.clone(), recorder(&log, "s"), Priority::Normal);

        registry.notify(&key, &StateValue::new("on"));
        assert!(!registry.deliver_pending(&key, sub.id(), &StateValue::new("on")));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn callbacks_may_unsubscribe_during_fan_out() {
        let registry = SubscriptionRegistry::new();
        let key = EntityKey::from("light.porch");
        let handle: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&handle);
        let sub = registry.register(
            key.clone(),
            Arc::new(move |_: &EntityKey, _: &StateValue| {
                if let Some(sub) = slot.lock().unwrap().take() {
                    sub.unsubscribe();
                }
            }),
            Priority::Normal,
        );
        *handle.lock().unwrap() = Some(sub);

        registry.notify(&key, &StateValue::new("on"));
        assert_eq!(registry.subscriber_count(&key), 0);
    }
}
