// ── Pending fetch batch ──
//
// Keys requested while no fresh value is cached accumulate here until the
// batch timer fires. The first enqueue of a cycle arms the timer; later
// enqueues only join. Taking the batch disarms it.
//
// A batch remembers when its first key arrived; fetched values are stamped
// with that time so a push received while the batch waits is not undone.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use homesync_api::{EntityKey, StateValue};
use tokio::sync::oneshot;

type Waiter = oneshot::Sender<StateValue>;

#[derive(Default)]
pub(crate) struct PendingBatch {
    keys: BTreeSet<EntityKey>,
    waiters: HashMap<EntityKey, Vec<Waiter>>,
    opened_at: Option<DateTime<Utc>>,
    armed: bool,
}

impl PendingBatch {
    /// Add `key` (and optionally a waiter for it) to the current batch.
    ///
    /// Returns `true` when the caller must arm the batch timer.
    pub(crate) fn enqueue(
        &mut self,
        key: EntityKey,
        waiter: Option<Waiter>,
        now: DateTime<Utc>,
    ) -> bool {
        self.opened_at.get_or_insert(now);
        if let Some(waiter) = waiter {
            self.waiters.entry(key.clone()).or_default().push(waiter);
        }
        self.keys.insert(key);
        !std::mem::replace(&mut self.armed, true)
    }

    pub(crate) fn take(&mut self) -> TakenBatch {
        self.armed = false;
        TakenBatch {
            keys: std::mem::take(&mut self.keys),
            waiters: std::mem::take(&mut self.waiters),
            opened_at: self.opened_at.take().unwrap_or_else(Utc::now),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }
}

/// A batch removed from the pending set, ready to fetch.
pub(crate) struct TakenBatch {
    pub(crate) keys: BTreeSet<EntityKey>,
    /// When the first key joined.
    pub(crate) opened_at: DateTime<Utc>,
    waiters: HashMap<EntityKey, Vec<Waiter>>,
}

impl TakenBatch {
    /// Hand every waiter the value `resolve` picks for its key.
    pub(crate) fn resolve_with(self, resolve: impl Fn(&EntityKey) -> StateValue) {
        for (key, waiters) in self.waiters {
            let value = resolve(&key);
            for waiter in waiters {
                // The getter may have given up already.
                let _ = waiter.send(value.clone());
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn only_first_enqueue_arms_the_timer() {
        let mut batch = PendingBatch::default();
        let now = Utc::now();
        assert!(batch.enqueue(EntityKey::from("a.one"), None, now));
        assert!(!batch.enqueue(EntityKey::from("a.two"), None, now));
        assert!(!batch.enqueue(EntityKey::from("a.one"), None, now));
        assert_eq!(batch.len(), 2);

        let taken = batch.take();
        assert_eq!(taken.keys.len(), 2);
        assert!(batch.enqueue(EntityKey::from("a.three"), None, now));
    }

    #[test]
    fn batch_is_stamped_with_first_enqueue() {
        let mut batch = PendingBatch::default();
        let first = Utc::now() - chrono::TimeDelta::milliseconds(40);
        batch.enqueue(EntityKey::from("a.one"), None, first);
        batch.enqueue(EntityKey::from("a.two"), None, Utc::now());

        assert_eq!(batch.take().opened_at, first);

        let later = Utc::now();
        batch.enqueue(EntityKey::from("a.three"), None, later);
        assert_eq!(batch.take().opened_at, later);
    }

    #[tokio::test]
    async fn every_waiter_for_a_key_is_resolved() {
        let mut batch = PendingBatch::default();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        batch.enqueue(EntityKey::from("a.one"), Some(tx1), Utc::now());
        batch.enqueue(EntityKey::from("a.one"), Some(tx2), Utc::now());

        batch
            .take()
            .resolve_with(|key| StateValue::new(format!("{key}-value")));

        assert_eq!(rx1.await.unwrap().status, "a.one-value");
        assert_eq!(rx2.await.unwrap().status, "a.one-value");
    }
}
