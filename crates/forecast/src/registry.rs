//! Change subscribers.
//!
//! Subscribers are called synchronously, in registration order, after a new
//! snapshot is installed. Only keys that were added, changed or removed are
//! reported, and a snapshot that changes nothing notifies nobody.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use common::{ForecastSnapshot, ReadingKey};
use dashmap::DashMap;
use tracing::debug;

/// What a subscriber receives.
#[derive(Debug, Clone)]
pub struct SnapshotUpdate {
    pub snapshot: Arc<ForecastSnapshot>,
    pub changed: BTreeSet<ReadingKey>,
}

pub trait ForecastSubscriber: Send + Sync {
    fn on_update(&self, update: &SnapshotUpdate);
}

impl<F> ForecastSubscriber for F
where
    F: Fn(&SnapshotUpdate) + Send + Sync,
{
    fn on_update(&self, update: &SnapshotUpdate) {
        self(update)
    }
}

/// Returned by `subscribe`; pass back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: DashMap<u64, Arc<dyn ForecastSubscriber>>,
    next_id: AtomicU64,
}

impl fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn ForecastSubscriber>) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, subscriber);
        SubscriptionHandle(id)
    }

    /// Returns false if the handle was already removed. Safe to call from
    /// inside a subscriber callback.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.subscribers.remove(&handle.0).is_some()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Deliver `new` to every subscriber. Returns how many were called.
    pub fn notify(&self, old: Option<&ForecastSnapshot>, new: &Arc<ForecastSnapshot>) -> usize {
        let changed = changed_keys(old, new);
        if changed.is_empty() {
            debug!(
                "Snapshot {} for {} changed nothing; no notification",
                new.sequence(),
                new.location_id()
            );
            return 0;
        }

        // Clone out of the map so no shard lock is held while user code runs.
        let mut targets: Vec<(u64, Arc<dyn ForecastSubscriber>)> = self
            .subscribers
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        targets.sort_by_key(|(id, _)| *id);

        let update = SnapshotUpdate {
            snapshot: Arc::clone(new),
            changed,
        };

        let mut delivered = 0;
        for (id, subscriber) in targets {
            if !self.subscribers.contains_key(&id) {
                continue;
            }
            subscriber.on_update(&update);
            delivered += 1;
        }
        delivered
    }
}

/// Keys whose value differs between `old` and `new`, including keys present
/// in only one of them. With no `old`, every key of `new` counts.
pub fn changed_keys(old: Option<&ForecastSnapshot>, new: &ForecastSnapshot) -> BTreeSet<ReadingKey> {
    let new_values = new.values_by_key();
    let Some(old) = old else {
        return new_values.into_keys().cloned().collect();
    };
    let old_values = old.values_by_key();

    let mut changed: BTreeSet<ReadingKey> = new_values
        .iter()
        .filter(|(key, value)| old_values.get(*key) != Some(*value))
        .map(|(key, _)| (*key).clone())
        .collect();
    changed.extend(
        old_values
            .keys()
            .filter(|key| !new_values.contains_key(*key))
            .map(|key| (*key).clone()),
    );
    changed
}
