use std::any::Any;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::age::age_display;

/// Immutable contents of one list query at a point in time.
pub type ListSnapshot<E> = Arc<Vec<E>>;

type Callback<E> = Arc<dyn Fn(ListSnapshot<E>) + Send + Sync>;

/// Identifies one cached read query: an entity kind plus optional parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
    entity: Cow<'static, str>,
    params: Vec<String>,
}

impl QueryKey {
    /// The unparameterized "list all" query for an entity kind.
    pub fn list(entity: &'static str) -> Self {
        Self {
            entity: Cow::Borrowed(entity),
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.params.push(param.into());
        self
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entity)?;
        for param in &self.params {
            write!(f, ":{}", param)?;
        }
        Ok(())
    }
}

/// One key's state. Snapshot and callbacks are type-erased so a single cache
/// can hold lists of every entity type.
#[derive(Default)]
struct Slot {
    snapshot: Option<Box<dyn Any + Send + Sync>>,
    cached_at: Option<DateTime<Utc>>,
    subscribers: Vec<(u64, Box<dyn Any + Send + Sync>)>,
    /// Bumped on every write
    version: u64,
    /// Version last handed to subscribers. Held while callbacks run.
    delivered: Arc<Mutex<u64>>,
}

impl Slot {
    fn snapshot<E: Send + Sync + 'static>(&self) -> Option<ListSnapshot<E>> {
        self.snapshot
            .as_ref()?
            .downcast_ref::<ListSnapshot<E>>()
            .cloned()
    }

    fn callbacks<E: Send + Sync + 'static>(&self) -> Vec<Callback<E>> {
        self.subscribers
            .iter()
            .filter_map(|(_, callback)| callback.downcast_ref::<Callback<E>>().cloned())
            .collect()
    }
}

/// Callbacks captured by one write, with its position in the key's order.
struct Delivery<E> {
    version: u64,
    delivered: Arc<Mutex<u64>>,
    callbacks: Vec<Callback<E>>,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<QueryKey, Slot>,
    next_subscriber_id: u64,
}

/// Shared list-query cache.
///
/// Clone is cheap and every clone sees the same data. The lock is only held
/// for map access, never while subscriber callbacks run, so callbacks may
/// read the cache. Callbacks must not write to the key they observe.
#[derive(Clone, Default)]
pub struct QueryCache {
    inner: Arc<Mutex<Inner>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking subscriber cannot leave the map half-written
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current snapshot for `key`, or `None` if the query was never populated
    /// (or was populated with a different entity type).
    pub fn get<E: Send + Sync + 'static>(&self, key: &QueryKey) -> Option<ListSnapshot<E>> {
        self.lock().slots.get(key)?.snapshot()
    }

    /// Replace the snapshot for `key` and notify its subscribers.
    pub fn set<E: Send + Sync + 'static>(&self, key: &QueryKey, entities: Vec<E>) {
        self.set_with(key, || entities);
    }

    /// Replace the snapshot for `key` with the list `build` returns.
    ///
    /// `build` runs under the store lock, so no other write to the cache can
    /// land between computing the list and storing it. It must not call back
    /// into this cache.
    pub fn set_with<E, F>(&self, key: &QueryKey, build: F) -> ListSnapshot<E>
    where
        E: Send + Sync + 'static,
        F: FnOnce() -> Vec<E>,
    {
        let (snapshot, delivery) = {
            let mut inner = self.lock();
            let snapshot = Arc::new(build());
            let delivery = Self::store(&mut *inner, key, snapshot.clone());
            (snapshot, delivery)
        };
        Self::notify(key, &snapshot, delivery);
        snapshot
    }

    /// Atomic read-modify-write of a populated snapshot.
    ///
    /// `f` receives the current entities and returns the next list (or `None`
    /// to leave the cache untouched) plus a value handed back to the caller.
    /// Returns `None` without calling `f` if the key has no snapshot.
    pub fn update<E, R, F>(&self, key: &QueryKey, f: F) -> Option<R>
    where
        E: Send + Sync + 'static,
        F: FnOnce(&[E]) -> (Option<Vec<E>>, R),
    {
        let (written, result) = {
            let mut inner = self.lock();
            let current: ListSnapshot<E> = inner.slots.get(key)?.snapshot()?;
            let (next, result) = f(current.as_slice());
            let written = next.map(|entities| {
                let snapshot = Arc::new(entities);
                let delivery = Self::store(&mut *inner, key, snapshot.clone());
                (snapshot, delivery)
            });
            (written, result)
        };
        if let Some((snapshot, delivery)) = written {
            Self::notify(key, &snapshot, delivery);
        }
        Some(result)
    }

    /// Register a callback invoked with every new snapshot written to `key`.
    ///
    /// The callback is removed when the returned `Subscription` is dropped or
    /// explicitly unsubscribed.
    pub fn subscribe<E, F>(&self, key: &QueryKey, callback: F) -> Subscription
    where
        E: Send + Sync + 'static,
        F: Fn(ListSnapshot<E>) + Send + Sync + 'static,
    {
        let callback: Callback<E> = Arc::new(callback);
        let mut inner = self.lock();
        inner.next_subscriber_id += 1;
        let id = inner.next_subscriber_id;
        inner
            .slots
            .entry(key.clone())
            .or_default()
            .subscribers
            .push((id, Box::new(callback)));

        Subscription {
            cache: Arc::downgrade(&self.inner),
            key: key.clone(),
            id,
            active: true,
        }
    }

    /// Number of live subscriptions on `key`.
    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        self.lock()
            .slots
            .get(key)
            .map(|slot| slot.subscribers.len())
            .unwrap_or(0)
    }

    /// Drop the snapshot for `key` so the next read reports "not loaded".
    /// Subscribers stay registered and are not notified.
    pub fn invalidate(&self, key: &QueryKey) {
        if let Some(slot) = self.lock().slots.get_mut(key) {
            slot.snapshot = None;
            slot.cached_at = None;
            debug!(query = %key, "cache invalidated");
        }
    }

    /// When `key` was last written, if it holds a snapshot.
    pub fn updated_at(&self, key: &QueryKey) -> Option<DateTime<Utc>> {
        self.lock().slots.get(key)?.cached_at
    }

    /// True if `key` has no snapshot or its last write is older than `max_age`.
    pub fn is_stale(&self, key: &QueryKey, max_age: Duration) -> bool {
        match self.updated_at(key) {
            Some(cached_at) => Utc::now() - cached_at > max_age,
            None => true,
        }
    }

    /// Human-readable age of the snapshot for `key`.
    pub fn age_display(&self, key: &QueryKey) -> Option<String> {
        self.updated_at(key).map(age_display)
    }

    fn store<E: Send + Sync + 'static>(
        inner: &mut Inner,
        key: &QueryKey,
        snapshot: ListSnapshot<E>,
    ) -> Delivery<E> {
        let slot = inner.slots.entry(key.clone()).or_default();
        slot.snapshot = Some(Box::new(snapshot));
        slot.cached_at = Some(Utc::now());
        slot.version += 1;
        Delivery {
            version: slot.version,
            delivered: slot.delivered.clone(),
            callbacks: slot.callbacks(),
        }
    }

    /// Hand `snapshot` to the subscribers captured at write time.
    ///
    /// Deliveries for one key are serialized, and a snapshot is dropped if a
    /// newer one has already been delivered, so subscribers always end on the
    /// latest write even when writers race on different threads.
    fn notify<E>(key: &QueryKey, snapshot: &ListSnapshot<E>, delivery: Delivery<E>) {
        let mut delivered = delivery
            .delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *delivered > delivery.version {
            debug!(query = %key, version = delivery.version, "cache write superseded, not delivered");
            return;
        }
        *delivered = delivery.version;
        debug!(
            query = %key,
            len = snapshot.len(),
            version = delivery.version,
            subscribers = delivery.callbacks.len(),
            "cache write"
        );
        for callback in delivery.callbacks {
            callback(snapshot.clone());
        }
    }
}

/// Handle for a registered cache subscriber.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    cache: Weak<Mutex<Inner>>,
    key: QueryKey,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let Some(cache) = self.cache.upgrade() else {
            return;
        };
        let mut inner = cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = inner.slots.get_mut(&self.key) {
            slot.subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn states() -> QueryKey {
        QueryKey::list("state")
    }

    #[test]
    fn test_get_unpopulated_is_none() {
        let cache = QueryCache::new();
        assert!(cache.get::<String>(&states()).is_none());
        assert!(cache.is_stale(&states(), Duration::minutes(5)));
        assert!(cache.age_display(&states()).is_none());
    }

    #[test]
    fn test_set_then_get() {
        let cache = QueryCache::new();
        cache.set(&states(), vec!["Arizona".to_string(), "Texas".to_string()]);

        let snapshot = cache.get::<String>(&states()).expect("populated");
        assert_eq!(snapshot.as_slice(), ["Arizona", "Texas"]);
        assert!(!cache.is_stale(&states(), Duration::minutes(5)));
        assert_eq!(cache.age_display(&states()).as_deref(), Some("just now"));
    }

    #[test]
    fn test_clones_share_data() {
        let cache = QueryCache::new();
        let other = cache.clone();
        cache.set(&states(), vec![1u32, 2, 3]);
        assert_eq!(other.get::<u32>(&states()).map(|s| s.len()), Some(3));
    }

    #[test]
    fn test_wrong_type_reads_as_unpopulated() {
        let cache = QueryCache::new();
        cache.set(&states(), vec![1u32]);
        assert!(cache.get::<String>(&states()).is_none());
    }

    #[test]
    fn test_subscriber_notified_once_per_set() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let last_len = Arc::new(AtomicUsize::new(0));

        let sub = {
            let calls = calls.clone();
            let last_len = last_len.clone();
            cache.subscribe(&states(), move |snapshot: ListSnapshot<u32>| {
                calls.fetch_add(1, Ordering::SeqCst);
                last_len.store(snapshot.len(), Ordering::SeqCst);
            })
        };

        cache.set(&states(), vec![1u32]);
        cache.set(&states(), vec![1u32, 2]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(last_len.load(Ordering::SeqCst), 2);

        // Other keys don't reach this subscriber
        cache.set(&QueryKey::list("city"), vec![9u32]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        sub.unsubscribe();
        cache.set(&states(), vec![1u32, 2, 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.subscriber_count(&states()), 0);
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let cache = QueryCache::new();
        {
            let _sub = cache.subscribe(&states(), |_: ListSnapshot<u32>| {});
            assert_eq!(cache.subscriber_count(&states()), 1);
        }
        assert_eq!(cache.subscriber_count(&states()), 0);
    }

    #[test]
    fn test_subscriber_can_read_cache() {
        let cache = QueryCache::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let reader = cache.clone();
            let seen = seen.clone();
            cache.subscribe(&states(), move |_: ListSnapshot<u32>| {
                let len = reader.get::<u32>(&states()).map(|s| s.len()).unwrap_or(0);
                seen.store(len, Ordering::SeqCst);
            })
        };
        cache.set(&states(), vec![4u32, 5]);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_racing_writers_deliver_in_write_order() {
        const THREADS: usize = 8;
        const WRITES: usize = 50;

        let cache = QueryCache::new();
        cache.set(&states(), Vec::<u32>::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let seen = seen.clone();
            cache.subscribe(&states(), move |snapshot: ListSnapshot<u32>| {
                seen.lock().expect("lock").push(snapshot.len());
            })
        };

        std::thread::scope(|scope| {
            for t in 0..THREADS {
                let cache = cache.clone();
                scope.spawn(move || {
                    for _ in 0..WRITES {
                        cache.update(&states(), |current: &[u32]| {
                            let mut next = current.to_vec();
                            next.push(t as u32);
                            (Some(next), ())
                        });
                    }
                });
            }
        });

        let seen = seen.lock().expect("lock");
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "deliveries went backwards");
        assert_eq!(seen.last().copied(), Some(THREADS * WRITES));
        assert_eq!(cache.get::<u32>(&states()).map(|s| s.len()), Some(THREADS * WRITES));
    }

    #[test]
    fn test_set_with_returns_stored_snapshot() {
        let cache = QueryCache::new();
        let snapshot = cache.set_with(&states(), || vec![7u32, 8]);
        assert_eq!(snapshot.as_slice(), [7, 8]);
        assert!(Arc::ptr_eq(&snapshot, &cache.get::<u32>(&states()).expect("set")));
    }

    #[test]
    fn test_update_skips_unpopulated_key() {
        let cache = QueryCache::new();
        let called = cache.update(&states(), |_: &[u32]| (Some(vec![1]), ()));
        assert!(called.is_none());
        assert!(cache.get::<u32>(&states()).is_none());
    }

    #[test]
    fn test_update_writes_and_returns_value() {
        let cache = QueryCache::new();
        cache.set(&states(), vec![1u32, 2]);

        let len = cache.update(&states(), |current: &[u32]| {
            let mut next = current.to_vec();
            next.push(3);
            (Some(next), current.len())
        });
        assert_eq!(len, Some(2));
        assert_eq!(cache.get::<u32>(&states()).expect("set").as_slice(), [1, 2, 3]);

        // None leaves the snapshot alone and does not notify
        let calls = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let calls = calls.clone();
            cache.subscribe(&states(), move |_: ListSnapshot<u32>| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        cache.update(&states(), |_: &[u32]| (None, ()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalidate() {
        let cache = QueryCache::new();
        cache.set(&states(), vec![1u32]);
        cache.invalidate(&states());
        assert!(cache.get::<u32>(&states()).is_none());
        assert!(cache.updated_at(&states()).is_none());
    }

    #[test]
    fn test_query_key_display() {
        assert_eq!(states().to_string(), "state");
        assert_eq!(
            QueryKey::list("city").with_param("state=7").to_string(),
            "city:state=7"
        );
    }
}
