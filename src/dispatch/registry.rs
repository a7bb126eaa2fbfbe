//! Top-level dispatch facade.
//!
//! [`MultiQueueProcessor`] ties the engine together: a reader/writer lock
//! over two maps, `{key -> (log, subscriber ids)}` and
//! `{consumer id -> processor}`. Subscribe and unsubscribe take the write
//! side; enqueue takes the read side just long enough to clone the per-key
//! log handle, then appends outside the lock so producers never contend with
//! each other on anything but the target key.
//!
//! # Thread Safety
//!
//! All operations are callable concurrently from any thread. Nothing is
//! raised to the caller: unknown keys, duplicate subscriptions, and unknown
//! unsubscriptions are absorbed silently, which keeps producers free of any
//! knowledge about which keys currently have subscribers.

use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::{Arc, Weak};

use fxhash::{FxBuildHasher, FxHashMap};
use parking_lot::RwLock;

use crate::dispatch::consumer::ConsumerHandle;
use crate::dispatch::data::DataManager;
use crate::dispatch::processor::ConsumerProcessor;
use crate::dispatch::source::SourceObserver;
use crate::pool::ThreadPool;

/// Consumer identity: the address of the handle's allocation.
type ConsumerId = usize;

fn consumer_id<K, V>(consumer: &ConsumerHandle<K, V>) -> ConsumerId {
    Arc::as_ptr(consumer).cast::<()>() as usize
}

/// Per-key registry entry: the shared log plus subscriber identities in
/// subscription order.
struct KeyEntry<K, V> {
    data: Arc<DataManager<K, V>>,
    subscribers: Vec<ConsumerId>,
}

/// Both registry maps, guarded by one reader/writer lock.
struct Registry<K, V, S> {
    keys: HashMap<K, KeyEntry<K, V>, S>,
    consumers: FxHashMap<ConsumerId, Arc<ConsumerProcessor<K, V, S>>>,
}

// ---------------------------------------------------------------------------
// MultiQueueProcessor
// ---------------------------------------------------------------------------

/// Multi-producer / multi-consumer dispatch engine keyed by `K`.
///
/// Producers call [`enqueue`](Self::enqueue); consumers receive values
/// through their [`Consumer`](crate::dispatch::Consumer) callback on the
/// supplied pool, sequentially per consumer and in enqueue order per
/// (consumer, key).
///
/// A value enqueued for a key with N subscribers is stored once and shared;
/// it is buffered until the last subscriber that still needs it has moved
/// past it. Values enqueued before a subscription are invisible to it.
///
/// Dropping the engine stops every remaining cursor; tasks already handed to
/// the pool observe the teardown through their weak references and finish
/// without calling any consumer. Stopping the pool itself is the caller's
/// responsibility.
pub struct MultiQueueProcessor<K, V, S = FxBuildHasher> {
    pool: Arc<dyn ThreadPool>,
    inner: RwLock<Registry<K, V, S>>,
}

impl<K, V, S> MultiQueueProcessor<K, V, S>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Default + Send + Sync + 'static,
{
    /// Creates an engine dispatching on `pool`.
    #[must_use]
    pub fn new(pool: Arc<dyn ThreadPool>) -> Self {
        Self {
            pool,
            inner: RwLock::new(Registry {
                keys: HashMap::default(),
                consumers: FxHashMap::default(),
            }),
        }
    }

    /// Subscribes `consumer` to value notifications for `key`.
    ///
    /// The consumer starts observing values enqueued after this call; prior
    /// values are invisible. A repeated subscription of the same handle to
    /// the same key is a silent no-op. Distinct handles are distinct
    /// consumers, each receiving every value.
    pub fn subscribe(&self, key: &K, consumer: ConsumerHandle<K, V>) {
        let id = consumer_id(&consumer);
        let mut guard = self.inner.write();
        let registry = &mut *guard;

        let entry = registry
            .keys
            .entry(key.clone())
            .or_insert_with(|| KeyEntry {
                data: Arc::new(DataManager::new(key.clone())),
                subscribers: Vec::new(),
            });
        if entry.subscribers.contains(&id) {
            return;
        }

        let processor = registry
            .consumers
            .entry(id)
            .or_insert_with(|| ConsumerProcessor::new(consumer, Arc::clone(&self.pool)));

        let processor_dyn: Arc<dyn SourceObserver<K, V>> = Arc::clone(processor) as Arc<dyn SourceObserver<K, V>>;
        let observer: Weak<dyn SourceObserver<K, V>> = Arc::downgrade(&processor_dyn);
        let cursor = Arc::clone(&entry.data).create_cursor(observer);
        processor.add_subscription(key.clone(), cursor);
        entry.subscribers.push(id);
    }

    /// Removes `consumer`'s subscription to `key`.
    ///
    /// Requires a clone of the handle that subscribed. Unknown keys and
    /// non-subscribed handles are silent no-ops. The consumer may still
    /// observe one in-flight notification that started before this call;
    /// its handle stays alive until that notification finishes.
    pub fn unsubscribe(&self, key: &K, consumer: &ConsumerHandle<K, V>) {
        let id = consumer_id(consumer);
        let mut guard = self.inner.write();
        let registry = &mut *guard;

        let Some(entry) = registry.keys.get_mut(key) else {
            return;
        };
        let Some(index) = entry.subscribers.iter().position(|&s| s == id) else {
            return;
        };
        entry.subscribers.remove(index);
        if entry.subscribers.is_empty() {
            registry.keys.remove(key);
        }

        if let Some(processor) = registry.consumers.get(&id) {
            processor.remove_subscription(key);
            if !processor.has_subscriptions() {
                registry.consumers.remove(&id);
            }
        }
    }

    /// Enqueues an owned value for `key`.
    ///
    /// The value is moved into the key's log; no copy is made regardless of
    /// subscriber count. Without subscribers the value is dropped and no
    /// state is created.
    pub fn enqueue(&self, key: &K, value: V) {
        if let Some(data) = self.data_for(key) {
            data.add_value(value);
        }
    }

    /// Enqueues a borrowed value for `key`, cloning it exactly once.
    ///
    /// The clone only happens when the key has subscribers.
    pub fn enqueue_ref(&self, key: &K, value: &V)
    where
        V: Clone,
    {
        if let Some(data) = self.data_for(key) {
            data.add_value(value.clone());
        }
    }

    /// Returns the number of keys with at least one subscriber.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.inner.read().keys.len()
    }

    /// Returns the number of distinct subscribed consumers.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.inner.read().consumers.len()
    }

    /// Clones the log handle for `key` under the read lock.
    fn data_for(&self, key: &K) -> Option<Arc<DataManager<K, V>>> {
        self.inner
            .read()
            .keys
            .get(key)
            .map(|entry| Arc::clone(&entry.data))
    }
}

impl<K, V, S> std::fmt::Debug for MultiQueueProcessor<K, V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.inner.read();
        f.debug_struct("MultiQueueProcessor")
            .field("keys", &registry.keys.len())
            .field("consumers", &registry.consumers.len())
            .finish_non_exhaustive()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
