//! Consumer callback trait and handle.
//!
//! A consumer is identified by its handle: two clones of one
//! [`ConsumerHandle`] are the same consumer, while two handles wrapping equal
//! values are distinct consumers with independent subscriptions and
//! independent delivery serialization.

use std::sync::Arc;

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

/// Callback target for dispatched values.
///
/// `consume` is invoked on a pool worker thread, sequentially per consumer:
/// no two invocations for the same handle overlap, across all of its keys.
/// The value arrives by shared reference; a value enqueued once is shared by
/// every subscriber.
///
/// Implementations should not panic. A panic is caught at the task boundary,
/// logged, and the offending value is skipped; implementations that can fail
/// should log and swallow the failure themselves.
pub trait Consumer<K, V>: Send + Sync {
    /// Handles one dispatched value.
    fn consume(&self, key: &K, value: &V);
}

/// Shared handle to a [`Consumer`].
///
/// Handle identity (the underlying allocation) keys subscriptions:
/// unsubscribing requires a clone of the handle that subscribed.
pub type ConsumerHandle<K, V> = Arc<dyn Consumer<K, V>>;

// ---------------------------------------------------------------------------
// FnConsumer (private adapter)
// ---------------------------------------------------------------------------

/// Adapter that wraps a closure into a [`Consumer`].
struct FnConsumer<F>(F);

impl<K, V, F> Consumer<K, V> for FnConsumer<F>
where
    F: Fn(&K, &V) + Send + Sync,
{
    fn consume(&self, key: &K, value: &V) {
        (self.0)(key, value);
    }
}

/// Creates a consumer handle from a closure.
///
/// # Example
///
/// ```rust,ignore
/// let consumer = consumer_fn(|key: &u32, value: &String| {
///     println!("key {key}: {value}");
/// });
/// mq.subscribe(&1, consumer);
/// ```
pub fn consumer_fn<K, V, F>(f: F) -> ConsumerHandle<K, V>
where
    K: 'static,
    V: 'static,
    F: Fn(&K, &V) + Send + Sync + 'static,
{
    Arc::new(FnConsumer(f))
}

// ===========================================================================
// Tests
// ===========================================================================
