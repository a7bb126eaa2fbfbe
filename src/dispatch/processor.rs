//! Per-consumer scheduler bridging cursor wake-ups to the pool.
//!
//! A [`ConsumerProcessor`] owns one consumer's cursors and upholds the two
//! delivery guarantees: at most one task in flight per consumer across all
//! of its keys, and best-effort fairness between keys with pending work.
//!
//! ## Scheduling
//!
//! A wake-up either starts a task immediately (processor idle) or records
//! the cursor in a FIFO of pending work. Every task delivers exactly one
//! value, then hands control back: the processor re-queues the cursor if it
//! still has backlog and starts a task for the oldest pending cursor, so a
//! consumer subscribed to several busy keys round-robins between them.
//!
//! ## Task safety
//!
//! Tasks capture only weak references to the processor and the cursor; they
//! run safely after either is torn down. A panicking consumer callback is
//! contained at the task boundary and the processor keeps draining.

use std::collections::{HashMap, VecDeque};
use std::hash::{BuildHasher, Hash};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use fxhash::FxBuildHasher;
use parking_lot::Mutex;

use crate::dispatch::consumer::ConsumerHandle;
use crate::dispatch::source::{Cursor, SourceObserver};
use crate::pool::{GroupToken, Task, ThreadPool};

/// Delivery state of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// No task in flight.
    Free,
    /// A task is submitted or running; new wake-ups queue up.
    Processing,
}

/// State guarded by the processor's mutex.
struct ProcessorState<K, V, S> {
    mode: Mode,
    /// Cursors with pending work, oldest wake-up first.
    pending: VecDeque<Weak<Cursor<K, V>>>,
    /// Current subscriptions, one cursor per key.
    sources: HashMap<K, Arc<Cursor<K, V>>, S>,
}

// ---------------------------------------------------------------------------
// ConsumerProcessor
// ---------------------------------------------------------------------------

/// Scheduler for one consumer.
///
/// Created per consumer handle by the registry; lives while the consumer has
/// at least one subscription. Dropping the processor stops its remaining
/// cursors.
pub struct ConsumerProcessor<K, V, S = FxBuildHasher> {
    consumer: ConsumerHandle<K, V>,
    /// Stable token so the pool may serialize this consumer onto one worker.
    token: GroupToken,
    pool: Arc<dyn ThreadPool>,
    me: Weak<ConsumerProcessor<K, V, S>>,
    state: Mutex<ProcessorState<K, V, S>>,
}

impl<K, V, S> ConsumerProcessor<K, V, S>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Default + Send + 'static,
{
    /// Creates a processor for `consumer`, executing on `pool`.
    ///
    /// The group token is derived from the handle address, so all of this
    /// consumer's tasks share one token.
    #[must_use]
    pub fn new(consumer: ConsumerHandle<K, V>, pool: Arc<dyn ThreadPool>) -> Arc<Self> {
        let token = GroupToken(Arc::as_ptr(&consumer).cast::<()>() as usize);
        Arc::new_cyclic(|me| Self {
            consumer,
            token,
            pool,
            me: me.clone(),
            state: Mutex::new(ProcessorState {
                mode: Mode::Free,
                pending: VecDeque::new(),
                sources: HashMap::default(),
            }),
        })
    }

    /// Returns the token passed to the pool for this consumer's tasks.
    #[must_use]
    pub fn group_token(&self) -> GroupToken {
        self.token
    }

    /// Returns true if no task is in flight.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state.lock().mode == Mode::Free
    }

    /// Returns the number of keys this consumer is subscribed to.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.state.lock().sources.len()
    }

    /// Returns true if the consumer is subscribed to at least one key.
    #[must_use]
    pub fn has_subscriptions(&self) -> bool {
        self.subscription_count() > 0
    }

    /// Registers the cursor serving `key`.
    pub fn add_subscription(&self, key: K, cursor: Arc<Cursor<K, V>>) {
        self.state.lock().sources.insert(key, cursor);
    }

    /// Drops and stops the cursor serving `key`, if any.
    ///
    /// An in-flight task observes the stopped cursor and skips the consumer
    /// call; delivery for other keys is unaffected.
    pub fn remove_subscription(&self, key: &K) {
        let cursor = self.state.lock().sources.remove(key);
        if let Some(cursor) = cursor {
            // Outside the processor lock: stopping takes the log lock.
            cursor.stop();
        }
    }

    /// Starts a task for `cursor` or records it as pending.
    fn schedule(&self, cursor: &Arc<Cursor<K, V>>) {
        let start = {
            let mut state = self.state.lock();
            match state.mode {
                Mode::Processing => {
                    state.pending.push_back(Arc::downgrade(cursor));
                    false
                }
                Mode::Free => {
                    state.mode = Mode::Processing;
                    true
                }
            }
        };
        if start {
            self.submit(Arc::downgrade(cursor));
        }
    }

    /// Builds and posts one delivery task.
    ///
    /// If the pool rejects the submission the processor stays `Processing`;
    /// the pool is stopping and no further progress is expected.
    fn submit(&self, cursor: Weak<Cursor<K, V>>) {
        if self.pool.post(self.make_task(cursor), self.token).is_err() {
            tracing::debug!("delivery task rejected; pool is stopping");
        }
    }

    /// Completion handler running at the tail of every task.
    ///
    /// Re-queues `backlog` (the cursor just served, when it still has
    /// values), then starts a task for the oldest usable pending cursor or
    /// falls back to `Free`.
    fn task_done(&self, backlog: Option<Weak<Cursor<K, V>>>) {
        let next = {
            let mut state = self.state.lock();
            if let Some(cursor) = backlog {
                state.pending.push_back(cursor);
            }
            loop {
                let Some(weak) = state.pending.pop_front() else {
                    state.mode = Mode::Free;
                    break None;
                };
                match weak.upgrade() {
                    Some(cursor) if !cursor.is_stopped() => break Some(weak),
                    // Expired or stopped: keep scanning.
                    _ => {}
                }
            }
        };
        if let Some(weak) = next {
            self.submit(weak);
        }
    }

    /// Creates the pool task delivering one value.
    ///
    /// The task holds only weak references, so it never extends the life of
    /// the processor or cursor, and `task_done` runs on every path where the
    /// processor is still alive.
    fn make_task(&self, cursor: Weak<Cursor<K, V>>) -> Task {
        let me = self.me.clone();
        Box::new(move || {
            let Some(processor) = me.upgrade() else {
                return;
            };

            let mut backlog = None;
            if let Some(cursor) = cursor.upgrade() {
                if !cursor.is_stopped() {
                    if let Some(value) = cursor.current() {
                        let consumer = Arc::clone(&processor.consumer);
                        let outcome = catch_unwind(AssertUnwindSafe(|| {
                            consumer.consume(cursor.key(), &value);
                        }));
                        if outcome.is_err() {
                            tracing::warn!("consumer callback panicked; value skipped");
                        }
                        // Advance past the delivered (or skipped) value.
                        if cursor.advance() && !cursor.is_stopped() {
                            backlog = Some(Arc::downgrade(&cursor));
                        }
                    }
                }
            }

            processor.task_done(backlog);
        })
    }
}

impl<K, V, S> SourceObserver<K, V> for ConsumerProcessor<K, V, S>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Default + Send + 'static,
{
    fn on_new_value(&self, source: &Arc<Cursor<K, V>>) {
        self.schedule(source);
    }
}

impl<K, V, S> Drop for ConsumerProcessor<K, V, S> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (_, cursor) in state.sources.drain() {
            cursor.stop();
        }
    }
}

impl<K, V, S> std::fmt::Debug for ConsumerProcessor<K, V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConsumerProcessor")
            .field("token", &self.token)
            .field("mode", &state.mode)
            .field("subscriptions", &state.sources.len())
            .field("pending", &state.pending.len())
            .finish_non_exhaustive()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::consumer::Consumer;
    use crate::dispatch::data::DataManager;
    use crate::pool::PoolError;

    /// Pool that queues tasks for the test to run by hand.
    #[derive(Default)]
    struct ManualPool {
        tasks: Mutex<VecDeque<Task>>,
    }

    impl ManualPool {
        fn run_one(&self) -> bool {
            let task = self.tasks.lock().pop_front();
            match task {
                Some(task) => {
                    task();
                    true
                }
                None => false,
            }
        }

        fn run_all(&self) -> usize {
            let mut ran = 0;
            while self.run_one() {
                ran += 1;
            }
            ran
        }

        fn queued(&self) -> usize {
            self.tasks.lock().len()
        }
    }

    impl ThreadPool for ManualPool {
        fn post(&self, task: Task, _token: GroupToken) -> Result<(), PoolError> {
            self.tasks.lock().push_back(task);
            Ok(())
        }

        fn stop(&self) {}
    }

    /// Pool that refuses everything, as if stopping.
    struct RejectingPool;

    impl ThreadPool for RejectingPool {
        fn post(&self, _task: Task, _token: GroupToken) -> Result<(), PoolError> {
            Err(PoolError::Stopped)
        }

        fn stop(&self) {}
    }

    #[derive(Default)]
    struct RecordingConsumer {
        seen: Mutex<Vec<(u32, String)>>,
        panic_on: Mutex<Option<String>>,
    }

    impl Consumer<u32, String> for RecordingConsumer {
        fn consume(&self, key: &u32, value: &String) {
            if self.panic_on.lock().as_deref() == Some(value.as_str()) {
                panic!("deliberate test panic");
            }
            self.seen.lock().push((*key, value.clone()));
        }
    }

    struct Fixture {
        pool: Arc<ManualPool>,
        consumer: Arc<RecordingConsumer>,
        processor: Arc<ConsumerProcessor<u32, String>>,
    }

    fn fixture() -> Fixture {
        let pool = Arc::new(ManualPool::default());
        let consumer = Arc::new(RecordingConsumer::default());
        let handle: ConsumerHandle<u32, String> = consumer.clone();
        let dyn_pool: Arc<dyn ThreadPool> = pool.clone();
        let processor = ConsumerProcessor::new(handle, dyn_pool);
        Fixture {
            pool,
            consumer,
            processor,
        }
    }

    fn subscribe(fx: &Fixture, key: u32) -> (Arc<DataManager<u32, String>>, Arc<Cursor<u32, String>>) {
        let data = Arc::new(DataManager::new(key));
        let processor_dyn: Arc<dyn SourceObserver<u32, String>> = fx.processor.clone();
        let observer: Weak<dyn SourceObserver<u32, String>> = Arc::downgrade(&processor_dyn);
        let cursor = Arc::clone(&data).create_cursor(observer);
        fx.processor.add_subscription(key, Arc::clone(&cursor));
        (data, cursor)
    }

    fn seen(fx: &Fixture) -> Vec<(u32, String)> {
        fx.consumer.seen.lock().clone()
    }

    // --- Dispatch tests ---

    #[test]
    fn test_single_value_dispatched() {
        let fx = fixture();
        let (data, _cursor) = subscribe(&fx, 1);

        data.add_value("a".to_owned());
        assert_eq!(fx.pool.queued(), 1);
        assert!(!fx.processor.is_idle());

        fx.pool.run_all();
        assert_eq!(seen(&fx), vec![(1, "a".to_owned())]);
        assert!(fx.processor.is_idle());
    }

    #[test]
    fn test_at_most_one_task_in_flight() {
        let fx = fixture();
        let (data, _cursor) = subscribe(&fx, 1);

        data.add_value("a".to_owned());
        data.add_value("b".to_owned());
        data.add_value("c".to_owned());

        // Only the first append woke the processor.
        assert_eq!(fx.pool.queued(), 1);

        // Each task delivers one value and chains the next.
        assert!(fx.pool.run_one());
        assert_eq!(fx.pool.queued(), 1);
        assert!(fx.pool.run_one());
        assert_eq!(fx.pool.queued(), 1);
        assert!(fx.pool.run_one());
        assert_eq!(fx.pool.queued(), 0);

        let expected: Vec<(u32, String)> = [(1, "a"), (1, "b"), (1, "c")]
            .into_iter()
            .map(|(k, v)| (k, v.to_owned()))
            .collect();
        assert_eq!(seen(&fx), expected);
        assert!(fx.processor.is_idle());
    }

    #[test]
    fn test_round_robin_across_keys() {
        let fx = fixture();
        let (data1, _c1) = subscribe(&fx, 1);
        let (data2, _c2) = subscribe(&fx, 2);

        data1.add_value("a0".to_owned());
        data1.add_value("a1".to_owned());
        data2.add_value("b0".to_owned());
        data2.add_value("b1".to_owned());

        fx.pool.run_all();

        let expected: Vec<(u32, String)> = [(1, "a0"), (2, "b0"), (1, "a1"), (2, "b1")]
            .into_iter()
            .map(|(k, v)| (k, v.to_owned()))
            .collect();
        assert_eq!(seen(&fx), expected);
    }

    #[test]
    fn test_duplicate_wake_ups_tolerated() {
        let fx = fixture();
        let (data, cursor) = subscribe(&fx, 1);

        data.add_value("a".to_owned());
        // A second wake-up for the same cursor while processing.
        fx.processor.on_new_value(&cursor);

        fx.pool.run_all();
        assert_eq!(seen(&fx), vec![(1, "a".to_owned())]);
        assert!(fx.processor.is_idle());
    }

    // --- Cancellation tests ---

    #[test]
    fn test_removed_subscription_skipped() {
        let fx = fixture();
        let (data, cursor) = subscribe(&fx, 1);

        data.add_value("a".to_owned());
        assert_eq!(fx.pool.queued(), 1);

        fx.processor.remove_subscription(&1);
        assert!(cursor.is_stopped());
        assert!(data.is_empty());

        fx.pool.run_all();
        assert!(seen(&fx).is_empty());
        assert!(fx.processor.is_idle());
    }

    #[test]
    fn test_remove_subscription_keeps_other_keys() {
        let fx = fixture();
        let (data1, _c1) = subscribe(&fx, 1);
        let (data2, _c2) = subscribe(&fx, 2);

        data1.add_value("a".to_owned());
        data2.add_value("b".to_owned());
        fx.processor.remove_subscription(&1);

        fx.pool.run_all();
        assert_eq!(seen(&fx), vec![(2, "b".to_owned())]);
        assert_eq!(fx.processor.subscription_count(), 1);
    }

    #[test]
    fn test_drop_stops_cursors() {
        let fx = fixture();
        let (_data, cursor) = subscribe(&fx, 1);

        let Fixture { processor, .. } = fx;
        drop(processor);
        assert!(cursor.is_stopped());
    }

    #[test]
    fn test_task_survives_processor_teardown() {
        let fx = fixture();
        let (data, _cursor) = subscribe(&fx, 1);

        data.add_value("a".to_owned());
        assert_eq!(fx.pool.queued(), 1);

        let Fixture {
            pool,
            consumer,
            processor,
        } = fx;
        drop(processor);

        // The queued task holds only weak references.
        pool.run_all();
        assert!(consumer.seen.lock().is_empty());
    }

    // --- Panic containment tests ---

    #[test]
    fn test_panic_skips_value_and_continues() {
        let fx = fixture();
        let (data, _cursor) = subscribe(&fx, 1);
        *fx.consumer.panic_on.lock() = Some("poison".to_owned());

        data.add_value("poison".to_owned());
        data.add_value("b".to_owned());

        fx.pool.run_all();
        assert_eq!(seen(&fx), vec![(1, "b".to_owned())]);
        assert!(fx.processor.is_idle());
        assert!(data.is_empty());
    }

    // --- Pool shutdown tests ---

    #[test]
    fn test_rejected_submission_stays_processing() {
        let consumer = Arc::new(RecordingConsumer::default());
        let handle: ConsumerHandle<u32, String> = consumer.clone();
        let dyn_pool: Arc<dyn ThreadPool> = Arc::new(RejectingPool);
        let processor: Arc<ConsumerProcessor<u32, String>> = ConsumerProcessor::new(handle, dyn_pool);

        let data = Arc::new(DataManager::new(1u32));
        let processor_dyn: Arc<dyn SourceObserver<u32, String>> = processor.clone();
        let observer: Weak<dyn SourceObserver<u32, String>> = Arc::downgrade(&processor_dyn);
        let cursor = Arc::clone(&data).create_cursor(observer);
        processor.add_subscription(1, cursor);

        data.add_value("a".to_owned());
        assert!(!processor.is_idle());
        assert!(consumer.seen.lock().is_empty());
    }
}
