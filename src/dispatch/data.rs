//! Per-key value log with reference-counted prefix reclamation.
//!
//! [`DataManager`] owns one key's buffered values and the set of cursors
//! reading them. Its contract is the hardest invariant of the engine:
//! fan-out with a single stored copy, and retention bounded by the slowest
//! cursor.
//!
//! ## Log
//!
//! Entries live in a deque addressed by monotonic sequence numbers: the head
//! sequence tracks the oldest retained entry, so reclamation pops from the
//! front without invalidating any retained position. Each entry counts the
//! cursors that still consider it unread; an entry is reclaimed only when its
//! count is zero *and* every entry before it is gone (prefix-only
//! reclamation).
//!
//! ## Fan-out
//!
//! Values are stored once as `Arc<V>` and shared by every cursor. Appending
//! a value advances every past-the-end cursor onto the new entry under the
//! log lock, then fires their wake-ups after releasing it, so wake-up
//! handlers never run under the log lock and a wake-up can never be lost.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::dispatch::source::{Cursor, CursorId, SourceObserver};

/// One buffered value plus the number of cursors that have not read it yet.
struct Entry<V> {
    value: Arc<V>,
    readers: usize,
}

/// A registered cursor's position in the log.
///
/// `pos` is a sequence number in `head..=tail`; `pos == tail` is the
/// past-the-end sentinel.
struct CursorSlot<K, V> {
    id: CursorId,
    pos: u64,
    cursor: Arc<Cursor<K, V>>,
}

/// Log state guarded by the manager's mutex.
struct Log<K, V> {
    /// Sequence number of `entries.front()`.
    head: u64,
    entries: VecDeque<Entry<V>>,
    cursors: Vec<CursorSlot<K, V>>,
}

impl<K, V> Log<K, V> {
    /// Sequence number one past the newest entry.
    fn tail(&self) -> u64 {
        self.head + self.entries.len() as u64
    }

    /// Deque index of the entry at `pos`.
    #[allow(clippy::cast_possible_truncation)] // in-memory log length fits usize
    fn index(&self, pos: u64) -> usize {
        (pos - self.head) as usize
    }

    fn slot_index(&self, id: CursorId) -> Option<usize> {
        self.cursors.iter().position(|slot| slot.id == id)
    }

    /// Pops the longest zero-reader prefix.
    fn reclaim(&mut self) {
        while let Some(front) = self.entries.front() {
            if front.readers != 0 {
                break;
            }
            self.entries.pop_front();
            self.head += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// DataManager
// ---------------------------------------------------------------------------

/// Per-key storage and fan-out coordinator.
///
/// Holds the key's buffered values and every cursor subscribed to them. All
/// mutation happens under one internal lock; wake-up callbacks run after it
/// is released.
pub struct DataManager<K, V> {
    key: K,
    log: Mutex<Log<K, V>>,
    next_cursor_id: AtomicU64,
}

impl<K, V> DataManager<K, V> {
    /// Creates an empty log for `key`.
    #[must_use]
    pub fn new(key: K) -> Self {
        Self {
            key,
            log: Mutex::new(Log {
                head: 0,
                entries: VecDeque::new(),
                cursors: Vec::new(),
            }),
            next_cursor_id: AtomicU64::new(0),
        }
    }

    /// Returns the key this manager buffers values for.
    #[must_use]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Appends a value and wakes every cursor that was at past-the-end.
    ///
    /// The value is stored once; all cursors share it. Wake-up hooks run
    /// after the log lock is released.
    pub fn add_value(&self, value: V) {
        let woken: SmallVec<[Arc<Cursor<K, V>>; 4]> = {
            let mut log = self.log.lock();
            let tail = log.tail();
            log.entries.push_back(Entry {
                value: Arc::new(value),
                readers: 0,
            });

            // Past-the-end cursors now point at the new entry; their numeric
            // position is already the new entry's sequence number.
            let mut woken = SmallVec::new();
            for slot in &log.cursors {
                if slot.pos == tail {
                    woken.push(Arc::clone(&slot.cursor));
                }
            }
            if let Some(entry) = log.entries.back_mut() {
                entry.readers = woken.len();
            }
            woken
        };

        for cursor in woken {
            cursor.notify();
        }
    }

    /// Registers a new cursor delivering wake-ups to `observer`.
    ///
    /// The cursor is born at past-the-end: values appended earlier are
    /// invisible to it, and it holds no reference on any entry yet.
    #[must_use]
    pub fn create_cursor(
        self: Arc<Self>,
        observer: Weak<dyn SourceObserver<K, V>>,
    ) -> Arc<Cursor<K, V>> {
        let id = CursorId(self.next_cursor_id.fetch_add(1, Ordering::Relaxed));
        let data = Arc::clone(&self);
        let cursor = Arc::new(Cursor::new(id, self, observer));

        let mut log = data.log.lock();
        let pos = log.tail();
        log.cursors.push(CursorSlot {
            id,
            pos,
            cursor: Arc::clone(&cursor),
        });
        cursor
    }

    /// Returns the number of buffered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.log.lock().entries.len()
    }

    /// Returns true if no entries are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log.lock().entries.is_empty()
    }

    /// Returns the number of registered cursors.
    #[must_use]
    pub fn cursor_count(&self) -> usize {
        self.log.lock().cursors.len()
    }

    /// Whether the cursor points at an unread entry.
    pub(crate) fn has_value_at(&self, id: CursorId) -> bool {
        let log = self.log.lock();
        log.slot_index(id)
            .is_some_and(|i| log.cursors[i].pos < log.tail())
    }

    /// The value at the cursor position, if any.
    pub(crate) fn value_at(&self, id: CursorId) -> Option<Arc<V>> {
        let log = self.log.lock();
        let i = log.slot_index(id)?;
        let pos = log.cursors[i].pos;
        if pos < log.tail() {
            let index = log.index(pos);
            Some(Arc::clone(&log.entries[index].value))
        } else {
            None
        }
    }

    /// Moves the cursor past its current entry and reclaims the freed
    /// prefix. Returns whether another entry is readable.
    ///
    /// A cursor at past-the-end, or one released concurrently by `stop`, is
    /// left untouched.
    pub(crate) fn advance(&self, id: CursorId) -> bool {
        let mut log = self.log.lock();
        let Some(i) = log.slot_index(id) else {
            return false;
        };
        let pos = log.cursors[i].pos;
        if pos >= log.tail() {
            return false;
        }

        let index = log.index(pos);
        log.entries[index].readers -= 1;

        let next = pos + 1;
        log.cursors[i].pos = next;
        let has_more = next < log.tail();
        if has_more {
            let next_index = log.index(next);
            log.entries[next_index].readers += 1;
        }

        log.reclaim();
        has_more
    }

    /// Removes the cursor from the log, dropping its reference on the
    /// current entry and reclaiming the freed prefix.
    pub(crate) fn release(&self, id: CursorId) {
        let mut log = self.log.lock();
        let Some(i) = log.slot_index(id) else {
            return;
        };
        let slot = log.cursors.swap_remove(i);
        if slot.pos < log.tail() {
            let index = log.index(slot.pos);
            log.entries[index].readers -= 1;
        }
        log.reclaim();
    }
}

impl<K, V> std::fmt::Debug for DataManager<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataManager")
            .field("len", &self.len())
            .field("cursor_count", &self.cursor_count())
            .finish_non_exhaustive()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Observer that ignores wake-ups; these tests drive cursors directly.
    struct NullObserver;

    impl<K: Send + Sync, V: Send + Sync> SourceObserver<K, V> for NullObserver {
        fn on_new_value(&self, _source: &Arc<Cursor<K, V>>) {}
    }

    fn make_manager() -> (Arc<DataManager<u32, String>>, Arc<NullObserver>) {
        (Arc::new(DataManager::new(7u32)), Arc::new(NullObserver))
    }

    fn attach(
        data: &Arc<DataManager<u32, String>>,
        observer: &Arc<NullObserver>,
    ) -> Arc<Cursor<u32, String>> {
        let observer_dyn: Arc<dyn SourceObserver<u32, String>> = observer.clone();
        let weak: Weak<dyn SourceObserver<u32, String>> = Arc::downgrade(&observer_dyn);
        Arc::clone(data).create_cursor(weak)
    }

    // --- Creation tests ---

    #[test]
    fn test_new_manager_empty() {
        let (data, _observer) = make_manager();
        assert!(data.is_empty());
        assert_eq!(data.len(), 0);
        assert_eq!(data.cursor_count(), 0);
        assert_eq!(*data.key(), 7);
    }

    #[test]
    fn test_cursor_ignores_prior_values() {
        let (data, observer) = make_manager();
        data.add_value("before".to_owned());

        let cursor = attach(&data, &observer);
        assert!(!cursor.has_value());

        data.add_value("after".to_owned());
        assert_eq!(
            cursor.current().as_deref().map(String::as_str),
            Some("after")
        );
    }

    // --- Retention tests ---

    #[test]
    fn test_unread_values_retained_without_cursors_until_drop() {
        let (data, _observer) = make_manager();
        data.add_value("a".to_owned());
        data.add_value("b".to_owned());
        // No cursors: entries sit unread; storage goes away with the manager.
        assert_eq!(data.len(), 2);
    }

    #[test]
    fn test_consumed_prefix_reclaimed() {
        let (data, observer) = make_manager();
        let cursor = attach(&data, &observer);

        for i in 0..5 {
            data.add_value(format!("v{i}"));
        }
        assert_eq!(data.len(), 5);

        for _ in 0..4 {
            cursor.advance();
        }
        assert_eq!(data.len(), 1);

        cursor.advance();
        assert!(data.is_empty());
    }

    #[test]
    fn test_slowest_cursor_bounds_retention() {
        let (data, observer) = make_manager();
        let fast = attach(&data, &observer);
        let slow = attach(&data, &observer);

        for i in 0..10 {
            data.add_value(format!("v{i}"));
        }

        // The fast cursor drains; everything stays for the slow one.
        while fast.advance() {}
        assert!(!fast.has_value());
        assert_eq!(data.len(), 10);

        // The slow cursor reads the same ten values, freeing as it goes.
        let mut seen = Vec::new();
        while let Some(value) = slow.current() {
            seen.push(value.as_str().to_owned());
            slow.advance();
        }
        let expected: Vec<String> = (0..10).map(|i| format!("v{i}")).collect();
        assert_eq!(seen, expected);
        assert!(data.is_empty());
    }

    #[test]
    fn test_release_frees_retained_entries() {
        let (data, observer) = make_manager();
        let fast = attach(&data, &observer);
        let slow = attach(&data, &observer);

        for i in 0..10 {
            data.add_value(format!("v{i}"));
        }
        while fast.advance() {}
        assert_eq!(data.len(), 10);

        // Stopping the laggard releases the whole backlog.
        slow.stop();
        assert!(data.is_empty());
        assert_eq!(data.cursor_count(), 1);
    }

    #[test]
    fn test_release_mid_log_keeps_prefix_rule() {
        let (data, observer) = make_manager();
        let slow = attach(&data, &observer);
        let mid = attach(&data, &observer);

        for i in 0..6 {
            data.add_value(format!("v{i}"));
        }
        mid.advance();
        mid.advance();
        mid.advance();

        // slow still holds entry 0, so nothing is reclaimed yet.
        mid.stop();
        assert_eq!(data.len(), 6);

        while slow.advance() {}
        assert!(data.is_empty());
    }

    // --- Fan-out tests ---

    #[test]
    fn test_value_shared_not_copied() {
        let (data, observer) = make_manager();
        let a = attach(&data, &observer);
        let b = attach(&data, &observer);

        data.add_value("shared".to_owned());

        let va = a.current().unwrap();
        let vb = b.current().unwrap();
        assert!(Arc::ptr_eq(&va, &vb));
    }

    #[test]
    fn test_independent_cursor_progress() {
        let (data, observer) = make_manager();
        let a = attach(&data, &observer);
        let b = attach(&data, &observer);

        data.add_value("x".to_owned());
        data.add_value("y".to_owned());

        a.advance();
        assert_eq!(a.current().as_deref().map(String::as_str), Some("y"));
        assert_eq!(b.current().as_deref().map(String::as_str), Some("x"));
    }

    // --- Concurrency tests ---

    #[test]
    fn test_concurrent_producers_single_cursor() {
        let (data, observer) = make_manager();
        let cursor = attach(&data, &observer);

        let mut producers = Vec::new();
        for t in 0..4u32 {
            let data = Arc::clone(&data);
            producers.push(std::thread::spawn(move || {
                for i in 0..100u32 {
                    data.add_value(format!("{t}:{i}"));
                }
            }));
        }
        for handle in producers {
            handle.join().unwrap();
        }

        // Drain and check per-producer order within the interleaving.
        let mut per_producer: Vec<Vec<u32>> = vec![Vec::new(); 4];
        while let Some(value) = cursor.current() {
            let (t, i) = value.split_once(':').unwrap();
            per_producer[t.parse::<usize>().unwrap()].push(i.parse().unwrap());
            cursor.advance();
        }

        for seen in per_producer {
            let expected: Vec<u32> = (0..100).collect();
            assert_eq!(seen, expected);
        }
        assert!(data.is_empty());
    }
}
