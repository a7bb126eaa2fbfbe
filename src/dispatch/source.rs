//! Per-(consumer, key) reading position over a key's value log.
//!
//! A [`Cursor`] points at exactly one position in its
//! [`DataManager`](crate::dispatch::DataManager)'s log: either the next
//! unread entry or the past-the-end sentinel. Position and refcount
//! bookkeeping live on the `DataManager` side so all log state shares one
//! lock; the cursor itself carries only its id, a stop flag, a strong handle
//! to the log, and a weak handle to the observer it wakes.
//!
//! ## Wake-ups
//!
//! When an appended value moves a past-the-end cursor onto a real entry, the
//! `DataManager` calls the cursor's [`SourceObserver`] after releasing the
//! log lock. Each such transition produces exactly one wake-up; a cursor
//! already pointing at an entry is not re-notified.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::dispatch::data::DataManager;

/// Identifier a [`DataManager`] assigns to each of its cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CursorId(pub(crate) u64);

// ---------------------------------------------------------------------------
// SourceObserver
// ---------------------------------------------------------------------------

/// Wake-up target of a [`Cursor`].
///
/// Implemented by the per-consumer scheduler. Called with no log lock held,
/// once per transition of the cursor from past-the-end onto a new entry.
pub trait SourceObserver<K, V>: Send + Sync {
    /// Signals that `source` now points at a readable value.
    fn on_new_value(&self, source: &Arc<Cursor<K, V>>);
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Reading position of one consumer over one key's log.
///
/// Created via
/// [`DataManager::create_cursor`](crate::dispatch::DataManager::create_cursor);
/// born at past-the-end, so values enqueued before creation are invisible.
/// While the cursor points at an entry it holds one reference on it, keeping
/// the entry (and everything after it) buffered.
pub struct Cursor<K, V> {
    id: CursorId,
    data: Arc<DataManager<K, V>>,
    observer: Weak<dyn SourceObserver<K, V>>,
    stopped: AtomicBool,
}

impl<K, V> Cursor<K, V> {
    pub(crate) fn new(
        id: CursorId,
        data: Arc<DataManager<K, V>>,
        observer: Weak<dyn SourceObserver<K, V>>,
    ) -> Self {
        Self {
            id,
            data,
            observer,
            stopped: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> CursorId {
        self.id
    }

    /// Returns the key this cursor reads.
    #[must_use]
    pub fn key(&self) -> &K {
        self.data.key()
    }

    /// Returns true if the cursor currently points at an unread entry.
    #[must_use]
    pub fn has_value(&self) -> bool {
        self.data.has_value_at(self.id)
    }

    /// Returns the value at the cursor position, or `None` at past-the-end
    /// (or after [`stop`](Self::stop)).
    #[must_use]
    pub fn current(&self) -> Option<Arc<V>> {
        self.data.value_at(self.id)
    }

    /// Moves past the current entry, releasing it for reclamation.
    ///
    /// Returns whether the cursor points at another entry afterwards.
    /// Returns `false` without effect at past-the-end or after
    /// [`stop`](Self::stop).
    pub fn advance(&self) -> bool {
        self.data.advance(self.id)
    }

    /// Deactivates the cursor: releases its position in the log and
    /// suppresses further wake-ups. Idempotent.
    ///
    /// An in-flight delivery that already read the current value finishes
    /// normally; no new delivery starts for this cursor.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.data.release(self.id);
        }
    }

    /// Returns true once [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Delivers a wake-up to the observer, unless stopped or orphaned.
    pub(crate) fn notify(self: Arc<Self>) {
        if self.is_stopped() {
            return;
        }
        if let Some(observer) = self.observer.upgrade() {
            observer.on_new_value(&self);
        }
    }
}

impl<K, V> std::fmt::Debug for Cursor<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("id", &self.id.0)
            .field("stopped", &self.is_stopped())
            .field("has_value", &self.has_value())
            .finish_non_exhaustive()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
