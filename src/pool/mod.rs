//! # Execution Pool
//!
//! The dispatch engine does not spawn threads of its own. Every consumer
//! callback runs on a caller-supplied pool reached through the [`ThreadPool`]
//! capability trait, so worker count, affinity, and scheduling policy stay
//! outside the core.
//!
//! ## Contract
//!
//! - [`ThreadPool::post`] accepts a task and a [`GroupToken`]; the task runs
//!   exactly once unless the pool is stopping, in which case `post` returns
//!   [`PoolError::Stopped`] and the task is dropped.
//! - Tasks posted with the same token *may* be serialized onto one worker
//!   thread. [`WorkerPool`] uses this to emulate a single-threaded apartment
//!   per consumer. No ordering is assumed across distinct tokens.
//!
//! ## Module Structure
//!
//! - [`ThreadPool`] / [`Task`] / [`GroupToken`] / [`PoolError`]: the contract
//! - [`worker`]: [`WorkerPool`], the bundled fixed-thread implementation

pub mod worker;

pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolConfigBuilder, WorkerPoolMetrics};

/// A unit of work submitted to a pool.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Opaque tag grouping related tasks.
///
/// A pool may route every task carrying the same token to the same worker
/// thread, serializing them. The dispatch engine derives one stable token per
/// consumer from its handle address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupToken(pub usize);

/// Errors surfaced by pool implementations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool is stopping or stopped; the submitted task was dropped.
    #[error("pool is stopped")]
    Stopped,

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Capability interface for task execution.
///
/// Implementations must run each accepted task exactly once and may honor
/// [`GroupToken`] serialization. All methods are callable from any thread.
pub trait ThreadPool: Send + Sync + 'static {
    /// Submits a task for execution.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Stopped`] if the pool no longer accepts work.
    fn post(&self, task: Task, token: GroupToken) -> Result<(), PoolError>;

    /// Stops the pool: already-queued tasks finish, new submissions are
    /// rejected, and workers are joined.
    fn stop(&self);
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_token_equality() {
        assert_eq!(GroupToken(7), GroupToken(7));
        assert_ne!(GroupToken(7), GroupToken(8));
    }

    #[test]
    fn test_pool_error_display() {
        let e = PoolError::Stopped;
        assert!(e.to_string().contains("stopped"));

        let e = PoolError::Spawn(std::io::Error::other("boom"));
        assert!(e.to_string().contains("spawn"));
    }
}
