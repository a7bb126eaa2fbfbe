//! # keyflow
//!
//! An in-process multi-producer / multi-consumer dispatch engine keyed by an
//! application-defined key type. Producers enqueue values for a key; consumers
//! subscribe to one or more keys and are notified asynchronously, once per
//! enqueued value, through a user-supplied callback running on a
//! caller-provided thread pool.
//!
//! This crate provides:
//! - **Registry**: [`MultiQueueProcessor`], the subscribe / unsubscribe /
//!   enqueue facade
//! - **Value store**: [`dispatch::DataManager`], a per-key log with
//!   reference-counted prefix reclamation and single-copy fan-out
//! - **Scheduling**: per-consumer processors that keep at most one callback
//!   in flight per consumer while staying fair across its keys
//! - **Execution**: the [`ThreadPool`] capability trait plus [`WorkerPool`],
//!   a fixed-thread implementation with group-token pinning
//!
//! ## Design Principles
//!
//! 1. **Producers never block on consumers** - enqueue appends and returns
//! 2. **Per (consumer, key) order** - values arrive in enqueue order
//! 3. **One value, many readers** - fan-out shares a single stored value
//!    regardless of subscriber count
//! 4. **Lock-based, runtime-free** - no async runtime; the thread pool is
//!    the only execution engine
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use keyflow::{consumer_fn, MultiQueueProcessor, WorkerPool};
//!
//! let pool = Arc::new(WorkerPool::new()?);
//! let mq: MultiQueueProcessor<u32, String> = MultiQueueProcessor::new(pool);
//!
//! let consumer = consumer_fn(|key: &u32, value: &String| {
//!     println!("key {key}: {value}");
//! });
//!
//! mq.subscribe(&1, Arc::clone(&consumer));
//! mq.enqueue(&1, "hello".to_owned());
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod dispatch;
pub mod pool;

// Re-export key types
pub use dispatch::{consumer_fn, Consumer, ConsumerHandle, MultiQueueProcessor};
pub use pool::{
    GroupToken, PoolError, Task, ThreadPool, WorkerPool, WorkerPoolConfig, WorkerPoolMetrics,
};
