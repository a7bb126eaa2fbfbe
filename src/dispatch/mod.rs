//! # Keyed Dispatch Core
//!
//! The data structures and concurrency protocol behind the engine: accept
//! values without blocking producers, preserve per-(consumer, key) ordering,
//! keep at most one callback in flight per consumer, fan one value out to N
//! subscribers with a single stored copy, and reclaim buffered values once
//! the last cursor has moved past them.
//!
//! ## Architecture
//!
//! ```text
//! Producers                  Registry                    Pool workers
//! ┌──────────┐      ┌─────────────────────┐            ┌─────────────┐
//! │ enqueue  │─────►│ MultiQueueProcessor │            │ consume(k,v)│
//! └──────────┘      │  key → DataManager  │            └──────▲──────┘
//!                   │  consumer → Proc.   │                   │ post
//!                   └──────────┬──────────┘                   │
//!                              │ add_value            ┌───────┴──────────┐
//!                   ┌──────────▼──────────┐  wake-up  │ ConsumerProcessor│
//!                   │ DataManager (per key)│─────────►│  fairness FIFO   │
//!                   │  log + refcounts     │  Cursor  │  one in flight   │
//!                   └─────────────────────┘           └──────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`consumer`]: the [`Consumer`] callback trait and [`ConsumerHandle`]
//! - [`data`]: [`DataManager`], the per-key value log with refcounted
//!   prefix reclamation
//! - [`source`]: [`Cursor`], the per-(consumer, key) reading position, and
//!   the [`SourceObserver`] wake-up trait
//! - [`processor`]: [`ConsumerProcessor`], the per-consumer scheduler
//! - [`registry`]: [`MultiQueueProcessor`], the public facade
//!
//! ## Ordering
//!
//! Values for one (consumer, key) pair arrive in enqueue order. A consumer
//! subscribed to several keys sees best-effort round-robin progress between
//! them; no ordering holds across consumers.

pub mod consumer;
pub mod data;
pub mod processor;
pub mod registry;
pub mod source;

// Re-export key types
pub use consumer::{consumer_fn, Consumer, ConsumerHandle};
pub use data::DataManager;
pub use processor::ConsumerProcessor;
pub use registry::MultiQueueProcessor;
pub use source::{Cursor, SourceObserver};
