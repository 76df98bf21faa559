//! # Memoizing caches
//!
//! A [`MemoizingCache`] remembers the outcome of expensive computations by key, and makes sure
//! that a computation for any given key runs at most once at a time.
//!
//! ## Request coalescing
//!
//! The first caller asking for a key that is neither computed nor being computed inserts a
//! placeholder into the cache and hands the computation to an executor. Every caller asking for
//! the same key while the computation is in flight waits on that placeholder, and all of them get
//! the same outcome. Checking for a placeholder and inserting one happens under a single lock, so
//! two concurrent callers can never both start a computation.
//!
//! Computations run on an [`Execute`](crate::execution::Execute)r, not on the task of the caller
//! that started them. A caller that stops waiting, because it timed out or was dropped, does not
//! cancel the computation for everyone else. With an
//! [`AdmissionGate`](crate::admission::AdmissionGate), waiting for a free slot happens on a
//! separate task as well, and a [`MemoizingCache::cancel`] during that wait resolves all waiters
//! without waiting for the slot.
//!
//! ## Failures and cancellation
//!
//! Only successful outcomes are remembered:
//!
//! - A computation that fails or panics delivers its error to all current waiters and is then
//!   forgotten, so the next caller starts a fresh computation.
//! - [`MemoizingCache::cancel`] cancels the computation in flight for a key. All waiters get
//!   [`Error::Cancelled`](crate::Error::Cancelled), and the next caller starts over.
//!
//! The placeholder of a failed or cancelled computation is removed *before* the outcome is
//! delivered, so a waiter that retries right away never observes the stale failure.
//!
//! Successful values are kept for the lifetime of the cache. There is no expiration.
//!
//! ### Metrics
//!
//! Each metric is tagged with a `cache` field holding the name of the cache:
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by an already computed value.
//! - `caches.channel.hit`: Accesses that joined a computation in flight.
//! - `caches.channel.miss`: Accesses that started a new computation.
//! - `caches.computation`: Computations that actually started running.
//! - `caches.computation.failed`: Computations that failed or panicked.
//! - `caches.computation.cancelled`: Computations that were cancelled, or dropped before running.

mod memory;


pub use memory::MemoizingCache;
