//! Helpers for testing the memoizing caches and executors.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Tests that exercise real concurrency need a multi-threaded runtime, e.g.
//!    `#[tokio::test(flavor = "multi_thread", worker_threads = 4)]`. Use a [`Latch`] to make sure
//!    that tasks actually overlap, instead of sleeping and hoping they do.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `memoizer_service` crate and mutes
///    all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("memoizer_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A countdown latch that tasks can wait on.
///
/// Waiting returns once [`count_down`](Self::count_down) has been called as often as the latch
/// was created with. Clones share the same count.
#[derive(Clone, Debug)]
pub struct Latch {
    remaining: Arc<watch::Sender<usize>>,
}

impl Latch {
    pub fn new(count: usize) -> Self {
        let (remaining, _) = watch::channel(count);
        Self {
            remaining: Arc::new(remaining),
        }
    }

    pub fn count_down(&self) {
        self.remaining.send_modify(|remaining| {
            *remaining = remaining.saturating_sub(1);
        });
    }

    /// Waits until the count has reached zero.
    pub async fn wait(&self) {
        let mut remaining = self.remaining.subscribe();
        // the sender lives as long as `self`, so this cannot fail
        remaining.wait_for(|remaining| *remaining == 0).await.ok();
    }

    pub fn count(&self) -> usize {
        *self.remaining.borrow()
    }
}

/// A shared counter, e.g. for the number of times a computation actually ran.
#[derive(Clone, Debug, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter, returning the new count.
    pub fn increment(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Returns the prime factors of `n` in ascending order.
///
/// This is deliberately slow for large primes, which makes it a good stand-in for an expensive
/// computation.
pub fn factorize(mut n: u64) -> Vec<u64> {
    let mut factors = Vec::new();
    let mut divisor = 2;
    while square_at_most(divisor, n) {
        while n % divisor == 0 {
            factors.push(divisor);
            n /= divisor;
        }
        divisor += 1;
    }
    if n > 1 {
        factors.push(n);
    }
    factors
}

/// Whether `divisor * divisor <= n`, without overflowing for `n` close to `u64::MAX`.
fn square_at_most(divisor: u64, n: u64) -> bool {
    divisor <= n / divisor
}
