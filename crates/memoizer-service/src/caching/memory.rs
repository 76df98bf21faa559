use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::Shared;
use parking_lot::Mutex;
use sentry::{Hub, SentryFutureExt};

use crate::admission::AdmissionGate;
use crate::cancellation::CancellationHandle;
use crate::error::{CacheEntry, Error};
use crate::execution::{Execute, Task};

type ComputationChannel<V> = Shared<oneshot::Receiver<CacheEntry<V>>>;

enum Slot<V> {
    /// A computation is in flight.
    Pending {
        /// Tells placeholders for the same key apart, so a finished computation never removes
        /// the placeholder of a newer one.
        generation: u64,
        channel: ComputationChannel<V>,
        handle: CancellationHandle,
    },
    Ready(V),
}

type ComputationMap<K, V> = Arc<Mutex<HashMap<K, Slot<V>>>>;

struct CacheInner<K, V> {
    name: Arc<str>,
    executor: Arc<dyn Execute>,
    admission: Option<AdmissionGate>,
    default_timeout: Option<Duration>,
    map: ComputationMap<K, V>,
    next_generation: AtomicU64,
}

/// A cache that computes each value at most once at a time and remembers it.
///
/// Cloning the cache is cheap, and all clones share the same entries.
///
/// See the [module documentation](crate::caching) for how concurrent requests are coalesced.
pub struct MemoizingCache<K, V> {
    inner: Arc<CacheInner<K, V>>,
}

impl<K, V> Clone for MemoizingCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> fmt::Debug for MemoizingCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoizingCache")
            .field("name", &self.inner.name)
            .field("executor", &self.inner.executor.name())
            .field("entries", &self.inner.map.lock().len())
            .finish()
    }
}

impl<K, V> MemoizingCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates an empty cache that runs its computations on `executor`.
    pub fn new(name: impl Into<Arc<str>>, executor: Arc<dyn Execute>) -> Self {
        Self::with_options(name, executor, None, None)
    }

    /// Creates an empty cache whose computations are throttled by `admission`, and whose
    /// [`compute_with_default_timeout`](Self::compute_with_default_timeout) waits for at most
    /// `default_timeout`.
    pub fn with_options(
        name: impl Into<Arc<str>>,
        executor: Arc<dyn Execute>,
        admission: Option<AdmissionGate>,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                name: name.into(),
                executor,
                admission,
                default_timeout,
                map: Default::default(),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.inner.default_timeout
    }

    /// Returns the value for `key`, computing it with `f` if needed.
    ///
    /// `f` is only called if no value exists and no computation is in flight.
    pub async fn compute<F, Fut, E>(&self, key: K, f: F) -> CacheEntry<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync + 'static>> + 'static,
    {
        self.compute_with(key, |_| f()).await
    }

    /// Like [`compute`](Self::compute), but `f` gets the [`CancellationHandle`] of the
    /// computation, to observe cancellation and to register resources with it.
    ///
    /// A computation that fails after its handle was cancelled is reported as
    /// [`Error::Cancelled`].
    ///
    /// If the executor rejects the computation, this returns [`Error::Rejected`]. Callers that
    /// joined the computation in the meantime get [`Error::Cancelled`].
    pub async fn compute_with<F, Fut, E>(&self, key: K, f: F) -> CacheEntry<V>
    where
        F: FnOnce(CancellationHandle) -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync + 'static>> + 'static,
    {
        let name = &*self.inner.name;
        metric!(counter("caches.access") += 1, "cache" => name);

        let (channel, computation) = {
            let mut map = self.inner.map.lock();
            match map.get(&key) {
                Some(Slot::Ready(value)) => {
                    metric!(counter("caches.memory.hit") += 1, "cache" => name);
                    return Ok(value.clone());
                }
                Some(Slot::Pending { channel, .. }) => {
                    metric!(counter("caches.channel.hit") += 1, "cache" => name);
                    (channel.clone(), None)
                }
                None => {
                    metric!(counter("caches.channel.miss") += 1, "cache" => name);
                    let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                    let handle = CancellationHandle::new();
                    let (sender, receiver) = oneshot::channel();
                    let channel = receiver.shared();

                    map.insert(
                        key.clone(),
                        Slot::Pending {
                            generation,
                            channel: channel.clone(),
                            handle: handle.clone(),
                        },
                    );

                    let completion = Completion {
                        name: Arc::clone(&self.inner.name),
                        map: Arc::clone(&self.inner.map),
                        key,
                        generation,
                        sender: Some(sender),
                    };
                    (channel, Some((completion, handle)))
                }
            }
        };

        // the executor and `f` are called without holding the lock
        if let Some((completion, handle)) = computation {
            let future = f(handle.clone());
            let task = Task::with_handle(completion.run(future, handle.clone()), handle)
                .named(self.inner.name.to_string());
            self.submit(task).await?;
        }

        channel.await.unwrap_or(Err(Error::Cancelled))
    }

    /// Like [`compute`](Self::compute), but gives up waiting after `timeout` with
    /// [`Error::Timeout`].
    ///
    /// Giving up does not cancel the computation, even while it still waits for admission. Its
    /// value is still stored for later callers.
    pub async fn compute_timeout<F, Fut, E>(
        &self,
        key: K,
        timeout: Duration,
        f: F,
    ) -> CacheEntry<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync + 'static>> + 'static,
    {
        tokio::time::timeout(timeout, self.compute(key, f))
            .await
            .unwrap_or(Err(Error::Timeout(timeout)))
    }

    /// Like [`compute_timeout`](Self::compute_timeout) with the configured default timeout, or
    /// like [`compute`](Self::compute) if there is none.
    pub async fn compute_with_default_timeout<F, Fut, E>(&self, key: K, f: F) -> CacheEntry<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync + 'static>> + 'static,
    {
        match self.inner.default_timeout {
            Some(timeout) => self.compute_timeout(key, timeout, f).await,
            None => self.compute(key, f).await,
        }
    }

    /// Cancels the computation in flight for `key`.
    ///
    /// Returns `false` if there is no computation in flight for `key`.
    pub fn cancel(&self, key: &K) -> bool {
        let handle = match self.inner.map.lock().get(key) {
            Some(Slot::Pending { handle, .. }) => handle.clone(),
            _ => return false,
        };
        tracing::trace!(cache = %self.inner.name, "cancelling computation");
        handle.cancel();
        true
    }

    /// Returns the value for `key` if it has been computed.
    pub fn get(&self, key: &K) -> Option<V> {
        match self.inner.map.lock().get(key) {
            Some(Slot::Ready(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// The number of computed values.
    pub fn len(&self) -> usize {
        self.inner
            .map
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    /// Returns `true` if there are neither computed values nor computations in flight.
    pub fn is_empty(&self) -> bool {
        self.inner.map.lock().is_empty()
    }

    /// The number of computations in flight.
    pub fn pending(&self) -> usize {
        self.inner
            .map
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Pending { .. }))
            .count()
    }

    /// Hands the computation to the executor.
    ///
    /// Waiting for admission happens on a separate task that owns the computation, so a caller
    /// that times out or is dropped in the meantime does not cancel it for the other waiters.
    /// Only a rejection is reported back to the caller.
    async fn submit(&self, task: Task) -> Result<(), Error> {
        let Some(gate) = &self.inner.admission else {
            return self.inner.executor.execute(task);
        };

        let gate = gate.clone();
        let executor = Arc::clone(&self.inner.executor);
        let (sender, receiver) = oneshot::channel();
        let admission = async move {
            let result = gate.submit(&*executor, task).await;
            sender.send(result).ok();
        };
        tokio::spawn(admission.bind_hub(Hub::new_from_top(Hub::current())));

        match receiver.await {
            Ok(Err(Error::Rejected)) => Err(Error::Rejected),
            // a cancelled computation is reported through its channel
            _ => Ok(()),
        }
    }
}

/// Publishes the outcome of a single computation.
///
/// This is owned by the task running the computation. If the task is dropped before it completes,
/// because it was cancelled, rejected, or discarded, the placeholder is removed and all waiters
/// see [`Error::Cancelled`].
struct Completion<K: Eq + Hash, V> {
    name: Arc<str>,
    map: ComputationMap<K, V>,
    key: K,
    generation: u64,
    sender: Option<oneshot::Sender<CacheEntry<V>>>,
}

impl<K: Eq + Hash, V: Clone> Completion<K, V> {
    async fn run<Fut, E>(self, future: Fut, handle: CancellationHandle)
    where
        Fut: Future<Output = Result<V, E>>,
        E: Into<Box<dyn StdError + Send + Sync + 'static>> + 'static,
    {
        metric!(counter("caches.computation") += 1, "cache" => &*self.name);

        let entry = match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) if handle.is_cancelled() => Err(Error::Cancelled),
            Ok(Err(err)) => Err(Error::computation(err)),
            Err(panic) => Err(Error::from_panic(panic)),
        };
        self.complete(entry);
    }

    fn complete(mut self, entry: CacheEntry<V>) {
        let Some(sender) = self.sender.take() else {
            return;
        };

        {
            let mut map = self.map.lock();
            if self.owns_slot(&map) {
                match &entry {
                    Ok(value) => {
                        if let Some(slot) = map.get_mut(&self.key) {
                            *slot = Slot::Ready(value.clone());
                        }
                    }
                    Err(_) => {
                        map.remove(&self.key);
                    }
                }
            }
        }

        match &entry {
            Ok(_) => {}
            Err(Error::Cancelled) => {
                metric!(counter("caches.computation.cancelled") += 1, "cache" => &*self.name);
            }
            Err(err) => {
                tracing::debug!(
                    cache = %self.name,
                    error = err as &dyn StdError,
                    "computation failed"
                );
                metric!(
                    counter("caches.computation.failed") += 1,
                    "cache" => &*self.name,
                    "reason" => err.metrics_tag(),
                );
            }
        }

        // waiters that lost interest have dropped their receivers
        sender.send(entry).ok();
    }
}

impl<K: Eq + Hash, V> Completion<K, V> {
    fn owns_slot(&self, map: &HashMap<K, Slot<V>>) -> bool {
        matches!(
            map.get(&self.key),
            Some(Slot::Pending { generation, .. }) if *generation == self.generation
        )
    }
}

impl<K: Eq + Hash, V> Drop for Completion<K, V> {
    fn drop(&mut self) {
        let Some(sender) = self.sender.take() else {
            return;
        };

        {
            let mut map = self.map.lock();
            if self.owns_slot(&map) {
                map.remove(&self.key);
            }
        }

        metric!(counter("caches.computation.cancelled") += 1, "cache" => &*self.name);
        // dropping the sender wakes all waiters with `Canceled`
        drop(sender);
    }
}
