//! Cancellation of running tasks, including resources that do not observe cooperative cancellation.
//!
//! Cancelling a task has two parts:
//!
//! - A cooperative flag, which the task polls via [`CancellationHandle::is_cancelled`] or awaits
//!   via [`CancellationHandle::cancelled`]. Executors also race every task against this flag, so a
//!   cancelled task is dropped at its next `.await` point.
//! - Forcibly closing every [`CancellableResource`] bound to the handle. This is needed for
//!   blocking calls that never reach an `.await` point, for example a read on a
//!   [`std::net::TcpStream`]. Closing the socket makes the read fail immediately.
//!
//! A task that registers resources is responsible for leaving no partial state behind once its
//! resources are closed underneath it.

use std::fmt;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// A resource that can be forcibly closed when the task holding it is cancelled.
pub trait CancellableResource: Send + Sync {
    /// Closes the resource, making any pending blocking operation on it fail.
    ///
    /// This may be called from any thread, and is called at most once per registration.
    fn close(&self);
}

impl CancellableResource for TcpStream {
    fn close(&self) {
        if let Err(err) = self.shutdown(Shutdown::Both) {
            // the socket may already be closed by its peer, which is just as good
            tracing::trace!(error = &err as &dyn std::error::Error, "failed to shut down socket");
        }
    }
}

impl<T: CancellableResource + ?Sized> CancellableResource for Arc<T> {
    fn close(&self) {
        (**self).close()
    }
}

/// Adapts a closure into a [`CancellableResource`].
pub struct OnCancel<F>(Mutex<Option<F>>);

impl<F> OnCancel<F>
where
    F: FnOnce() + Send,
{
    pub fn new(f: F) -> Self {
        Self(Mutex::new(Some(f)))
    }
}

impl<F> CancellableResource for OnCancel<F>
where
    F: FnOnce() + Send,
{
    fn close(&self) {
        if let Some(f) = self.0.lock().take() {
            f();
        }
    }
}

impl<F> fmt::Debug for OnCancel<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnCancel").finish_non_exhaustive()
    }
}

type ResourceId = u64;

struct Inner {
    token: CancellationToken,
    cancelled: AtomicBool,
    next_resource: AtomicU64,
    resources: Mutex<Vec<(ResourceId, Box<dyn CancellableResource>)>>,
}

/// Cancels a task and every resource bound to it.
///
/// Clones share the same state: cancelling any clone cancels all of them.
#[derive(Clone)]
pub struct CancellationHandle {
    inner: Arc<Inner>,
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationHandle")
            .field("cancelled", &self.is_cancelled())
            .field("resources", &self.inner.resources.lock().len())
            .finish()
    }
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                cancelled: AtomicBool::new(false),
                next_resource: AtomicU64::new(0),
                resources: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Requests cancellation and closes all bound resources.
    ///
    /// Only the first call has any effect.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.token.cancel();

        // close outside of the lock, closing may block for a while
        let resources = std::mem::take(&mut *self.inner.resources.lock());
        if !resources.is_empty() {
            tracing::trace!(count = resources.len(), "closing cancelled resources");
        }
        for (_, resource) in resources {
            resource.close();
        }
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Waits until the handle is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.token.cancelled()
    }

    /// Binds a resource to this handle, so that it is closed on cancellation.
    ///
    /// The binding lasts until the returned [`ResourceRegistration`] is dropped. If the handle is
    /// already cancelled, the resource is closed right away.
    pub fn register<R>(&self, resource: R) -> ResourceRegistration
    where
        R: CancellableResource + 'static,
    {
        let id = self.inner.next_resource.fetch_add(1, Ordering::Relaxed);
        let registration = ResourceRegistration {
            id,
            inner: Arc::downgrade(&self.inner),
        };

        {
            let mut resources = self.inner.resources.lock();
            // checked under the lock, so `cancel` either sees this resource or we see the flag
            if !self.is_cancelled() {
                resources.push((id, Box::new(resource)));
                return registration;
            }
        }

        resource.close();
        registration
    }

    /// Returns `true` if the resource behind `registration` is still bound to this handle.
    pub fn is_registered(&self, registration: &ResourceRegistration) -> bool {
        registration
            .inner
            .upgrade()
            .is_some_and(|inner| Arc::ptr_eq(&inner, &self.inner))
            && self
                .inner
                .resources
                .lock()
                .iter()
                .any(|(id, _)| *id == registration.id)
    }
}

/// Keeps a resource bound to a [`CancellationHandle`].
///
/// Dropping the registration unbinds the resource without closing it, so a resource that outlives
/// the task is not closed by a late cancellation.
#[must_use = "dropping the registration immediately unbinds the resource"]
pub struct ResourceRegistration {
    id: ResourceId,
    inner: std::sync::Weak<Inner>,
}

impl fmt::Debug for ResourceRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistration")
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for ResourceRegistration {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.resources.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    fn counting_resource(counter: &Arc<AtomicUsize>) -> OnCancel<impl FnOnce() + Send + 'static> {
        let counter = Arc::clone(counter);
        OnCancel::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let closed = Arc::new(AtomicUsize::new(0));
        let handle = CancellationHandle::new();
        let _registration = handle.register(counting_resource(&closed));

        assert!(!handle.is_cancelled());
        handle.cancel();
        handle.cancel();
        handle.clone().cancel();

        assert!(handle.is_cancelled());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_after_cancel_closes_immediately() {
        let closed = Arc::new(AtomicUsize::new(0));
        let handle = CancellationHandle::new();
        handle.cancel();

        let registration = handle.register(counting_resource(&closed));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(!handle.is_registered(&registration));
    }

    #[test]
    fn test_dropped_registration_is_not_closed() {
        let closed = Arc::new(AtomicUsize::new(0));
        let handle = CancellationHandle::new();

        let registration = handle.register(counting_resource(&closed));
        assert!(handle.is_registered(&registration));
        drop(registration);

        handle.cancel();
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_registration_belongs_to_handle() {
        let closed = Arc::new(AtomicUsize::new(0));
        let handle = CancellationHandle::new();
        let other = CancellationHandle::new();

        let registration = handle.register(counting_resource(&closed));
        assert!(handle.is_registered(&registration));
        assert!(handle.clone().is_registered(&registration));
        assert!(!other.is_registered(&registration));
    }

    #[tokio::test]
    async fn test_cancelled_future() {
        let handle = CancellationHandle::new();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    /// Cancelling unblocks a thread stuck in a blocking socket read.
    #[test]
    fn test_cancel_closes_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        let handle = CancellationHandle::new();
        let _registration = handle.register(server_side.try_clone().unwrap());

        let reader = std::thread::spawn(move || {
            let mut socket = server_side;
            let mut buf = [0u8; 16];
            // blocks until the peer writes, or the socket is shut down
            socket.read(&mut buf)
        });

        std::thread::sleep(Duration::from_millis(50));
        handle.cancel();

        let read = reader.join().unwrap();
        // a shut down socket reports EOF (or an error on some platforms)
        assert!(matches!(read, Ok(0) | Err(_)));
    }
}
