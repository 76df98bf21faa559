//! Throttles submissions to an executor.
//!
//! An [`AdmissionGate`] bounds the number of tasks that are queued or running at the same time.
//! Submitters wait for a free slot instead of growing an executor's queue without bounds. The
//! slot is held by the task and freed when the task is dropped, which happens exactly once:
//! after it ran, when its executor rejected it, or when it was discarded by an immediate
//! shutdown.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::Error;
use crate::execution::{Execute, Task};

/// A slot in an [`AdmissionGate`].
///
/// The slot is returned to the gate when the permit is released or dropped.
#[must_use = "dropping the permit immediately frees the slot"]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionPermit {
    /// Returns the slot to its gate.
    pub fn release(self) {}
}

impl fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionPermit").finish_non_exhaustive()
    }
}

/// Bounds the number of in-flight tasks.
#[derive(Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AdmissionGate {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity.get())),
            capacity: capacity.get(),
        }
    }

    /// Waits for a free slot.
    ///
    /// Fails with [`Error::Rejected`] once the gate is closed.
    pub async fn acquire(&self) -> Result<AdmissionPermit, Error> {
        let start = Instant::now();
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::Rejected)?;
        metric!(timer("admission.wait_time") = start.elapsed());
        Ok(AdmissionPermit { _permit: permit })
    }

    /// Waits for a free slot for at most `timeout`.
    pub async fn try_acquire(&self, timeout: Duration) -> Result<AdmissionPermit, Error> {
        match tokio::time::timeout(timeout, self.acquire()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(?timeout, "timed out waiting for admission");
                metric!(counter("admission.timeout") += 1);
                Err(Error::Timeout(timeout))
            }
        }
    }

    /// The number of free slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stops handing out slots. Pending and future acquisitions fail with [`Error::Rejected`].
    ///
    /// Permits that are already out stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Waits for a free slot, then submits `task` to `executor`.
    ///
    /// The slot is freed once the task has run. If the executor rejects the task, the slot is
    /// freed right away.
    ///
    /// If the task is cancelled while waiting for a slot, it is dropped without ever being
    /// submitted and this returns [`Error::Cancelled`].
    pub async fn submit<E>(&self, executor: &E, mut task: Task) -> Result<(), Error>
    where
        E: Execute + ?Sized,
    {
        let handle = task.handle().clone();
        let permit = tokio::select! {
            biased;
            _ = handle.cancelled() => {
                tracing::trace!(id = %task.id(), "task cancelled while waiting for admission");
                drop(task);
                return Err(Error::Cancelled);
            }
            permit = self.acquire() => permit?,
        };
        task.hold_permit(permit);
        executor.execute(task)
    }
}
