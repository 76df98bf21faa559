use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::Instrument;

use super::lifecycle::{ExecutorState, Lifecycle};
use super::{Execute, Task, TaskInfo};
use crate::error::Error;

struct PoolShared {
    state: ExecutorState,
    task_ready: Notify,
}

/// An executor with a fixed number of workers that run tasks from a shared FIFO queue.
///
/// The queue is unbounded. Put an [`AdmissionGate`](crate::admission::AdmissionGate) in front of
/// the pool to bound the number of queued tasks.
///
/// Dropping the pool shuts it down gracefully. Queued tasks still run.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: NonZeroUsize,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.state.lock();
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.state.name())
            .field("workers", &self.workers)
            .field("lifecycle", &inner.lifecycle)
            .field("queued", &inner.queue.len())
            .field("running", &inner.running.len())
            .finish()
    }
}

impl WorkerPool {
    /// Creates a pool and spawns its workers onto `runtime`.
    pub fn new(name: impl Into<String>, workers: NonZeroUsize, runtime: &Handle) -> Self {
        let shared = Arc::new(PoolShared {
            state: ExecutorState::new(name.into()),
            task_ready: Notify::new(),
        });
        shared.state.lock().live_workers = workers.get();

        for index in 0..workers.get() {
            let span = tracing::trace_span!("worker", pool = %shared.state.name(), index);
            runtime.spawn(worker(Arc::clone(&shared)).instrument(span));
        }

        Self { shared, workers }
    }

    pub fn workers(&self) -> NonZeroUsize {
        self.workers
    }

    /// The number of accepted tasks that have not started yet.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// The number of tasks currently running.
    pub fn running(&self) -> usize {
        self.shared.state.lock().running.len()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.state.lifecycle()
    }
}

async fn worker(shared: Arc<PoolShared>) {
    tracing::trace!("worker started");
    let started = Instant::now();

    loop {
        // registered before looking at the queue, so no wakeup between the two is missed
        let notified = shared.task_ready.notified();

        let task = {
            let mut inner = shared.state.lock();
            match inner.queue.pop_front() {
                Some(task) => {
                    inner.running.insert(task.id(), task.handle().clone());
                    if !inner.queue.is_empty() {
                        // pass the wakeup on to another idle worker
                        shared.task_ready.notify_one();
                    }
                    Some(task)
                }
                None if inner.lifecycle != Lifecycle::Running => break,
                None => None,
            }
        };

        match task {
            Some(task) => task.run(&shared.state).await,
            None => notified.await,
        }
    }

    tracing::trace!(uptime = ?started.elapsed(), "worker exiting");

    let mut inner = shared.state.lock();
    inner.live_workers = inner.live_workers.saturating_sub(1);
    if inner.live_workers == 0 {
        shared.state.terminate(&mut inner);
    }
}

impl Execute for WorkerPool {
    fn name(&self) -> &str {
        self.shared.state.name()
    }

    fn execute(&self, mut task: Task) -> Result<(), Error> {
        let mut inner = self.shared.state.lock();
        if inner.lifecycle != Lifecycle::Running {
            drop(inner);
            return Err(self.shared.state.reject(task));
        }

        task.submitted_at = Instant::now();
        inner.queue.push_back(task);
        let queued = inner.queue.len();
        drop(inner);

        metric!(gauge("pool.queue.size") = queued as u64, "pool" => self.name());
        self.shared.task_ready.notify_one();
        Ok(())
    }

    fn shutdown(&self) {
        let mut inner = self.shared.state.lock();
        if self.shared.state.begin_shutdown(&mut inner) {
            drop(inner);
            // idle workers wake up, find the queue empty, and exit
            self.shared.task_ready.notify_waiters();
        }
    }

    fn shutdown_now(&self) -> Vec<Task> {
        let mut inner = self.shared.state.lock();
        self.shared.state.begin_shutdown(&mut inner);
        let drained: Vec<_> = inner.queue.drain(..).collect();
        drop(inner);

        self.shared.state.cancel_running();
        self.shared.task_ready.notify_waiters();

        if !drained.is_empty() {
            tracing::debug!(
                pool = %self.name(),
                discarded = drained.len(),
                "discarded queued tasks on immediate shutdown"
            );
        }
        drained
    }

    fn is_shutdown(&self) -> bool {
        self.shared.state.lifecycle() != Lifecycle::Running
    }

    fn is_terminated(&self) -> bool {
        self.shared.state.lifecycle() == Lifecycle::Terminated
    }

    fn await_termination(&self, timeout: Duration) -> BoxFuture<'_, bool> {
        Box::pin(self.shared.state.await_termination(timeout))
    }

    fn cancelled_at_shutdown(&self) -> Option<Vec<TaskInfo>> {
        self.shared.state.cancelled_at_shutdown()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
