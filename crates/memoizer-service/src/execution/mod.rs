//! Executors that run tasks on a tokio runtime.
//!
//! Every executor implements [`Execute`] and moves through the same lifecycle:
//!
//! - While **running**, submitted tasks are accepted.
//! - [`shutdown`](Execute::shutdown) starts a graceful shutdown. New submissions are rejected
//!   with [`Error::Rejected`], tasks that were already accepted still run to completion.
//! - [`shutdown_now`](Execute::shutdown_now) also cancels all running tasks, and hands back the
//!   tasks that were accepted but never started.
//! - Once all accepted tasks are gone, the executor is **terminated**, which wakes up
//!   [`await_termination`](Execute::await_termination).
//!
//! Tasks that were running when the executor shut down, and that observed their cancellation, are
//! reported by [`cancelled_at_shutdown`](Execute::cancelled_at_shutdown). This report can contain
//! false positives: a task that completed right before its handle was cancelled is reported as
//! well. Tasks that are re-run after being reported need to be idempotent.
//!
//! There are two executors, selected by [`ExecutionPolicy`]:
//!
//! - [`WorkerPool`] runs tasks on a fixed number of workers pulling from a FIFO queue.
//! - [`SpawnPerTask`] spawns each task onto the runtime right away.
//!
//! Panics inside tasks are caught and logged, and never take a worker down.

use std::future::Future;
use std::io;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::runtime::{Handle, Runtime};

use crate::cancellation::CancellationHandle;
use crate::config::{ExecutionConfig, ExecutionPolicy};
use crate::error::Error;

mod lifecycle;
mod per_task;
mod pool;
mod task;

pub use lifecycle::Lifecycle;
pub use per_task::SpawnPerTask;
pub use pool::WorkerPool;
pub use task::{Task, TaskHandle, TaskId, TaskInfo};

/// Accepts tasks and runs them at some point in the future.
pub trait Execute: Send + Sync + std::fmt::Debug {
    /// The name of this executor, used in logs and metrics.
    fn name(&self) -> &str;

    /// Accepts `task` for execution.
    ///
    /// Fails with [`Error::Rejected`] once [`shutdown`](Self::shutdown) has been called. A
    /// rejected task is dropped without running.
    fn execute(&self, task: Task) -> Result<(), Error>;

    /// Stops accepting new tasks. Already accepted tasks still run.
    ///
    /// This does not wait for tasks to complete, use
    /// [`await_termination`](Self::await_termination) for that.
    fn shutdown(&self);

    /// Stops accepting new tasks, cancels all running tasks, and returns the tasks that were
    /// accepted but had not started.
    ///
    /// Cancellation is best effort: a task stops at its next `.await` point, or when the
    /// resources it registered are closed.
    fn shutdown_now(&self) -> Vec<Task>;

    /// Returns `true` once shutdown has begun.
    fn is_shutdown(&self) -> bool;

    /// Returns `true` once the executor has shut down and all tasks are gone.
    fn is_terminated(&self) -> bool;

    /// Waits until the executor has terminated, or the timeout elapses.
    ///
    /// Resolves to `true` if the executor terminated.
    fn await_termination(&self, timeout: Duration) -> BoxFuture<'_, bool>;

    /// Returns the tasks that were cancelled while running at shutdown.
    ///
    /// Returns `None` until the executor has terminated.
    fn cancelled_at_shutdown(&self) -> Option<Vec<TaskInfo>>;
}

/// Convenience methods for every [`Execute`], including `dyn Execute`.
pub trait ExecuteExt: Execute {
    /// Submits `future` for execution, returning a handle to its output.
    fn submit<F>(&self, future: F) -> Result<TaskHandle<F::Output>, Error>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.submit_with(|_| future)
    }

    /// Submits the future created by `f`, which gets access to the task's
    /// [`CancellationHandle`] to register resources with it.
    fn submit_with<F, Fut>(&self, f: F) -> Result<TaskHandle<Fut::Output>, Error>
    where
        F: FnOnce(CancellationHandle) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let handle = CancellationHandle::new();
        let (task, task_handle) = TaskHandle::pair(f(handle.clone()), handle);
        self.execute(task)?;
        Ok(task_handle)
    }
}

impl<E: Execute + ?Sized> ExecuteExt for E {}

/// Creates the executor selected by `config`, running on `runtime`.
pub fn executor_from_config(config: &ExecutionConfig, runtime: &Handle) -> Arc<dyn Execute> {
    match config.policy {
        ExecutionPolicy::Pooled => {
            tracing::debug!(
                name = %config.name,
                workers = config.workers.get(),
                "creating worker pool"
            );
            Arc::new(WorkerPool::new(&config.name, config.workers, runtime))
        }
        ExecutionPolicy::PerTask => {
            tracing::debug!(name = %config.name, "creating per-task executor");
            Arc::new(SpawnPerTask::new(&config.name, runtime.clone()))
        }
    }
}

/// Builds a dedicated multi-threaded runtime with named worker threads.
pub fn build_runtime(name: &str, threads: NonZeroUsize) -> io::Result<Runtime> {
    let megs = 1024 * 1024;
    tokio::runtime::Builder::new_multi_thread()
        .thread_name(format!("{name}-worker"))
        .worker_threads(threads.get())
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()
}
