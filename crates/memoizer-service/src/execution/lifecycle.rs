use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::watch;

use super::task::{Task, TaskId, TaskInfo};
use crate::cancellation::CancellationHandle;

/// The lifecycle of an executor. It only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    /// New tasks are accepted.
    Running,
    /// New tasks are rejected, accepted tasks are still being run.
    ShuttingDown,
    /// All accepted tasks have completed, or were cancelled or discarded.
    Terminated,
}

/// Mutable executor state, guarded by a single lock so that lifecycle transitions and queue
/// operations are observed atomically.
#[derive(Debug)]
pub(super) struct StateInner {
    pub lifecycle: Lifecycle,
    /// Tasks accepted but not yet started. Only used by queueing executors.
    pub queue: VecDeque<Task>,
    /// Tasks that have started and not yet finished.
    pub running: HashMap<TaskId, CancellationHandle>,
    /// Workers that have not exited yet. Only used by queueing executors.
    pub live_workers: usize,
    cancelled_at_shutdown: Vec<TaskInfo>,
}

/// State shared between an executor and the tasks it runs.
#[derive(Debug)]
pub(super) struct ExecutorState {
    name: String,
    inner: Mutex<StateInner>,
    terminated: watch::Sender<bool>,
    completed_tasks: AtomicU64,
    busy_nanos: AtomicU64,
}

impl ExecutorState {
    pub fn new(name: String) -> Self {
        let (terminated, _) = watch::channel(false);
        Self {
            name,
            inner: Mutex::new(StateInner {
                lifecycle: Lifecycle::Running,
                queue: VecDeque::new(),
                running: HashMap::new(),
                live_workers: 0,
                cancelled_at_shutdown: Vec::new(),
            }),
            terminated,
            completed_tasks: AtomicU64::new(0),
            busy_nanos: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.lock().lifecycle
    }

    /// Rejects a task submitted while not running.
    ///
    /// The task is dropped here, which returns its admission permit.
    pub fn reject(&self, task: Task) -> crate::Error {
        tracing::debug!(pool = %self.name, id = %task.id(), "rejected task after shutdown");
        metric!(counter("pool.task.rejected") += 1, "pool" => &self.name);
        drop(task);
        crate::Error::Rejected
    }

    /// Moves from `Running` to `ShuttingDown`. Returns `false` if shutdown had already begun.
    pub fn begin_shutdown(&self, inner: &mut StateInner) -> bool {
        if inner.lifecycle != Lifecycle::Running {
            return false;
        }
        tracing::debug!(
            pool = %self.name,
            queued = inner.queue.len(),
            running = inner.running.len(),
            "shutting down executor"
        );
        inner.lifecycle = Lifecycle::ShuttingDown;
        true
    }

    /// Moves to `Terminated` and wakes everyone waiting for termination.
    pub fn terminate(&self, inner: &mut StateInner) {
        if inner.lifecycle == Lifecycle::Terminated {
            return;
        }
        inner.lifecycle = Lifecycle::Terminated;

        let completed = self.completed_tasks.load(Ordering::Relaxed);
        let busy = Duration::from_nanos(self.busy_nanos.load(Ordering::Relaxed));
        let average = busy.checked_div(completed as u32).unwrap_or_default();
        tracing::info!(
            pool = %self.name,
            completed,
            ?average,
            cancelled_at_shutdown = inner.cancelled_at_shutdown.len(),
            "executor terminated"
        );

        self.terminated.send_replace(true);
    }

    /// Records the end of a started task.
    ///
    /// A task whose handle is cancelled while the executor is shut down is recorded as cancelled
    /// at shutdown. This includes a task that completed right before its handle was cancelled,
    /// and one that was cancelled by its caller after a graceful shutdown started.
    pub fn task_finished(&self, info: TaskInfo, handle: &CancellationHandle, elapsed: Duration) {
        self.completed_tasks.fetch_add(1, Ordering::Relaxed);
        self.busy_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        inner.running.remove(&info.id);
        if inner.lifecycle != Lifecycle::Running && handle.is_cancelled() {
            inner.cancelled_at_shutdown.push(info);
        }
    }

    /// Cancels all running tasks. Must be called without holding the lock.
    pub fn cancel_running(&self) {
        let handles: Vec<_> = self.inner.lock().running.values().cloned().collect();
        for handle in handles {
            handle.cancel();
        }
    }

    pub async fn await_termination(&self, timeout: Duration) -> bool {
        let mut terminated = self.terminated.subscribe();
        tokio::time::timeout(timeout, terminated.wait_for(|terminated| *terminated))
            .await
            .is_ok_and(|result| result.is_ok())
    }

    pub fn cancelled_at_shutdown(&self) -> Option<Vec<TaskInfo>> {
        let inner = self.inner.lock();
        (inner.lifecycle == Lifecycle::Terminated).then(|| inner.cancelled_at_shutdown.clone())
    }
}
