use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::runtime::Handle;

use super::lifecycle::{ExecutorState, Lifecycle};
use super::{Execute, Task, TaskId, TaskInfo};
use crate::error::Error;

/// An executor that spawns every task onto the runtime as soon as it is submitted.
///
/// There is no queue and no bound on concurrency.
pub struct SpawnPerTask {
    state: Arc<ExecutorState>,
    runtime: Handle,
}

impl fmt::Debug for SpawnPerTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.state.lock();
        f.debug_struct("SpawnPerTask")
            .field("name", &self.state.name())
            .field("lifecycle", &inner.lifecycle)
            .field("running", &inner.running.len())
            .finish()
    }
}

impl SpawnPerTask {
    pub fn new(name: impl Into<String>, runtime: Handle) -> Self {
        Self {
            state: Arc::new(ExecutorState::new(name.into())),
            runtime,
        }
    }

    /// The number of tasks currently running.
    pub fn running(&self) -> usize {
        self.state.lock().running.len()
    }
}

/// Terminates once shutdown has begun and the last task is gone.
fn terminate_if_idle(state: &ExecutorState) {
    let mut inner = state.lock();
    if inner.lifecycle == Lifecycle::ShuttingDown && inner.running.is_empty() {
        state.terminate(&mut inner);
    }
}

/// Removes a spawned task from the running set once its future is gone.
///
/// A runtime that is shutting down drops spawned futures without polling them, in which case the
/// task never reports that it finished.
struct Spawned {
    state: Arc<ExecutorState>,
    id: TaskId,
}

impl Drop for Spawned {
    fn drop(&mut self) {
        self.state.lock().running.remove(&self.id);
        terminate_if_idle(&self.state);
    }
}

impl Execute for SpawnPerTask {
    fn name(&self) -> &str {
        self.state.name()
    }

    fn execute(&self, mut task: Task) -> Result<(), Error> {
        let mut inner = self.state.lock();
        if inner.lifecycle != Lifecycle::Running {
            drop(inner);
            return Err(self.state.reject(task));
        }
        // counted as running right away, so shutdown waits for it
        inner.running.insert(task.id(), task.handle().clone());
        drop(inner);

        task.submitted_at = Instant::now();
        let spawned = Spawned {
            state: Arc::clone(&self.state),
            id: task.id(),
        };
        self.runtime.spawn(async move {
            task.run(&spawned.state).await;
            drop(spawned);
        });
        Ok(())
    }

    fn shutdown(&self) {
        let mut inner = self.state.lock();
        self.state.begin_shutdown(&mut inner);
        drop(inner);
        terminate_if_idle(&self.state);
    }

    fn shutdown_now(&self) -> Vec<Task> {
        self.shutdown();
        self.state.cancel_running();
        Vec::new()
    }

    fn is_shutdown(&self) -> bool {
        self.state.lifecycle() != Lifecycle::Running
    }

    fn is_terminated(&self) -> bool {
        self.state.lifecycle() == Lifecycle::Terminated
    }

    fn await_termination(&self, timeout: Duration) -> BoxFuture<'_, bool> {
        Box::pin(self.state.await_termination(timeout))
    }

    fn cancelled_at_shutdown(&self) -> Option<Vec<TaskInfo>> {
        self.state.cancelled_at_shutdown()
    }
}
