use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use sentry::{Hub, SentryFutureExt};
use tracing::Instrument;

use super::lifecycle::ExecutorState;
use crate::admission::AdmissionPermit;
use crate::cancellation::CancellationHandle;
use crate::error::Error;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// A process-wide unique identifier of a [`Task`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// A description of a task that outlives the task itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: Option<Cow<'static, str>>,
}

/// A unit of work owned by an executor from submission until it completes or is cancelled.
///
/// Resources that the work holds are not owned by the executor. They are closed through the
/// task's [`CancellationHandle`].
pub struct Task {
    id: TaskId,
    name: Option<Cow<'static, str>>,
    pub(super) submitted_at: Instant,
    handle: CancellationHandle,
    future: BoxFuture<'static, ()>,
    permit: Option<AdmissionPermit>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("submitted_at", &self.submitted_at)
            .field("cancelled", &self.handle.is_cancelled())
            .field("admitted", &self.permit.is_some())
            .finish_non_exhaustive()
    }
}

impl Task {
    /// Creates a task with a fresh [`CancellationHandle`].
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self::with_handle(future, CancellationHandle::new())
    }

    /// Creates a task that is cancelled through the given handle.
    ///
    /// The currently active sentry [`Hub`] is propagated to the task.
    pub fn with_handle<F>(future: F, handle: CancellationHandle) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let future = future.bind_hub(Hub::new_from_top(Hub::current()));
        Self {
            id: TaskId::next(),
            name: None,
            submitted_at: Instant::now(),
            handle,
            future: Box::pin(future),
            permit: None,
        }
    }

    /// Attaches a name, used for logging and in [`TaskInfo`].
    pub fn named(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    /// The handle through which this task is cancelled.
    pub fn handle(&self) -> &CancellationHandle {
        &self.handle
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            name: self.name.clone(),
        }
    }

    /// Keeps `permit` until this task is dropped, whether it ran or not.
    pub(crate) fn hold_permit(&mut self, permit: AdmissionPermit) {
        self.permit = Some(permit);
    }

    /// Runs the task to completion, cancellation, or panic, and records the outcome in `state`.
    ///
    /// A panic is contained here, so it never takes down the worker running this task.
    pub(super) async fn run(self, state: &ExecutorState) {
        let Task {
            id,
            name,
            submitted_at,
            handle,
            future,
            permit,
        } = self;

        let started = Instant::now();
        metric!(
            timer("pool.task.wait_time") = started.duration_since(submitted_at),
            "pool" => state.name(),
        );

        let span = tracing::trace_span!("task", %id, name = name.as_deref());
        let execution = async {
            tokio::select! {
                biased;
                _ = handle.cancelled() => TaskStatus::Cancelled,
                _ = future => TaskStatus::Completed,
            }
        };
        let status = AssertUnwindSafe(execution.instrument(span))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                let error = Error::from_panic(payload);
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    %id,
                    pool = state.name(),
                    "task panicked"
                );
                TaskStatus::Panicked
            });

        let elapsed = started.elapsed();
        metric!(
            timer("pool.task.duration") = elapsed,
            "pool" => state.name(),
            "status" => status.as_str(),
        );
        tracing::trace!(%id, status = status.as_str(), ?elapsed, "task finished");

        state.task_finished(TaskInfo { id, name }, &handle, elapsed);

        // return the admission permit only after the task is fully accounted for
        drop(permit);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TaskStatus {
    Completed,
    Cancelled,
    Panicked,
}

impl TaskStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "ok",
            Self::Cancelled => "cancelled",
            Self::Panicked => "panicked",
        }
    }
}

/// Handle returned from [`ExecuteExt::submit`](super::ExecuteExt::submit).
///
/// This handle is a future resolving to the output of the submitted work once it completes on the
/// executor. It resolves to [`Error::Cancelled`] if the work was cancelled or discarded before it
/// completed, and to [`Error::Panicked`] if it panicked.
///
/// Dropping the handle does not cancel the work.
#[derive(Debug)]
pub struct TaskHandle<T> {
    id: TaskId,
    handle: CancellationHandle,
    receiver: oneshot::Receiver<Result<T, Error>>,
}

impl<T: Send + 'static> TaskHandle<T> {
    /// Wraps `future` into a [`Task`], returning the task and a handle to its output.
    pub(super) fn pair<F>(future: F, handle: CancellationHandle) -> (Task, Self)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let task = Task::with_handle(
            async move {
                let result = AssertUnwindSafe(future)
                    .catch_unwind()
                    .await
                    .map_err(Error::from_panic);
                sender.send(result).ok();
            },
            handle.clone(),
        );
        let id = task.id();
        (
            task,
            Self {
                id,
                handle,
                receiver,
            },
        )
    }
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Cancels the work behind this handle, see [`CancellationHandle::cancel`].
    pub fn cancel(&self) {
        self.handle.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    pub fn cancellation_handle(&self) -> &CancellationHandle {
        &self.handle
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(Error::Cancelled)))
    }
}
