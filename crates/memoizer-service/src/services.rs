use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use crate::admission::AdmissionGate;
use crate::caching::MemoizingCache;
use crate::config::Config;
use crate::execution::{Execute, TaskInfo, executor_from_config};

/// The executor, admission gate, and settings shared by all caches.
#[derive(Clone, Debug)]
pub struct Services {
    config: Arc<Config>,
    executor: Arc<dyn Execute>,
    admission: Option<AdmissionGate>,
}

impl Services {
    /// Creates the configured executor on `runtime`, and an admission gate if one is configured.
    pub fn new(config: Config, runtime: &Handle) -> Self {
        let executor = executor_from_config(&config.execution, runtime);
        let admission = config.admission.max_in_flight.map(AdmissionGate::new);
        if let Some(gate) = &admission {
            tracing::debug!(capacity = gate.capacity(), "throttling task submissions");
        }

        Self {
            config: Arc::new(config),
            executor,
            admission,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn executor(&self) -> &Arc<dyn Execute> {
        &self.executor
    }

    pub fn admission(&self) -> Option<&AdmissionGate> {
        self.admission.as_ref()
    }

    /// Creates a new, empty cache that runs its computations on the shared executor.
    pub fn cache<K, V>(&self, name: &str) -> MemoizingCache<K, V>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        MemoizingCache::with_options(
            name,
            Arc::clone(&self.executor),
            self.admission.clone(),
            self.config.caches.compute_timeout,
        )
    }

    /// Shuts down gracefully, waiting at most `timeout` for accepted tasks to complete.
    ///
    /// If the tasks do not complete in time, the remaining ones are cancelled. Returns the tasks
    /// that were cancelled while running, or `None` if the executor did not terminate.
    pub async fn shutdown(&self, timeout: Duration) -> Option<Vec<TaskInfo>> {
        if let Some(gate) = &self.admission {
            gate.close();
        }
        self.executor.shutdown();

        if !self.executor.await_termination(timeout).await {
            let discarded = self.executor.shutdown_now();
            tracing::warn!(
                discarded = discarded.len(),
                "executor did not terminate in time, cancelling remaining tasks"
            );
            drop(discarded);
            if !self.executor.await_termination(timeout).await {
                tracing::error!("executor did not terminate after cancelling all tasks");
                return None;
            }
        }

        self.executor.cancelled_at_shutdown()
    }
}
