use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// The boxed cause of a failed computation, shared between all of its waiters.
pub type SharedCause = Arc<dyn StdError + Send + Sync + 'static>;

/// An error produced by the executors, the admission gate, or the memoizing cache.
///
/// This type is [`Clone`] because a single outcome of a deduplicated computation is delivered to
/// every caller that waited on it.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Work was submitted after its executor (or gate) started shutting down.
    ///
    /// The work is never retried by the executor.
    #[error("task rejected: executor is shut down")]
    Rejected,
    /// The caller-supplied computation returned an error.
    ///
    /// The original cause is available through [`std::error::Error::source`].
    #[error("computation failed: {0}")]
    Computation(#[source] SharedCause),
    /// The computation was cancelled, either explicitly or by an immediate shutdown, before it
    /// completed.
    #[error("computation was cancelled")]
    Cancelled,
    /// A bounded wait elapsed without success.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The computation panicked.
    ///
    /// The attached string contains the panic message, if it had one.
    #[error("computation panicked: {0}")]
    Panicked(String),
}

impl Error {
    /// Wraps the failure of a caller-supplied computation.
    pub fn computation<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self::Computation(Arc::from(err.into()))
    }

    /// Creates a [`Panicked`](Self::Panicked) error from the payload of a caught panic.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            String::from("<non-string panic payload>")
        };
        Self::Panicked(message)
    }

    /// Returns `true` if this is a [`Cancelled`](Self::Cancelled) error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// A short status name, used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Rejected => "rejected",
            Self::Computation(_) => "err",
            Self::Cancelled => "cancelled",
            Self::Timeout(_) => "timeout",
            Self::Panicked(_) => "panicked",
        }
    }
}

/// The outcome of a memoized computation: either the value, or the reason why there is none.
pub type CacheEntry<T = ()> = Result<T, Error>;
