use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::key::CacheKey;
use crate::value::Value;

/// Outcome of a unit of work as stored in the result cache.
pub type Outcome = Result<Value, TaskError>;

/// Errors raised by tasks and by the task graph runners.
///
/// Every variant is cheap to clone: wrapped sources live behind an `Arc`,
/// so a cached failure handed to several waiters stays the *same* error
/// (see [`TaskError::same_as`]).
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// A task was requested while it was still being computed by one of
    /// its own ancestors.
    #[error("cyclic task dependency found: {0}")]
    Cyclic(CacheKey),

    /// Short-circuit of the enclosing branch. Not a failure: the parent is
    /// resumed with the carried value as the branch result.
    #[error("branch aborted with {0}")]
    Abort(Value),

    #[error("unhashable argument was passed to task function {origin}: {reason}")]
    UnhashableArguments { origin: String, reason: String },

    /// `task_fn` was given a closure or function pointer, whose type name
    /// does not tell one body from another.
    #[error("{origin} has no stable identity; build it with CoroutineTask::named")]
    AnonymousFunction { origin: String },

    /// A coroutine body awaited two suspensions at the same time.
    #[error("{0} awaited several children at once; use Co::branch to run them together")]
    ConcurrentSuspension(CacheKey),

    /// The suspended body was torn down while waiting for its next input.
    #[error("task was closed before completion")]
    Closed,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    #[error("{0}")]
    Failed(Arc<anyhow::Error>),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("config error: {0}")]
    Config(String),

    /// The source cannot be built or run as detected.
    #[error("{name}: {reason}")]
    InvalidSource { name: String, reason: String },

    /// The runner has outstanding tasks but nothing it can step or wait on.
    #[error("task graph stalled with {0} unfinished task(s)")]
    Stalled(usize),
}

impl TaskError {
    /// Build an abort signal carrying the substitute branch result.
    pub fn abort(value: impl Into<Value>) -> Self {
        TaskError::Abort(value.into())
    }

    /// Wrap an arbitrary error as a task failure.
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        TaskError::Failed(Arc::new(err.into()))
    }

    /// Plain message failure.
    pub fn msg(message: impl std::fmt::Display) -> Self {
        TaskError::Failed(Arc::new(anyhow::anyhow!("{message}")))
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, TaskError::Abort(_))
    }

    pub fn is_cyclic(&self) -> bool {
        matches!(self, TaskError::Cyclic(_))
    }

    /// Downcast the payload of a [`TaskError::Failed`].
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        match self {
            TaskError::Failed(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Whether two errors share the same underlying source object.
    ///
    /// Errors without a shared source compare by variant and payload.
    pub fn same_as(&self, other: &TaskError) -> bool {
        match (self, other) {
            (TaskError::Failed(a), TaskError::Failed(b)) => Arc::ptr_eq(a, b),
            (TaskError::Io(a), TaskError::Io(b)) => Arc::ptr_eq(a, b),
            (TaskError::Spawn { source: a, .. }, TaskError::Spawn { source: b, .. }) => {
                Arc::ptr_eq(a, b)
            }
            (TaskError::Cyclic(a), TaskError::Cyclic(b)) => a == b,
            (TaskError::ConcurrentSuspension(a), TaskError::ConcurrentSuspension(b)) => a == b,
            (TaskError::Abort(a), TaskError::Abort(b)) => a == b,
            (TaskError::Panicked(a), TaskError::Panicked(b)) => a == b,
            (TaskError::Closed, TaskError::Closed) => true,
            _ => false,
        }
    }
}

impl From<io::Error> for TaskError {
    fn from(err: io::Error) -> Self {
        TaskError::Io(Arc::new(err))
    }
}
