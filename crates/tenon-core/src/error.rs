//! Error types for tasks and the executor

use std::io;
use std::time::Duration;

/// Failure delivered to a coroutine or reported as a task's outcome.
///
/// Cloneable so the same failure can be logged, propagated to a parent
/// frame, and sent on a completion channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// A readiness wait hit its deadline before the source became ready
    #[error("wait timed out")]
    TimedOut,

    /// Stream-level I/O failure (reset, broken pipe, ...)
    #[error("I/O error ({kind:?}): {message}")]
    Io {
        /// Original error kind
        kind: io::ErrorKind,
        /// Rendered error message
        message: String,
    },

    /// The coroutine panicked inside `resume` or `handle_error`
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task was cancelled by executor shutdown
    #[error("task cancelled")]
    Cancelled,

    /// Application-defined failure
    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    /// Create an application-defined failure
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }

    /// Whether this error came from a wait deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::TimedOut)
    }
}

impl From<io::Error> for TaskError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::TimedOut {
            return TaskError::TimedOut;
        }
        TaskError::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Executor-level failures, reported synchronously to the caller
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// `submit` after `stop` began, or `start` after `stop`
    #[error("executor stopped")]
    Stopped,

    /// `start` called more than once
    #[error("executor already started")]
    AlreadyStarted,

    /// Some workers did not finish their current resume within the drain window
    #[error("drain timed out after {timeout:?}: {abandoned} worker(s) did not join")]
    DrainTimeout {
        /// Configured drain window
        timeout: Duration,
        /// Number of worker threads left running
        abandoned: usize,
    },

    /// Creating the readiness poller or spawning a thread failed
    #[error("{0}")]
    Io(#[from] io::Error),
}
