//! Error types for the fiber manager.
//!
//! Two kinds of failure exist: a submission that cannot obtain a fiber
//! (`SpawnError`, returned synchronously to local submitters) and a task
//! that terminated abnormally (`TaskFailure`, delivered to a finally sink
//! or the manager's exception callback). Contract violations are not
//! errors; they are fatal assertions.

use std::any::Any;
use std::io;

/// A submission could not be turned into a runnable fiber.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The stack for a new fiber could not be mapped.
    #[error("fiber stack allocation failed: {0}")]
    StackAllocation(#[from] io::Error),
}

/// Best-effort description of a task that panicked.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TaskFailure {
    message: String,
}

impl TaskFailure {
    pub(crate) fn new(message: String) -> Self {
        TaskFailure { message }
    }

    /// Extracts a readable message from a panic payload.
    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "opaque panic payload".to_string()
        };
        TaskFailure { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// What a task produced: its value, or the failure that ended it.
pub type TaskOutcome<T> = Result<T, TaskFailure>;
