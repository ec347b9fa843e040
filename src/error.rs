//! Error types and reserved errno values.

use thiserror::Error;

use crate::state::TaskState;

/// Reserved errno values stamped by the scheduler rather than user code.
///
/// User-code failures get a positive errno derived from the failure text
/// (see [`errno_for`]); bash apps pass their exit code through verbatim.
/// Scheduler-assigned values are negative so the two ranges never collide.
pub mod errno {
    /// Task succeeded.
    pub const OK: i32 = 0;

    /// A transitive dependency ended in `FAILED` or `KILLED`.
    pub const DEPENDENCY_FAILED: i32 = -2;

    /// Heartbeat expired while `RUNNING`; the worker is presumed lost.
    pub const LOST: i32 = -3;

    /// Task was explicitly killed.
    pub const KILLED: i32 = -9;
}

/// Derive a stable nonzero errno from a failure description.
///
/// The same failure text maps to the same errno across processes and runs.
pub fn errno_for(kind: &str) -> i32 {
    let digest = blake3::hash(kind.as_bytes());
    let bytes: [u8; 4] = digest.as_bytes()[..4].try_into().unwrap_or([0; 4]);
    let raw = i32::from_le_bytes(bytes);
    // Fold into 1..=i32::MAX so it never collides with OK or reserved values.
    (raw & i32::MAX).max(1)
}

/// Error type for queue and scheduler operations.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("invalid graph: dependency cycle through task {0}")]
    InvalidGraph(String),

    #[error("queue corruption: {0}")]
    Corrupt(String),

    #[error("no task with id {0}")]
    NotFound(String),

    #[error("no queue named {0}")]
    QueueNotFound(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("unknown app: {0}")]
    UnknownApp(String),

    #[error(transparent)]
    Task(#[from] TaskFailure),
}

/// Terminal failure of a task, as observed through a [`crate::TaskFuture`].
#[derive(Error, Debug, Clone)]
#[error("task {id} ended {state} (errno {errno}): {err}")]
pub struct TaskFailure {
    /// Task id.
    pub id: String,
    /// Terminal state the task ended in.
    pub state: TaskState,
    /// Nonzero errno recorded on the row.
    pub errno: i32,
    /// Captured error text (traceback or stderr tail).
    pub err: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_is_stable_and_positive() {
        let a = errno_for("division by zero");
        let b = errno_for("division by zero");
        assert_eq!(a, b);
        assert!(a > 0);
    }

    #[test]
    fn errno_distinguishes_kinds() {
        assert_ne!(errno_for("io error"), errno_for("parse error"));
    }
}
