//! Task and queue state machines.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Lifecycle state of a task row.
///
/// Allowed transitions:
///
/// ```text
/// WAITING -> PENDING -> RUNNING -> {SUCCEEDED, FAILED, KILLED}
/// RUNNING -> UNKNOWN                      (heartbeat sweep)
/// {SUCCEEDED, FAILED, KILLED, UNKNOWN} -> PENDING   (explicit retry)
/// any -> KILLED                           (explicit kill)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Waiting,
    Pending,
    Running,
    Succeeded,
    Failed,
    Killed,
    Unknown,
}

impl TaskState {
    /// All states, in lifecycle order.
    pub const ALL: [TaskState; 7] = [
        TaskState::Waiting,
        TaskState::Pending,
        TaskState::Running,
        TaskState::Succeeded,
        TaskState::Failed,
        TaskState::Killed,
        TaskState::Unknown,
    ];

    /// A terminal task never changes state again except by explicit retry.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Killed
        )
    }

    /// True when the ordinary lattice allows `self -> to`.
    ///
    /// Explicit retry and explicit kill are not part of the lattice; the
    /// queue methods that perform them bypass this check deliberately.
    pub fn can_transition(self, to: TaskState) -> bool {
        use TaskState::*;
        match (self, to) {
            (a, b) if a == b => true,
            (Waiting, Pending) => true,
            // A waiting task whose dependency failed is failed in place.
            (Waiting, Failed) => true,
            (Pending, Running) => true,
            (Pending, Failed) => true,
            (Running, Succeeded) | (Running, Failed) | (Running, Killed) => true,
            (Running, Unknown) => true,
            _ => false,
        }
    }

    /// Validate a lattice transition, for use with `?`.
    pub fn check_transition(self, to: TaskState) -> Result<(), QueueError> {
        if self.can_transition(to) {
            Ok(())
        } else {
            Err(QueueError::InvalidTransition { from: self, to })
        }
    }

    /// The store's string form (upper-case).
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Waiting => "WAITING",
            TaskState::Pending => "PENDING",
            TaskState::Running => "RUNNING",
            TaskState::Succeeded => "SUCCEEDED",
            TaskState::Failed => "FAILED",
            TaskState::Killed => "KILLED",
            TaskState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "WAITING" => Ok(TaskState::Waiting),
            "PENDING" => Ok(TaskState::Pending),
            "RUNNING" => Ok(TaskState::Running),
            "SUCCEEDED" => Ok(TaskState::Succeeded),
            "FAILED" => Ok(TaskState::Failed),
            "KILLED" => Ok(TaskState::Killed),
            "UNKNOWN" => Ok(TaskState::Unknown),
            other => Err(QueueError::Corrupt(format!("unknown task state {other:?}"))),
        }
    }
}

/// State of a queue as a whole. Paused queues hand out no new claims but do
/// not abort in-flight tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueueState {
    Active,
    Paused,
}

impl QueueState {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueState::Active => "ACTIVE",
            QueueState::Paused => "PAUSED",
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(QueueState::Active),
            "PAUSED" => Ok(QueueState::Paused),
            other => Err(QueueError::Corrupt(format!("unknown queue state {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lattice_allows_normal_lifecycle() {
        use TaskState::*;
        assert!(Waiting.can_transition(Pending));
        assert!(Pending.can_transition(Running));
        assert!(Running.can_transition(Succeeded));
        assert!(Running.can_transition(Failed));
        assert!(Running.can_transition(Killed));
        assert!(Running.can_transition(Unknown));
    }

    #[test]
    fn lattice_rejects_shortcuts() {
        use TaskState::*;
        assert!(!Waiting.can_transition(Running));
        assert!(!Pending.can_transition(Succeeded));
        assert!(!Succeeded.can_transition(Running));
        assert!(!Succeeded.can_transition(Failed));
        assert!(!Unknown.can_transition(Running));
        assert!(!Failed.can_transition(Succeeded));
    }

    #[test]
    fn every_illegal_pair_errors() {
        for from in TaskState::ALL {
            for to in TaskState::ALL {
                let checked = from.check_transition(to).is_ok();
                assert_eq!(checked, from.can_transition(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn round_trips_through_store_form() {
        for state in TaskState::ALL {
            assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
        }
    }
}
