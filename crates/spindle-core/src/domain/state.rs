//! Task state machine as persisted in the store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Task state.
///
/// State transitions:
/// - Queued -> Running -> Succeeded
/// - Queued -> Running -> Queued (failure below max_failures, or lease reaped)
/// - Queued -> Running -> Dead (max_failures reached, or permanent error)
///
/// `owner` is set exactly when the state is `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Claimable once `not_before` has passed.
    Queued,

    /// Claimed by an engine.
    Running,

    /// Done. The row is kept for history.
    Succeeded,

    /// Failed permanently, never claimable again.
    Dead,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Dead)
    }

    /// Is this task eligible for a claim?
    pub fn is_runnable(self) -> bool {
        matches!(self, TaskState::Queued)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Dead => "dead",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown task state: {0}")]
pub struct UnknownTaskState(pub String);

impl FromStr for TaskState {
    type Err = UnknownTaskState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskState::Queued),
            "running" => Ok(TaskState::Running),
            "succeeded" => Ok(TaskState::Succeeded),
            "dead" => Ok(TaskState::Dead),
            other => Err(UnknownTaskState(other.to_string())),
        }
    }
}

/// Number of task rows per state, for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub dead: usize,
}

impl QueueCounts {
    pub fn add(&mut self, state: TaskState, n: usize) {
        match state {
            TaskState::Queued => self.queued += n,
            TaskState::Running => self.running += n,
            TaskState::Succeeded => self.succeeded += n,
            TaskState::Dead => self.dead += n,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.running + self.succeeded + self.dead
    }
}
