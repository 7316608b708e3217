//! Attempt history: one row per completion that reached the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{EngineId, TaskId};
use super::task::TaskType;

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptResult {
    Succeeded,
    Failed { error: String },
}

/// A single execution attempt of a task.
///
/// Written in the same transaction as the completion it describes.
/// Attempts abandoned because ownership was lost leave no record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub engine_id: EngineId,
    pub work_start: DateTime<Utc>,
    pub work_end: DateTime<Utc>,
    #[serde(flatten)]
    pub result: AttemptResult,
}

impl AttemptRecord {
    pub fn succeeded(
        task_id: TaskId,
        task_type: TaskType,
        engine_id: EngineId,
        work_start: DateTime<Utc>,
        work_end: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            task_type,
            engine_id,
            work_start,
            work_end,
            result: AttemptResult::Succeeded,
        }
    }

    pub fn failed(
        task_id: TaskId,
        task_type: TaskType,
        engine_id: EngineId,
        work_start: DateTime<Utc>,
        work_end: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            task_type,
            engine_id,
            work_start,
            work_end,
            result: AttemptResult::Failed {
                error: error.into(),
            },
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.result {
            AttemptResult::Succeeded => None,
            AttemptResult::Failed { error } => Some(error),
        }
    }
}
