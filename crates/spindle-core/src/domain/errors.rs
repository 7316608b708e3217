//! Errors - エラー型と分類
//!
//! # 分類
//! - claim の競合負け: エラーではない（`claim` が返す id が減るだけ）
//! - Retryable: 一時的な失敗。failures を増やして再キュー
//! - Permanent: リトライ無意味。そのまま dead
//! - OwnershipLost: 成功でも失敗でもない。ストアには何も書かない
//! - StoreError: ストア障害。ループはバックオフして再試行する

use super::pipeline::PipelineError;

/// Failure reported by a `TaskStore`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Connection-level trouble. Callers back off and retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("pipeline table not registered: {0}")]
    UnknownPipeline(String),

    #[error("pipeline entity not found: {pipeline}/{key}")]
    EntityNotFound { pipeline: String, key: String },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// A row that cannot be decoded into the domain model.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// Failure reported by a task type (`can_accept` or `do_task`).
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    /// Counted as a failure; the task is requeued until `max_failures`.
    #[error("{0}")]
    Retryable(String),

    /// Counted as the final failure; the task goes straight to dead.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Another engine holds the claim now. Nothing is written for this attempt.
    #[error("task ownership lost")]
    OwnershipLost,

    /// The store failed while the task was running. Retryable.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TaskError {
    pub fn retryable(message: impl Into<String>) -> Self {
        TaskError::Retryable(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        TaskError::Permanent(message.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, TaskError::Permanent(_))
    }
}
