//! Handles passed into task implementations.

use std::sync::Arc;

use crate::domain::{
    EngineId, LedgerSnapshot, StoreError, TaskError, TaskId, TaskRecord, TaskType,
};
use crate::ports::TaskStore;

/// What an admission filter may look at: the engine, its ledger and the store.
#[derive(Clone)]
pub struct EngineHandle {
    engine_id: EngineId,
    host: String,
    ledger: LedgerSnapshot,
    store: Arc<dyn TaskStore>,
}

impl EngineHandle {
    pub fn new(
        engine_id: EngineId,
        host: impl Into<String>,
        ledger: LedgerSnapshot,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        Self {
            engine_id,
            host: host.into(),
            ledger,
            store,
        }
    }

    pub fn engine_id(&self) -> EngineId {
        self.engine_id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Ledger as it was when the scheduling pass started.
    pub fn ledger(&self) -> &LedgerSnapshot {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }
}

/// Per-execution context for `do_task`.
#[derive(Clone)]
pub struct TaskContext {
    task_id: TaskId,
    task_type: TaskType,
    engine_id: EngineId,
    store: Arc<dyn TaskStore>,
}

impl TaskContext {
    pub fn new(
        task_id: TaskId,
        task_type: TaskType,
        engine_id: EngineId,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        Self {
            task_id,
            task_type,
            engine_id,
            store,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn engine_id(&self) -> EngineId {
        self.engine_id
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Does this engine still hold the claim, according to the store?
    pub async fn still_owned(&self) -> Result<bool, StoreError> {
        self.store.still_owned(self.task_id, self.engine_id).await
    }

    /// `Err(OwnershipLost)` unless the claim is still ours. Call before
    /// side effects that must not happen twice.
    pub async fn ensure_owned(&self) -> Result<(), TaskError> {
        if self.still_owned().await? {
            Ok(())
        } else {
            Err(TaskError::OwnershipLost)
        }
    }

    /// The task's own row (payload, failures so far).
    pub async fn record(&self) -> Result<TaskRecord, TaskError> {
        self.store
            .get_task(self.task_id)
            .await?
            .ok_or(TaskError::OwnershipLost)
    }
}
