//! TaskRegistry - task type の登録と管理
//!
//! # 学習ポイント
//! - `BTreeMap` にすると名前順の走査がそのまま手に入る（スケジューリング順）
//! - Arc による共有所有権（engine と builder で同じ実装を共有）

use std::collections::BTreeMap;
use std::sync::Arc;

use super::task::TaskInterface;
use crate::domain::{PipelineError, TaskType, TaskTypeDetails};

/// 登録済みの task type: 記述子と実装
#[derive(Clone)]
pub struct RegisteredTask {
    pub details: TaskTypeDetails,
    pub task: Arc<dyn TaskInterface>,
}

/// TaskRegistry は task type を名前で登録・管理
///
/// # 使用例
/// ```ignore
/// let mut registry = TaskRegistry::new();
/// registry.register(Arc::new(SdrTask::new(...)))?;
/// let sdr = registry.get("SDR");
/// ```
#[derive(Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<TaskType, RegisteredTask>,
}

/// RegistryError は登録時のエラー（起動失敗扱い）
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Task type '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("Stage '{stage}' of pipeline '{pipeline}' already has a task type")]
    StageAlreadyRegistered { pipeline: String, stage: String },

    #[error("Pipeline '{0}' is registered with two different definitions")]
    ConflictingPipeline(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task: Arc<dyn TaskInterface>) -> Result<(), RegistryError> {
        let details = task.type_details();
        if self.tasks.contains_key(&details.name) {
            return Err(RegistryError::AlreadyRegistered(details.name.to_string()));
        }
        self.tasks
            .insert(details.name.clone(), RegisteredTask { details, task });
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<&RegisteredTask> {
        self.tasks.get(&TaskType::new(task_type))
    }

    /// 名前順
    pub fn registered_types(&self) -> Vec<String> {
        self.tasks.keys().map(|t| t.to_string()).collect()
    }

    /// 名前順
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredTask> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
