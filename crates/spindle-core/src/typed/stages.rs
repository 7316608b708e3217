//! StageRegistry - パイプラインのステージと task 作成コールバックの対応表
//!
//! 起動時に各 task type の `adder` から組み立て、以降は読み取り専用。
//! poller は `(pipeline, stage)` から `AddTask` を引き、engine は完了時に
//! `task_type` からステージを逆引きします。永続化はしません。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Notify;

use super::registry::RegistryError;
use crate::domain::{
    DomainEvent, PipelineDefinition, StageRef, StoreError, TaskId, TaskType,
};
use crate::ports::{EventSink, TaskStore};

/// Task creation callback handed to a task type's `adder`.
///
/// Both ways of creating work wake the local engine's scheduling loop.
#[derive(Clone)]
pub struct AddTask {
    task_type: TaskType,
    store: Arc<dyn TaskStore>,
    events: Arc<dyn EventSink>,
    notify: Arc<Notify>,
}

impl AddTask {
    pub fn new(
        task_type: TaskType,
        store: Arc<dyn TaskStore>,
        events: Arc<dyn EventSink>,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            task_type,
            store,
            events,
            notify,
        }
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    /// Create a standalone task row.
    pub async fn create(&self, payload: serde_json::Value) -> Result<TaskId, StoreError> {
        let task_id = self.store.create_task(&self.task_type, payload).await?;
        self.events.emit(DomainEvent::TaskCreated {
            task_id,
            task_type: self.task_type.clone(),
        });
        self.notify.notify_one();
        Ok(task_id)
    }

    /// Create the task for `stage` of an entity, if nobody has yet.
    ///
    /// `None` means the guard did not match: the stage already has a task or
    /// its previous stage is not done.
    pub async fn for_stage(
        &self,
        pipeline: &PipelineDefinition,
        entity_key: &str,
        stage: &str,
    ) -> Result<Option<TaskId>, StoreError> {
        let created = self
            .store
            .enqueue_stage(pipeline, entity_key, stage, &self.task_type)
            .await?;
        if let Some(task_id) = created {
            self.events.emit(DomainEvent::StageEnqueued {
                pipeline: pipeline.table().to_string(),
                entity_key: entity_key.to_string(),
                stage: stage.to_string(),
                task_id,
            });
            self.notify.notify_one();
        }
        Ok(created)
    }
}

#[derive(Default)]
pub struct StageRegistry {
    adders: HashMap<(String, String), AddTask>,
    by_type: HashMap<TaskType, Vec<StageRef>>,
    pipelines: Vec<Arc<PipelineDefinition>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `stage` of `pipeline` to the task type behind `add`.
    pub fn register(
        &mut self,
        pipeline: &Arc<PipelineDefinition>,
        stage: &str,
        add: AddTask,
    ) -> Result<(), RegistryError> {
        pipeline.stage_index(stage)?;

        match self
            .pipelines
            .iter()
            .find(|p| p.table() == pipeline.table())
        {
            Some(known) if **known != **pipeline => {
                return Err(RegistryError::ConflictingPipeline(
                    pipeline.table().to_string(),
                ));
            }
            Some(_) => {}
            None => self.pipelines.push(Arc::clone(pipeline)),
        }

        let key = (pipeline.table().to_string(), stage.to_string());
        if self.adders.contains_key(&key) {
            return Err(RegistryError::StageAlreadyRegistered {
                pipeline: key.0,
                stage: key.1,
            });
        }
        self.by_type
            .entry(add.task_type().clone())
            .or_default()
            .push(StageRef::new(Arc::clone(pipeline), stage));
        self.adders.insert(key, add);
        Ok(())
    }

    pub fn adder(&self, pipeline: &str, stage: &str) -> Option<&AddTask> {
        self.adders
            .get(&(pipeline.to_string(), stage.to_string()))
    }

    /// Stages of `pipeline` this engine can create tasks for, in pipeline order.
    pub fn local_stages(&self, pipeline: &PipelineDefinition) -> Vec<String> {
        pipeline
            .stages()
            .iter()
            .filter(|stage| self.adder(pipeline.table(), stage).is_some())
            .cloned()
            .collect()
    }

    /// Stages whose completion flag a task of this type sets.
    pub fn stages_for(&self, task_type: &TaskType) -> &[StageRef] {
        self.by_type
            .get(task_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn pipelines(&self) -> &[Arc<PipelineDefinition>] {
        &self.pipelines
    }
}
