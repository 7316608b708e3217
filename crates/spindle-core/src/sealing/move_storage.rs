//! MoveStorage - 封印済みファイルを長期保存先へ移す最後のステージ
//!
//! 書き込み可能な保存先が無い machine は候補を全て辞退します。辞退した
//! タスクは同じパスで返却され、別の machine が拾います。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use super::calls::SealCalls;
use super::storage::{FileType, PathAllocator, PathKind};
use super::{STAGE_MOVE_STORAGE, blocking, load_sector};
use crate::domain::{Outcome, PipelineDefinition, Resources, TaskError, TaskId, TaskTypeDetails};
use crate::typed::{
    AcceptData, Accepted, AddTask, EngineHandle, RegistryError, StageRegistry, TaskContext,
    TaskInterface,
};

pub struct MoveStorageTask {
    pipeline: Arc<PipelineDefinition>,
    calls: Arc<dyn SealCalls>,
    paths: Arc<dyn PathAllocator>,
    max: usize,
}

impl MoveStorageTask {
    pub fn new(
        pipeline: Arc<PipelineDefinition>,
        calls: Arc<dyn SealCalls>,
        paths: Arc<dyn PathAllocator>,
        max: usize,
    ) -> Self {
        Self {
            pipeline,
            calls,
            paths,
            max,
        }
    }
}

#[async_trait]
impl TaskInterface for MoveStorageTask {
    fn type_details(&self) -> TaskTypeDetails {
        TaskTypeDetails::new("MoveStorage")
            .with_max_concurrent(self.max)
            .with_cost(Resources::new(1.0, 0, 128 << 20))
            .with_max_failures(10)
    }

    async fn can_accept(
        &self,
        candidates: &[TaskId],
        _engine: &EngineHandle,
    ) -> Result<Option<Accepted>, TaskError> {
        let Some(storage) = self.paths.local_storage().into_iter().find(|s| s.can_store) else {
            return Ok(None);
        };
        Ok(candidates
            .first()
            .copied()
            .map(|id| Accepted::new(id).with_data(json!({ "storage_id": storage.id }))))
    }

    async fn do_task(
        &self,
        _task_id: TaskId,
        data: AcceptData,
        ctx: &TaskContext,
    ) -> Result<Outcome, TaskError> {
        let (sector, _) = load_sector(ctx, &self.pipeline, STAGE_MOVE_STORAGE).await?;

        ctx.ensure_owned().await?;

        let calls = Arc::clone(&self.calls);
        let paths = Arc::clone(&self.paths);
        let storage_id = blocking("move storage", move || {
            let from = paths.acquire(
                &sector,
                &[FileType::Sealed, FileType::Cache],
                &[],
                PathKind::Sealing,
            )?;
            let to = paths.acquire(
                &sector,
                &[],
                &[FileType::Sealed, FileType::Cache],
                PathKind::Storage,
            )?;
            if from.paths() != to.paths() {
                calls.move_storage(&sector, from.paths(), to.paths())?;
            }
            Ok(to.paths().storage_id.clone())
        })
        .await?;

        info!(
            sector = %sector,
            storage_id = %storage_id,
            chosen = %data.get("storage_id").and_then(|v| v.as_str()).unwrap_or("-"),
            "sector moved to long-term storage"
        );
        Ok(Outcome::done())
    }

    fn adder(&self, add: AddTask, stages: &mut StageRegistry) -> Result<(), RegistryError> {
        stages.register(&self.pipeline, STAGE_MOVE_STORAGE, add)
    }
}
