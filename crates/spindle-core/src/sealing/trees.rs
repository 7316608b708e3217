//! Trees - TreeD と TreeRC を作る GPU ステージ
//!
//! SDR の cache が既にこの machine にあるセクターを優先して選びます
//! （巨大な cache の転送を避けるため）。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use super::calls::SealCalls;
use super::storage::{FileType, PathAllocator, PathKind};
use super::{STAGE_TREES, SectorRef, blocking, load_sector};
use crate::domain::{Outcome, PipelineDefinition, Resources, TaskError, TaskId, TaskTypeDetails};
use crate::typed::{
    AcceptData, Accepted, AddTask, EngineHandle, RegistryError, StageRegistry, TaskContext,
    TaskInterface,
};

pub struct TreesTask {
    pipeline: Arc<PipelineDefinition>,
    calls: Arc<dyn SealCalls>,
    paths: Arc<dyn PathAllocator>,
    max: usize,
}

impl TreesTask {
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
impl TaskInterface for TreesTask {
    fn type_details(&self) -> TaskTypeDetails {
        TaskTypeDetails::new("SDRTrees")
            .with_max_concurrent(self.max)
            .with_cost(Resources::new(1.0, 1, 8 << 30))
            .with_max_failures(3)
    }

    async fn can_accept(
        &self,
        candidates: &[TaskId],
        engine: &EngineHandle,
    ) -> Result<Option<Accepted>, TaskError> {
        for task_id in candidates {
            let Some(entity) = engine
                .store()
                .entity_for_task(&self.pipeline, STAGE_TREES, *task_id)
                .await?
            else {
                continue;
            };
            let Ok(sector) = serde_json::from_value::<SectorRef>(entity.payload) else {
                continue;
            };
            if self.paths.has_local(&sector, FileType::Cache) {
                debug!(sector = %sector, task_id = %task_id, "sdr cache is local");
                return Ok(Some(Accepted::new(*task_id)));
            }
        }
        Ok(candidates.first().copied().map(Accepted::new))
    }

    async fn do_task(
        &self,
        _task_id: TaskId,
        _data: AcceptData,
        ctx: &TaskContext,
    ) -> Result<Outcome, TaskError> {
        let (sector, _) = load_sector(ctx, &self.pipeline, STAGE_TREES).await?;

        let calls = Arc::clone(&self.calls);
        let paths = Arc::clone(&self.paths);
        let (comm_d, comm_r) = blocking("trees", move || {
            let lease = paths.acquire(
                &sector,
                &[FileType::Cache],
                &[FileType::Sealed],
                PathKind::Sealing,
            )?;
            let comm_d = calls.tree_d(&sector, lease.paths())?;
            let comm_r = calls.tree_rc(&sector, lease.paths(), &comm_d)?;
            Ok((comm_d, comm_r))
        })
        .await?;

        info!(sector = %sector, comm_r = %comm_r, "trees built");
        Ok(Outcome::done().with_output(json!({ "comm_d": comm_d, "comm_r": comm_r })))
    }

    fn adder(&self, add: AddTask, stages: &mut StageRegistry) -> Result<(), RegistryError> {
        stages.register(&self.pipeline, STAGE_TREES, add)
    }
}
