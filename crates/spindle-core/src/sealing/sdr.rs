//! SDR - 最初のステージ。セクターの層を生成する

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use super::calls::SealCalls;
use super::storage::{FileType, PathAllocator, PathKind};
use super::{STAGE_SDR, blocking, load_sector};
use crate::domain::{Outcome, PipelineDefinition, Resources, TaskError, TaskId, TaskTypeDetails};
use crate::typed::{
    AcceptData, Accepted, AddTask, EngineHandle, RegistryError, StageRegistry, TaskContext,
    TaskInterface,
};

pub struct SdrTask {
    pipeline: Arc<PipelineDefinition>,
    calls: Arc<dyn SealCalls>,
    paths: Arc<dyn PathAllocator>,
    max: usize,
}

impl SdrTask {
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
impl TaskInterface for SdrTask {
    fn type_details(&self) -> TaskTypeDetails {
        TaskTypeDetails::new("SDR")
            .with_max_concurrent(self.max)
            .with_cost(Resources::new(4.0, 0, 54 << 30))
            .with_max_failures(2)
    }

    async fn can_accept(
        &self,
        candidates: &[TaskId],
        _engine: &EngineHandle,
    ) -> Result<Option<Accepted>, TaskError> {
        if !self.paths.local_storage().iter().any(|s| s.can_seal) {
            return Ok(None);
        }
        Ok(candidates.first().copied().map(Accepted::new))
    }

    async fn do_task(
        &self,
        _task_id: TaskId,
        _data: AcceptData,
        ctx: &TaskContext,
    ) -> Result<Outcome, TaskError> {
        let (sector, _) = load_sector(ctx, &self.pipeline, STAGE_SDR).await?;
        let ticket = new_ticket();

        let calls = Arc::clone(&self.calls);
        let paths = Arc::clone(&self.paths);
        let for_layers = ticket.clone();
        blocking("sdr", move || {
            let lease = paths.acquire(&sector, &[], &[FileType::Cache], PathKind::Sealing)?;
            calls.generate_sdr(&sector, lease.paths(), &for_layers)
        })
        .await?;

        info!(sector = %sector, "sdr layers generated");
        Ok(Outcome::done().with_output(json!({ "ticket": ticket })))
    }

    fn adder(&self, add: AddTask, stages: &mut StageRegistry) -> Result<(), RegistryError> {
        stages.register(&self.pipeline, STAGE_SDR, add)
    }
}

/// Sealing randomness, hex encoded.
fn new_ticket() -> String {
    (0..32).map(|_| format!("{:02x}", rand::random::<u8>())).collect()
}
