//! PreCommitSend - 前段の出力から PreCommit メッセージを組み立てて送る
//!
//! 送信は取り消せないので、直前に所有権を確認します。失敗した時の待ち時間は
//! ノード側の回復を待つため他の型より長めです。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use super::sender::{MessageSender, PreCommitMessage};
use super::{STAGE_PRECOMMIT_MSG, load_sector, payload_str};
use crate::domain::{
    Outcome, PipelineDefinition, Resources, RetryPolicy, TaskError, TaskId, TaskTypeDetails,
};
use crate::typed::{
    AcceptData, Accepted, AddTask, EngineHandle, RegistryError, StageRegistry, TaskContext,
    TaskInterface,
};

pub struct PreCommitSendTask {
    pipeline: Arc<PipelineDefinition>,
    sender: Arc<dyn MessageSender>,
    max: usize,
}

impl PreCommitSendTask {
    pub fn new(pipeline: Arc<PipelineDefinition>, sender: Arc<dyn MessageSender>, max: usize) -> Self {
        Self {
            pipeline,
            sender,
            max,
        }
    }
}

#[async_trait]
impl TaskInterface for PreCommitSendTask {
    fn type_details(&self) -> TaskTypeDetails {
        TaskTypeDetails::new("PreCommitSend")
            .with_max_concurrent(self.max)
            .with_cost(Resources::new(0.0, 0, 1 << 20))
            .with_max_failures(16)
            .with_retry(RetryPolicy::new(
                Duration::from_secs(30),
                1.5,
                Duration::from_secs(600),
            ))
    }

    async fn can_accept(
        &self,
        candidates: &[TaskId],
        _engine: &EngineHandle,
    ) -> Result<Option<Accepted>, TaskError> {
        Ok(candidates.first().copied().map(Accepted::new))
    }

    async fn do_task(
        &self,
        _task_id: TaskId,
        _data: AcceptData,
        ctx: &TaskContext,
    ) -> Result<Outcome, TaskError> {
        let (sector, entity) = load_sector(ctx, &self.pipeline, STAGE_PRECOMMIT_MSG).await?;
        let message = PreCommitMessage {
            sector,
            ticket: payload_str(&entity, "ticket")?.to_string(),
            comm_d: payload_str(&entity, "comm_d")?.to_string(),
            comm_r: payload_str(&entity, "comm_r")?.to_string(),
        };

        ctx.ensure_owned().await?;
        let cid = self.sender.send(&message).await?;

        info!(sector = %sector, cid = %cid, "precommit message sent");
        Ok(Outcome::done().with_output(json!({ "precommit_msg_cid": cid })))
    }

    fn adder(&self, add: AddTask, stages: &mut StageRegistry) -> Result<(), RegistryError> {
        stages.register(&self.pipeline, STAGE_PRECOMMIT_MSG, add)
    }
}
