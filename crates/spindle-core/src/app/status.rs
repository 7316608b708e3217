//! Status - ストアから組み立てる現在の状況
//!
//! task の状態別件数と、パイプラインごとの各エンティティのステージ状態。
//! ステージ状態は保存されないので、ここでも列から導出します。

use std::sync::Arc;

use serde::Serialize;

use crate::domain::{PipelineDefinition, QueueCounts, StageState, StoreError};
use crate::ports::TaskStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub counts: QueueCounts,
    pub pipelines: Vec<PipelineStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub table: String,
    pub entities: Vec<EntityStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityStatus {
    pub key: String,
    pub stages: Vec<(String, StageState)>,
}

impl EntityStatus {
    /// Stage the entity is currently waiting on, if any.
    pub fn current_stage(&self) -> Option<&str> {
        self.stages
            .iter()
            .find(|(_, state)| *state != StageState::Done)
            .map(|(stage, _)| stage.as_str())
    }
}

impl StatusReport {
    /// Read the report; at most `limit` entities per pipeline.
    pub async fn collect(
        store: &dyn TaskStore,
        pipelines: &[Arc<PipelineDefinition>],
        limit: usize,
    ) -> Result<Self, StoreError> {
        let counts = store.counts_by_state().await?;

        let mut statuses = Vec::with_capacity(pipelines.len());
        for pipeline in pipelines {
            let entities = store
                .list_entities(pipeline, limit)
                .await?
                .into_iter()
                .map(|entity| EntityStatus {
                    stages: pipeline
                        .stages()
                        .iter()
                        .cloned()
                        .zip(entity.stage_states())
                        .collect(),
                    key: entity.key,
                })
                .collect();
            statuses.push(PipelineStatus {
                table: pipeline.table().to_string(),
                entities,
            });
        }

        Ok(Self {
            counts,
            pipelines: statuses,
        })
    }
}
