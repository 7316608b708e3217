//! PipelinePoller - Ready なステージにタスクを作る
//!
//! どの engine で何個動かしても安全です。作成の可否はストアのガード付き
//! UPDATE（`task_id_<stage> IS NULL` かつ前ステージ完了）だけで決まり、
//! 負けた側は何も書かずに `None` を受け取ります。
//!
//! この engine で有効になっていない task type のステージ（adder 未登録）は
//! 問い合わせの段階で除外します。別の engine の poller が作ります。

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use super::config::PollerConfig;
use crate::domain::{StageState, StoreError};
use crate::ports::TaskStore;
use crate::typed::StageRegistry;

pub struct PipelinePoller {
    store: Arc<dyn TaskStore>,
    stages: Arc<StageRegistry>,
    config: PollerConfig,
}

impl PipelinePoller {
    pub fn new(store: Arc<dyn TaskStore>, stages: Arc<StageRegistry>, config: PollerConfig) -> Self {
        Self {
            store,
            stages,
            config,
        }
    }

    /// One pass over every registered pipeline. Returns how many stage tasks
    /// this pass created.
    pub async fn poll_once(&self) -> Result<usize, StoreError> {
        let mut created = 0;
        for pipeline in self.stages.pipelines() {
            let local = self.stages.local_stages(pipeline);
            if local.is_empty() {
                continue;
            }
            let entities = self
                .store
                .ready_entities(pipeline, &local, self.config.batch_size)
                .await?;

            for entity in entities {
                for (stage, state) in pipeline.stages().iter().zip(entity.stage_states()) {
                    if state != StageState::Ready {
                        continue;
                    }
                    let Some(add) = self.stages.adder(pipeline.table(), stage) else {
                        continue;
                    };
                    match add.for_stage(pipeline, &entity.key, stage).await {
                        Ok(Some(task_id)) => {
                            created += 1;
                            debug!(
                                pipeline = pipeline.table(),
                                entity_key = %entity.key,
                                stage = %stage,
                                task_id = %task_id,
                                "stage task created"
                            );
                        }
                        Ok(None) => {}
                        Err(err @ StoreError::EntityNotFound { .. }) => {
                            debug!(error = %err, "entity vanished before enqueue");
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }
        Ok(created)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            pipelines = self.stages.pipelines().len(),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "starting pipeline poller"
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once().await {
                        warn!(error = %err, "pipeline poll failed");
                    }
                }
            }
        }
        info!("pipeline poller stopped");
    }
}
