//! Sealing - セクター封印パイプライン
//!
//! `sectors_sdr_pipeline` テーブルの一行が一つのセクター。ステージは
//! `sdr` → `trees` → `precommit_msg` → `move_storage` の順で、各ステージを
//! 一つの task type が担当します。
//!
//! # 外部との境界
//! - **SealCalls**: 同期の重い計算（SDR, TreeD, TreeRC, 保存先への移動）
//! - **PathAllocator**: セクターファイルの置き場所（lease は drop で解放）
//! - **MessageSender**: PreCommit メッセージの非同期送信

pub mod calls;
pub mod move_storage;
pub mod precommit;
pub mod sdr;
pub mod sender;
pub mod storage;
pub mod trees;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::{PipelineDefinition, PipelineEntity, PipelineError, StoreError, TaskError};
use crate::ports::TaskStore;
use crate::typed::TaskContext;

pub use self::calls::{SealCalls, SealError};
pub use self::move_storage::MoveStorageTask;
pub use self::precommit::PreCommitSendTask;
pub use self::sdr::SdrTask;
pub use self::sender::{MessageSender, PreCommitMessage, SendError};
pub use self::storage::{
    FileType, LocalPathAllocator, LocalStorageInfo, PathAllocator, PathKind, PathLease,
    SectorPaths,
};
pub use self::trees::TreesTask;

pub const SDR_PIPELINE: &str = "sectors_sdr_pipeline";

pub const STAGE_SDR: &str = "sdr";
pub const STAGE_TREES: &str = "trees";
pub const STAGE_PRECOMMIT_MSG: &str = "precommit_msg";
pub const STAGE_MOVE_STORAGE: &str = "move_storage";

pub fn sdr_pipeline() -> Result<Arc<PipelineDefinition>, PipelineError> {
    PipelineDefinition::new(
        SDR_PIPELINE,
        &[STAGE_SDR, STAGE_TREES, STAGE_PRECOMMIT_MSG, STAGE_MOVE_STORAGE],
    )
    .map(Arc::new)
}

/// Registered seal proof of a sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SealProof {
    #[serde(rename = "StackedDrg2KiBV1_1")]
    StackedDrg2KiB,
    #[serde(rename = "StackedDrg32GiBV1_1")]
    StackedDrg32GiB,
}

impl SealProof {
    pub fn sector_size(&self) -> u64 {
        match self {
            SealProof::StackedDrg2KiB => 2 << 10,
            SealProof::StackedDrg32GiB => 32 << 30,
        }
    }
}

/// Identity of a sector, stored as the entity payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectorRef {
    pub sp_id: u64,
    pub sector_number: u64,
    pub proof: SealProof,
}

impl SectorRef {
    pub fn new(sp_id: u64, sector_number: u64, proof: SealProof) -> Self {
        Self {
            sp_id,
            sector_number,
            proof,
        }
    }

    /// Entity key in the pipeline table.
    pub fn key(&self) -> String {
        format!("{}-{}", self.sp_id, self.sector_number)
    }
}

impl fmt::Display for SectorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s-t0{}-{}", self.sp_id, self.sector_number)
    }
}

/// Start sealing a sector. `false` if it is already in the pipeline.
pub async fn add_sector(
    store: &dyn TaskStore,
    pipeline: &PipelineDefinition,
    sector: &SectorRef,
) -> Result<bool, StoreError> {
    store
        .insert_entity(pipeline, &sector.key(), serde_json::to_value(sector)?)
        .await
}

/// The sector whose `stage` column holds this task, plus its entity row.
pub(crate) async fn load_sector(
    ctx: &TaskContext,
    pipeline: &PipelineDefinition,
    stage: &str,
) -> Result<(SectorRef, PipelineEntity), TaskError> {
    let entity = ctx
        .store()
        .entity_for_task(pipeline, stage, ctx.task_id())
        .await?
        .ok_or_else(|| {
            TaskError::permanent(format!(
                "no sector references task {} in stage {stage}",
                ctx.task_id()
            ))
        })?;
    let sector: SectorRef = serde_json::from_value(entity.payload.clone())
        .map_err(|e| TaskError::permanent(format!("bad sector payload {}: {e}", entity.key)))?;
    Ok((sector, entity))
}

/// Read a string field earlier stages wrote into the entity payload.
pub(crate) fn payload_str<'a>(entity: &'a PipelineEntity, field: &str) -> Result<&'a str, TaskError> {
    entity
        .payload
        .get(field)
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| TaskError::permanent(format!("sector {} has no {field}", entity.key)))
}

/// Run sync seal work off the async workers.
pub(crate) async fn blocking<T, F>(what: &str, work: F) -> Result<T, TaskError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SealError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| TaskError::retryable(format!("{what} worker died: {e}")))?
        .map_err(TaskError::from)
}
