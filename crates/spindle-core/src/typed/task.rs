//! TaskInterface - task type が engine に提供する四つの操作
//!
//! # 学習ポイント
//! - `#[async_trait]` による object-safe な async trait（`Arc<dyn TaskInterface>` で保持）
//! - デフォルト実装付きメソッド（`adder` はステージを持たない型では何もしない）

use async_trait::async_trait;

use super::context::{EngineHandle, TaskContext};
use super::stages::{AddTask, StageRegistry};
use super::registry::RegistryError;
use crate::domain::{Outcome, TaskError, TaskId, TaskTypeDetails};

/// `can_accept` から `do_task` へ渡す、型ごとの自由なデータ
/// （例: MoveStorage が選んだ保存先）
pub type AcceptData = serde_json::Value;

/// Admission の結果: 候補から一つ選んだ task と付随データ
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    pub task_id: TaskId,
    pub data: AcceptData,
}

impl Accepted {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            data: AcceptData::Null,
        }
    }

    pub fn with_data(mut self, data: AcceptData) -> Self {
        self.data = data;
        self
    }
}

/// TaskInterface は一つの task type の振る舞い
///
/// # 使用例
/// ```ignore
/// struct Cleanup;
///
/// #[async_trait]
/// impl TaskInterface for Cleanup {
///     fn type_details(&self) -> TaskTypeDetails {
///         TaskTypeDetails::new("Cleanup").with_max_concurrent(1)
///     }
///     async fn can_accept(&self, ids: &[TaskId], _: &EngineHandle) -> Result<Option<Accepted>, TaskError> {
///         Ok(ids.first().copied().map(Accepted::new))
///     }
///     async fn do_task(&self, id: TaskId, _: AcceptData, ctx: &TaskContext) -> Result<Outcome, TaskError> {
///         Ok(Outcome::done())
///     }
/// }
/// ```
#[async_trait]
pub trait TaskInterface: Send + Sync + 'static {
    /// 静的な記述子。登録時に一度だけ読まれる
    fn type_details(&self) -> TaskTypeDetails;

    /// Admission filter
    ///
    /// 候補は全てこの engine が claim 済み。`None` は全て辞退（engine が返却する）。
    /// 選ばれなかった候補も engine が同じパスで返却します。
    async fn can_accept(
        &self,
        candidates: &[TaskId],
        engine: &EngineHandle,
    ) -> Result<Option<Accepted>, TaskError>;

    /// 本体。重い同期処理は `spawn_blocking` の中で行うこと
    ///
    /// 取り消せない副作用の前には `ctx.ensure_owned()` で所有権を確認する。
    async fn do_task(
        &self,
        task_id: TaskId,
        accept_data: AcceptData,
        ctx: &TaskContext,
    ) -> Result<Outcome, TaskError>;

    /// 起動時に一度呼ばれ、担当するパイプラインのステージに `add` を登録する
    fn adder(&self, add: AddTask, stages: &mut StageRegistry) -> Result<(), RegistryError> {
        let _ = (add, stages);
        Ok(())
    }
}
