//! TaskStore port - engine 間で共有される唯一の正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - タスク行（owner / state / failures）
//! - 実行履歴（task_history）
//! - engine の生存確認（engines）
//! - パイプラインのエンティティ行（task_id_<stage> / after_<stage>）
//!
//! # 設計原則
//! - 調整のための変更は全て「条件付き UPDATE 一回」か「トランザクション一つ」
//! - claim の権威はここにある（engine のメモリには無い）
//! - 状態は全てストアから再構築可能

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    AttemptRecord, EngineId, EngineRecord, PipelineDefinition, PipelineEntity, QueueCounts,
    StageRef, StoreError, TaskId, TaskRecord, TaskType,
};

/// TaskStore は claim / 完了 / パイプライン進行の正本
///
/// 実装は `impls::InMemoryStore`（テスト・開発用）と `impls::SqliteStore`。
/// 両者は同じ契約を満たします：
/// - `claim` は行ごとの条件付き更新（`owner IS NULL AND state = queued`）
/// - 完了系（`complete` / `requeue` / `mark_dead`）は owner が一致する時だけ適用し、
///   適用したかどうかを `bool` で返す
/// - `enqueue_stage` はガード付き UPDATE と INSERT を一つのトランザクションで行う
#[async_trait]
pub trait TaskStore: Send + Sync {
    // ========================================
    // Engines
    // ========================================

    /// 生存確認の行を作成 or 更新（heartbeat）
    async fn upsert_engine(&self, engine: &EngineRecord) -> Result<(), StoreError>;

    async fn remove_engine(&self, engine_id: EngineId) -> Result<(), StoreError>;

    // ========================================
    // Tasks
    // ========================================

    async fn create_task(
        &self,
        task_type: &TaskType,
        payload: serde_json::Value,
    ) -> Result<TaskId, StoreError>;

    async fn get_task(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// 未 claim で backoff が過ぎたタスクを作成順に最大 `limit` 件
    async fn unclaimed(&self, task_type: &TaskType, limit: usize)
    -> Result<Vec<TaskId>, StoreError>;

    /// 行ごとに claim を試み、勝ち取った id だけを返す（負けはエラーではない）
    async fn claim(
        &self,
        task_ids: &[TaskId],
        engine_id: EngineId,
    ) -> Result<Vec<TaskId>, StoreError>;

    /// 自分の claim を failures を増やさずに返却。返却した件数を返す
    async fn release(&self, task_ids: &[TaskId], engine_id: EngineId)
    -> Result<usize, StoreError>;

    async fn still_owned(&self, task_id: TaskId, engine_id: EngineId) -> Result<bool, StoreError>;

    /// 成功を記録し、`stages` のうちこのタスクを参照する完了フラグを同じ
    /// トランザクションで立てる。`output` はエンティティの payload にマージ。
    async fn complete(
        &self,
        task_id: TaskId,
        engine_id: EngineId,
        stages: &[StageRef],
        output: Option<&serde_json::Value>,
        attempt: &AttemptRecord,
    ) -> Result<bool, StoreError>;

    /// failures+1 して `retry_at` 以降に再 claim 可能にする
    async fn requeue(
        &self,
        task_id: TaskId,
        engine_id: EngineId,
        retry_at: DateTime<Utc>,
        attempt: &AttemptRecord,
    ) -> Result<bool, StoreError>;

    /// failures+1 して dead にする（終端）
    async fn mark_dead(
        &self,
        task_id: TaskId,
        engine_id: EngineId,
        attempt: &AttemptRecord,
    ) -> Result<bool, StoreError>;

    /// `lease_timeout` より長く heartbeat の無い engine の running タスクを
    /// queued に戻す（failures は増やさない）。古い engine 行も削除する。
    async fn reap_expired(&self, lease_timeout: Duration) -> Result<Vec<TaskId>, StoreError>;

    async fn history(&self, task_id: TaskId) -> Result<Vec<AttemptRecord>, StoreError>;

    async fn counts_by_state(&self) -> Result<QueueCounts, StoreError>;

    // ========================================
    // Pipelines
    // ========================================

    /// パイプラインのテーブルを用意する（冪等）
    async fn ensure_pipeline(&self, pipeline: &PipelineDefinition) -> Result<(), StoreError>;

    /// エンティティを追加。既に存在すれば `false`
    async fn insert_entity(
        &self,
        pipeline: &PipelineDefinition,
        entity_key: &str,
        payload: serde_json::Value,
    ) -> Result<bool, StoreError>;

    async fn entity(
        &self,
        pipeline: &PipelineDefinition,
        entity_key: &str,
    ) -> Result<Option<PipelineEntity>, StoreError>;

    /// `task_id_<stage> = task_id` のエンティティ
    async fn entity_for_task(
        &self,
        pipeline: &PipelineDefinition,
        stage: &str,
        task_id: TaskId,
    ) -> Result<Option<PipelineEntity>, StoreError>;

    /// `stages` のどれかが Ready なエンティティ（作成順、最大 `limit` 件）。
    /// 他の engine 向けのステージだけが Ready な行は含めない。
    async fn ready_entities(
        &self,
        pipeline: &PipelineDefinition,
        stages: &[String],
        limit: usize,
    ) -> Result<Vec<PipelineEntity>, StoreError>;

    async fn list_entities(
        &self,
        pipeline: &PipelineDefinition,
        limit: usize,
    ) -> Result<Vec<PipelineEntity>, StoreError>;

    /// ステージのタスクを作成する。ガード（`task_id_<stage> IS NULL` かつ前ステージ完了）
    /// に一致しなければ何も書かずに `None`。何度・何プロセスから呼んでも作られるのは一つだけ。
    async fn enqueue_stage(
        &self,
        pipeline: &PipelineDefinition,
        entity_key: &str,
        stage: &str,
        task_type: &TaskType,
    ) -> Result<Option<TaskId>, StoreError>;
}
