//! InMemoryStore - 開発・テスト用の TaskStore
//!
//! # 学習ポイント
//! - 一つの Mutex で全状態を守ると、各操作がそのままトランザクションになる
//! - ロックは `.await` を跨がない（時刻と ID はロックの外で取る）
//!
//! SQLite 実装と同じ契約を満たすので、engine / poller のテストはこちらで回します。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::lease_cutoff;
use crate::domain::pipeline::merge_payload;
use crate::domain::{
    AttemptRecord, EngineId, EngineRecord, PipelineDefinition, PipelineEntity, QueueCounts,
    StageRef, StoreError, TaskId, TaskRecord, TaskState, TaskType,
};
use crate::ports::{Clock, IdGenerator, SystemClock, TaskStore, UlidGenerator};

struct MemoryPipeline {
    definition: PipelineDefinition,
    /// 作成順に並べるため (created_at, key) をキーにする
    order: BTreeMap<(DateTime<Utc>, String), ()>,
    entities: HashMap<String, PipelineEntity>,
}

impl MemoryPipeline {
    fn ordered(&self) -> impl Iterator<Item = &PipelineEntity> {
        self.order
            .keys()
            .filter_map(|(_, key)| self.entities.get(key))
    }
}

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<TaskId, TaskRecord>,
    history: Vec<AttemptRecord>,
    engines: HashMap<EngineId, EngineRecord>,
    pipelines: HashMap<String, MemoryPipeline>,
}

impl MemoryState {
    fn owned_mut(&mut self, task_id: TaskId, engine_id: EngineId) -> Option<&mut TaskRecord> {
        self.tasks
            .get_mut(&task_id)
            .filter(|rec| rec.is_owned_by(engine_id))
    }

    fn pipeline(&self, table: &str) -> Result<&MemoryPipeline, StoreError> {
        self.pipelines
            .get(table)
            .ok_or_else(|| StoreError::UnknownPipeline(table.to_string()))
    }

    fn pipeline_mut(&mut self, table: &str) -> Result<&mut MemoryPipeline, StoreError> {
        self.pipelines
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownPipeline(table.to_string()))
    }
}

/// InMemoryStore は開発用の TaskStore
///
/// # 使用例
/// ```ignore
/// let store = Arc::new(InMemoryStore::new());
/// let id = store.create_task(&TaskType::new("SDR"), json!({})).await?;
/// ```
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator,
    available: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            ids: UlidGenerator::new(Arc::clone(&clock)),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// 障害注入: `false` の間は全操作が `StoreError::Unavailable` を返す
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".into()));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("in-memory store lock poisoned".into()))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn upsert_engine(&self, engine: &EngineRecord) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.engines.insert(engine.id, engine.clone());
        Ok(())
    }

    async fn remove_engine(&self, engine_id: EngineId) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.engines.remove(&engine_id);
        Ok(())
    }

    async fn create_task(
        &self,
        task_type: &TaskType,
        payload: serde_json::Value,
    ) -> Result<TaskId, StoreError> {
        let now = self.clock.now();
        let id = self.ids.generate_task_id();
        let mut state = self.lock()?;
        state
            .tasks
            .insert(id, TaskRecord::new(id, task_type.clone(), payload, now));
        Ok(id)
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state.tasks.get(&task_id).cloned())
    }

    async fn unclaimed(
        &self,
        task_type: &TaskType,
        limit: usize,
    ) -> Result<Vec<TaskId>, StoreError> {
        let now = self.clock.now();
        let state = self.lock()?;
        let mut candidates: Vec<&TaskRecord> = state
            .tasks
            .values()
            .filter(|rec| rec.task_type == *task_type && rec.is_claimable(now))
            .collect();
        candidates.sort_by_key(|rec| (rec.created_at, rec.id));
        Ok(candidates.into_iter().take(limit).map(|rec| rec.id).collect())
    }

    async fn claim(
        &self,
        task_ids: &[TaskId],
        engine_id: EngineId,
    ) -> Result<Vec<TaskId>, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let mut won = Vec::new();
        for id in task_ids {
            if let Some(rec) = state.tasks.get_mut(id) {
                if rec.owner.is_none() && rec.state.is_runnable() {
                    rec.claim(engine_id, now);
                    won.push(*id);
                }
            }
        }
        Ok(won)
    }

    async fn release(&self, task_ids: &[TaskId], engine_id: EngineId) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let mut released = 0;
        for id in task_ids {
            if let Some(rec) = state.owned_mut(*id, engine_id) {
                rec.release(now);
                released += 1;
            }
        }
        Ok(released)
    }

    async fn still_owned(&self, task_id: TaskId, engine_id: EngineId) -> Result<bool, StoreError> {
        let state = self.lock()?;
        Ok(state
            .tasks
            .get(&task_id)
            .is_some_and(|rec| rec.is_owned_by(engine_id)))
    }

    async fn complete(
        &self,
        task_id: TaskId,
        engine_id: EngineId,
        stages: &[StageRef],
        output: Option<&serde_json::Value>,
        attempt: &AttemptRecord,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut guard = self.lock()?;
        let state = &mut *guard;

        let mut flags = Vec::with_capacity(stages.len());
        for stage_ref in stages {
            let pipeline = state.pipeline(stage_ref.pipeline.table())?;
            let index = pipeline.definition.stage_index(&stage_ref.stage)?;
            flags.push((stage_ref.pipeline.table(), index));
        }

        let Some(rec) = state.owned_mut(task_id, engine_id) else {
            return Ok(false);
        };
        rec.mark_succeeded(now);

        for (table, index) in flags {
            let pipeline = state.pipeline_mut(table)?;
            for entity in pipeline.entities.values_mut() {
                if entity.stages[index].task_id == Some(task_id) {
                    entity.stages[index].done = true;
                    if let Some(output) = output {
                        merge_payload(&mut entity.payload, output);
                    }
                }
            }
        }
        state.history.push(attempt.clone());
        Ok(true)
    }

    async fn requeue(
        &self,
        task_id: TaskId,
        engine_id: EngineId,
        retry_at: DateTime<Utc>,
        attempt: &AttemptRecord,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let error = attempt.error().unwrap_or_default().to_string();
        let Some(rec) = state.owned_mut(task_id, engine_id) else {
            return Ok(false);
        };
        rec.schedule_retry(retry_at, error, now);
        state.history.push(attempt.clone());
        Ok(true)
    }

    async fn mark_dead(
        &self,
        task_id: TaskId,
        engine_id: EngineId,
        attempt: &AttemptRecord,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let error = attempt.error().unwrap_or_default().to_string();
        let Some(rec) = state.owned_mut(task_id, engine_id) else {
            return Ok(false);
        };
        rec.mark_dead(error, now);
        state.history.push(attempt.clone());
        Ok(true)
    }

    async fn reap_expired(&self, lease_timeout: Duration) -> Result<Vec<TaskId>, StoreError> {
        let now = self.clock.now();
        let cutoff = lease_cutoff(now, lease_timeout);
        let mut state = self.lock()?;

        state.engines.retain(|_, engine| engine.last_contact >= cutoff);
        let live: HashSet<EngineId> = state.engines.keys().copied().collect();

        let mut reaped = Vec::new();
        for rec in state.tasks.values_mut() {
            let orphaned = rec.owner.is_some_and(|owner| !live.contains(&owner));
            if rec.state == TaskState::Running && orphaned {
                rec.release(now);
                reaped.push(rec.id);
            }
        }
        reaped.sort();
        Ok(reaped)
    }

    async fn history(&self, task_id: TaskId) -> Result<Vec<AttemptRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .history
            .iter()
            .filter(|a| a.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn counts_by_state(&self) -> Result<QueueCounts, StoreError> {
        let state = self.lock()?;
        let mut counts = QueueCounts::default();
        for rec in state.tasks.values() {
            counts.add(rec.state, 1);
        }
        Ok(counts)
    }

    async fn ensure_pipeline(&self, pipeline: &PipelineDefinition) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let entry = state
            .pipelines
            .entry(pipeline.table().to_string())
            .or_insert_with(|| MemoryPipeline {
                definition: pipeline.clone(),
                order: BTreeMap::new(),
                entities: HashMap::new(),
            });
        // 追加されたステージは末尾に空の列として足す
        if entry.definition.stages().len() < pipeline.stages().len() {
            entry.definition = pipeline.clone();
            let count = pipeline.stages().len();
            for entity in entry.entities.values_mut() {
                entity.stages.resize(count, Default::default());
            }
        }
        Ok(())
    }

    async fn insert_entity(
        &self,
        pipeline: &PipelineDefinition,
        entity_key: &str,
        payload: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let memory = state.pipeline_mut(pipeline.table())?;
        if memory.entities.contains_key(entity_key) {
            return Ok(false);
        }
        let entity = PipelineEntity::new(entity_key, payload, memory.definition.stages().len());
        memory.order.insert((now, entity_key.to_string()), ());
        memory.entities.insert(entity_key.to_string(), entity);
        Ok(true)
    }

    async fn entity(
        &self,
        pipeline: &PipelineDefinition,
        entity_key: &str,
    ) -> Result<Option<PipelineEntity>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .pipeline(pipeline.table())?
            .entities
            .get(entity_key)
            .cloned())
    }

    async fn entity_for_task(
        &self,
        pipeline: &PipelineDefinition,
        stage: &str,
        task_id: TaskId,
    ) -> Result<Option<PipelineEntity>, StoreError> {
        let state = self.lock()?;
        let memory = state.pipeline(pipeline.table())?;
        let index = memory.definition.stage_index(stage)?;
        Ok(memory
            .entities
            .values()
            .find(|e| e.stages[index].task_id == Some(task_id))
            .cloned())
    }

    async fn ready_entities(
        &self,
        pipeline: &PipelineDefinition,
        stages: &[String],
        limit: usize,
    ) -> Result<Vec<PipelineEntity>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .pipeline(pipeline.table())?
            .ordered()
            .filter(|e| e.has_ready_stage_in(pipeline, stages))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_entities(
        &self,
        pipeline: &PipelineDefinition,
        limit: usize,
    ) -> Result<Vec<PipelineEntity>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .pipeline(pipeline.table())?
            .ordered()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn enqueue_stage(
        &self,
        pipeline: &PipelineDefinition,
        entity_key: &str,
        stage: &str,
        task_type: &TaskType,
    ) -> Result<Option<TaskId>, StoreError> {
        let now = self.clock.now();
        let task_id = self.ids.generate_task_id();
        let mut guard = self.lock()?;
        let state = &mut *guard;

        let memory = state.pipeline_mut(pipeline.table())?;
        let index = memory.definition.stage_index(stage)?;
        let Some(entity) = memory.entities.get_mut(entity_key) else {
            return Err(StoreError::EntityNotFound {
                pipeline: pipeline.table().to_string(),
                key: entity_key.to_string(),
            });
        };
        let previous_done = index == 0 || entity.stages[index - 1].done;
        if entity.stages[index].task_id.is_some() || !previous_done {
            return Ok(None);
        }
        entity.stages[index].task_id = Some(task_id);

        let payload = serde_json::json!({
            "pipeline": pipeline.table(),
            "entity_key": entity_key,
            "stage": stage,
        });
        state
            .tasks
            .insert(task_id, TaskRecord::new(task_id, task_type.clone(), payload, now));
        Ok(Some(task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Resources;
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use serde_json::json;
    use ulid::Ulid;

    fn store() -> (InMemoryStore, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        (InMemoryStore::with_clock(clock.clone()), clock)
    }

    fn engine() -> EngineId {
        EngineId::from_ulid(Ulid::new())
    }

    fn attempt(task_id: TaskId, engine_id: EngineId, error: Option<&str>) -> AttemptRecord {
        let now = Utc::now();
        match error {
            None => AttemptRecord::succeeded(task_id, TaskType::new("T"), engine_id, now, now),
            Some(e) => AttemptRecord::failed(task_id, TaskType::new("T"), engine_id, now, now, e),
        }
    }

    #[tokio::test]
    async fn only_one_engine_wins_a_claim() {
        let (store, _) = store();
        let id = store.create_task(&TaskType::new("T"), json!({})).await.unwrap();
        let (a, b) = (engine(), engine());

        assert_eq!(store.claim(&[id], a).await.unwrap(), vec![id]);
        assert!(store.claim(&[id], b).await.unwrap().is_empty());
        assert!(store.still_owned(id, a).await.unwrap());
        assert!(!store.still_owned(id, b).await.unwrap());
    }

    #[tokio::test]
    async fn release_only_touches_own_claims() {
        let (store, _) = store();
        let id = store.create_task(&TaskType::new("T"), json!({})).await.unwrap();
        let (a, b) = (engine(), engine());
        store.claim(&[id], a).await.unwrap();

        assert_eq!(store.release(&[id], b).await.unwrap(), 0);
        assert_eq!(store.release(&[id], a).await.unwrap(), 1);

        let rec = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(rec.owner, None);
        assert_eq!(rec.state, TaskState::Queued);
        assert_eq!(rec.failures, 0);
    }

    #[tokio::test]
    async fn requeued_task_waits_for_backoff() {
        let (store, clock) = store();
        let task_type = TaskType::new("T");
        let id = store.create_task(&task_type, json!({})).await.unwrap();
        let a = engine();
        store.claim(&[id], a).await.unwrap();

        let retry_at = clock.now() + chrono::Duration::seconds(30);
        assert!(store.requeue(id, a, retry_at, &attempt(id, a, Some("boom"))).await.unwrap());
        assert!(store.unclaimed(&task_type, 10).await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(store.unclaimed(&task_type, 10).await.unwrap(), vec![id]);

        let rec = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(rec.failures, 1);
        assert_eq!(rec.last_error.as_deref(), Some("boom"));
        assert_eq!(store.history(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn completion_is_rejected_after_ownership_moved() {
        let (store, _) = store();
        let id = store.create_task(&TaskType::new("T"), json!({})).await.unwrap();
        let (a, b) = (engine(), engine());
        store.claim(&[id], a).await.unwrap();
        store.release(&[id], a).await.unwrap();
        store.claim(&[id], b).await.unwrap();

        assert!(!store.complete(id, a, &[], None, &attempt(id, a, None)).await.unwrap());
        assert!(!store.mark_dead(id, a, &attempt(id, a, Some("x"))).await.unwrap());
        assert!(store.history(id).await.unwrap().is_empty());
        assert!(store.still_owned(id, b).await.unwrap());
    }

    #[tokio::test]
    async fn reaper_returns_tasks_of_silent_engines() {
        let (store, clock) = store();
        let id = store.create_task(&TaskType::new("T"), json!({})).await.unwrap();
        let a = engine();
        store
            .upsert_engine(&EngineRecord {
                id: a,
                host: "h".into(),
                capacity: Resources::default(),
                last_contact: clock.now(),
            })
            .await
            .unwrap();
        store.claim(&[id], a).await.unwrap();

        assert!(store.reap_expired(Duration::from_secs(60)).await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(store.reap_expired(Duration::from_secs(60)).await.unwrap(), vec![id]);

        let rec = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(rec.state, TaskState::Queued);
        assert_eq!(rec.failures, 0);
        assert!(!store.still_owned(id, a).await.unwrap());
    }

    #[tokio::test]
    async fn switched_off_store_reports_unavailable() {
        let (store, _) = store();
        store.set_available(false);

        let err = store.counts_by_state().await.unwrap_err();
        assert!(err.is_unavailable());

        store.set_available(true);
        assert_eq!(store.counts_by_state().await.unwrap().total(), 0);
    }
}
