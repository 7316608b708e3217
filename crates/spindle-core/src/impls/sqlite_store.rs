//! SQLite implementation of TaskStore.
//!
//! Timestamps are stored as epoch milliseconds, ids as bare ULID strings.
//! Pipeline tables are created at startup from their definitions; their
//! identifiers are validated by `PipelineDefinition`, which is what makes the
//! `format!`-built statements below safe.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};

use super::lease_cutoff;
use crate::domain::ids::{Id, IdMarker};
use crate::domain::pipeline::merge_payload;
use crate::domain::{
    AttemptRecord, AttemptResult, EngineId, EngineRecord, PipelineDefinition, PipelineEntity,
    QueueCounts, StageRef, StageStatus, StoreError, TaskId, TaskRecord, TaskState, TaskType,
};
use crate::ports::{Clock, IdGenerator, SystemClock, TaskStore, UlidGenerator};

const TASK_COLUMNS: &str = "id, task_type, owner_id, state, failures, not_before_ms, last_error, \
                            payload, created_at_ms, updated_at_ms";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let unavailable = match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => true,
            sqlx::Error::Database(db) => {
                let message = db.message();
                message.contains("database is locked") || message.contains("busy")
            }
            _ => false,
        };
        if unavailable {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

/// SQLite-backed task store.
pub struct SqliteStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator,
}

impl SqliteStore {
    /// Wrap an existing pool. Call [`SqliteStore::run_migrations`] before use.
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            ids: UlidGenerator::new(Arc::clone(&clock)),
            clock,
        }
    }

    /// Open (creating if missing) the database at `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        // every in-memory connection would be its own database
        let max_connections = if url.contains(":memory:") { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        let store = Self::new(pool, Arc::new(SystemClock));
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the generic tables (tasks, task_history, engines).
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                owner_id TEXT,
                state TEXT NOT NULL DEFAULT 'queued',
                failures INTEGER NOT NULL DEFAULT 0,
                not_before_ms INTEGER,
                last_error TEXT,
                payload TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tasks_claimable
            ON tasks(task_type, state, created_at_ms)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tasks_owner
            ON tasks(owner_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                task_type TEXT NOT NULL,
                engine_id TEXT NOT NULL,
                work_start_ms INTEGER NOT NULL,
                work_end_ms INTEGER NOT NULL,
                succeeded INTEGER NOT NULL,
                error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_task_history_task
            ON task_history(task_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS engines (
                id TEXT PRIMARY KEY,
                host TEXT NOT NULL,
                cpu REAL NOT NULL,
                gpu INTEGER NOT NULL,
                ram INTEGER NOT NULL,
                last_contact_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn parse_id<T: IdMarker>(raw: &str) -> Result<Id<T>, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("bad id {raw:?}: {e}")))
}

fn task_from_row(row: &SqliteRow) -> Result<TaskRecord, StoreError> {
    let id: String = row.try_get("id")?;
    let task_type: String = row.try_get("task_type")?;
    let owner: Option<String> = row.try_get("owner_id")?;
    let state: String = row.try_get("state")?;
    let failures: i64 = row.try_get("failures")?;
    let not_before: Option<i64> = row.try_get("not_before_ms")?;
    let payload: String = row.try_get("payload")?;

    Ok(TaskRecord {
        id: parse_id(&id)?,
        task_type: TaskType::new(task_type),
        owner: owner.as_deref().map(parse_id).transpose()?,
        state: TaskState::from_str(&state).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        failures: u32::try_from(failures)
            .map_err(|_| StoreError::Corrupt(format!("bad failure count {failures}")))?,
        not_before: not_before.map(from_ms).transpose()?,
        last_error: row.try_get("last_error")?,
        payload: serde_json::from_str(&payload)?,
        created_at: from_ms(row.try_get("created_at_ms")?)?,
        updated_at: from_ms(row.try_get("updated_at_ms")?)?,
    })
}

fn attempt_from_row(row: &SqliteRow) -> Result<AttemptRecord, StoreError> {
    let task_id: String = row.try_get("task_id")?;
    let engine_id: String = row.try_get("engine_id")?;
    let succeeded: bool = row.try_get("succeeded")?;
    let result = if succeeded {
        AttemptResult::Succeeded
    } else {
        AttemptResult::Failed {
            error: row
                .try_get::<Option<String>, _>("error")?
                .unwrap_or_default(),
        }
    };
    Ok(AttemptRecord {
        task_id: parse_id(&task_id)?,
        task_type: TaskType::new(row.try_get::<String, _>("task_type")?),
        engine_id: parse_id(&engine_id)?,
        work_start: from_ms(row.try_get("work_start_ms")?)?,
        work_end: from_ms(row.try_get("work_end_ms")?)?,
        result,
    })
}

async fn insert_history(
    conn: &mut SqliteConnection,
    attempt: &AttemptRecord,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO task_history
            (task_id, task_type, engine_id, work_start_ms, work_end_ms, succeeded, error)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(attempt.task_id.to_column())
    .bind(attempt.task_type.as_str())
    .bind(attempt.engine_id.to_column())
    .bind(attempt.work_start.timestamp_millis())
    .bind(attempt.work_end.timestamp_millis())
    .bind(matches!(attempt.result, AttemptResult::Succeeded))
    .bind(attempt.error())
    .execute(conn)
    .await?;
    Ok(())
}

/// `entity_key, payload, task_id_<s>, after_<s>, ...` in stage order.
fn entity_columns(pipeline: &PipelineDefinition) -> String {
    let mut columns = String::from("entity_key, payload");
    for stage in pipeline.stages() {
        columns.push_str(", ");
        columns.push_str(&PipelineDefinition::task_column(stage));
        columns.push_str(", ");
        columns.push_str(&PipelineDefinition::done_column(stage));
    }
    columns
}

fn entity_from_row(
    pipeline: &PipelineDefinition,
    row: &SqliteRow,
) -> Result<PipelineEntity, StoreError> {
    let key: String = row.try_get(0usize)?;
    let payload: String = row.try_get(1usize)?;
    let mut stages = Vec::with_capacity(pipeline.stages().len());
    for i in 0..pipeline.stages().len() {
        let task_id: Option<String> = row.try_get(2 + 2 * i)?;
        let done: bool = row.try_get(3 + 2 * i)?;
        stages.push(StageStatus {
            task_id: task_id.as_deref().map(parse_id).transpose()?,
            done,
        });
    }
    Ok(PipelineEntity {
        key,
        payload: serde_json::from_str(&payload)?,
        stages,
    })
}

/// One of `wanted` is Ready: its task is unset and the previous flag is set.
/// Column names come from the definition, never from `wanted`.
fn ready_condition(pipeline: &PipelineDefinition, wanted: &[String]) -> String {
    pipeline
        .stages()
        .iter()
        .enumerate()
        .filter(|(_, stage)| wanted.contains(stage))
        .map(|(i, stage)| {
            let task_col = PipelineDefinition::task_column(stage);
            match pipeline.previous_stage(i) {
                None => format!("({task_col} IS NULL)"),
                Some(prev) => format!(
                    "({} = 1 AND {task_col} IS NULL)",
                    PipelineDefinition::done_column(prev)
                ),
            }
        })
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn upsert_engine(&self, engine: &EngineRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO engines (id, host, cpu, gpu, ram, last_contact_ms)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                host = excluded.host,
                cpu = excluded.cpu,
                gpu = excluded.gpu,
                ram = excluded.ram,
                last_contact_ms = excluded.last_contact_ms
            "#,
        )
        .bind(engine.id.to_column())
        .bind(&engine.host)
        .bind(engine.capacity.cpu)
        .bind(i64::from(engine.capacity.gpu))
        .bind(i64::try_from(engine.capacity.ram).unwrap_or(i64::MAX))
        .bind(engine.last_contact.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_engine(&self, engine_id: EngineId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM engines WHERE id = ?")
            .bind(engine_id.to_column())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_task(
        &self,
        task_type: &TaskType,
        payload: serde_json::Value,
    ) -> Result<TaskId, StoreError> {
        let id = self.ids.generate_task_id();
        let now = self.now_ms();
        sqlx::query(
            r#"
            INSERT INTO tasks (id, task_type, payload, created_at_ms, updated_at_ms)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_column())
        .bind(task_type.as_str())
        .bind(serde_json::to_string(&payload)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(task_id.to_column())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn unclaimed(
        &self,
        task_type: &TaskType,
        limit: usize,
    ) -> Result<Vec<TaskId>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM tasks
            WHERE task_type = ?
              AND state = 'queued'
              AND owner_id IS NULL
              AND (not_before_ms IS NULL OR not_before_ms <= ?)
            ORDER BY created_at_ms, id
            LIMIT ?
            "#,
        )
        .bind(task_type.as_str())
        .bind(self.now_ms())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        ids.iter().map(|raw| parse_id(raw)).collect()
    }

    async fn claim(
        &self,
        task_ids: &[TaskId],
        engine_id: EngineId,
    ) -> Result<Vec<TaskId>, StoreError> {
        let now = self.now_ms();
        let mut won = Vec::new();
        // one conditional update per row: losing a row to another engine is not an error
        for id in task_ids {
            let result = sqlx::query(
                r#"
                UPDATE tasks
                SET owner_id = ?, state = 'running', updated_at_ms = ?
                WHERE id = ? AND owner_id IS NULL AND state = 'queued'
                "#,
            )
            .bind(engine_id.to_column())
            .bind(now)
            .bind(id.to_column())
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 1 {
                won.push(*id);
            }
        }
        Ok(won)
    }

    async fn release(&self, task_ids: &[TaskId], engine_id: EngineId) -> Result<usize, StoreError> {
        let now = self.now_ms();
        let mut released = 0;
        for id in task_ids {
            let result = sqlx::query(
                r#"
                UPDATE tasks
                SET owner_id = NULL, state = 'queued', updated_at_ms = ?
                WHERE id = ? AND owner_id = ? AND state = 'running'
                "#,
            )
            .bind(now)
            .bind(id.to_column())
            .bind(engine_id.to_column())
            .execute(&self.pool)
            .await?;
            released += result.rows_affected() as usize;
        }
        Ok(released)
    }

    async fn still_owned(&self, task_id: TaskId, engine_id: EngineId) -> Result<bool, StoreError> {
        let owned: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM tasks WHERE id = ? AND owner_id = ? AND state = 'running'",
        )
        .bind(task_id.to_column())
        .bind(engine_id.to_column())
        .fetch_optional(&self.pool)
        .await?;
        Ok(owned.is_some())
    }

    async fn complete(
        &self,
        task_id: TaskId,
        engine_id: EngineId,
        stages: &[StageRef],
        output: Option<&serde_json::Value>,
        attempt: &AttemptRecord,
    ) -> Result<bool, StoreError> {
        for stage_ref in stages {
            stage_ref.pipeline.stage_index(&stage_ref.stage)?;
        }

        let mut tx = self.pool.begin().await?;
        // the write comes first so the transaction holds the write lock from here on
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET owner_id = NULL, state = 'succeeded', updated_at_ms = ?
            WHERE id = ? AND owner_id = ? AND state = 'running'
            "#,
        )
        .bind(self.now_ms())
        .bind(task_id.to_column())
        .bind(engine_id.to_column())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for stage_ref in stages {
            let table = stage_ref.pipeline.table();
            let task_col = PipelineDefinition::task_column(&stage_ref.stage);
            let done_col = PipelineDefinition::done_column(&stage_ref.stage);

            match output {
                None => {
                    let sql = format!("UPDATE {table} SET {done_col} = 1 WHERE {task_col} = ?");
                    sqlx::query(&sql)
                        .bind(task_id.to_column())
                        .execute(&mut *tx)
                        .await?;
                }
                Some(output) => {
                    let sql = format!("SELECT entity_key, payload FROM {table} WHERE {task_col} = ?");
                    let rows: Vec<(String, String)> = sqlx::query_as(&sql)
                        .bind(task_id.to_column())
                        .fetch_all(&mut *tx)
                        .await?;
                    let sql = format!(
                        "UPDATE {table} SET {done_col} = 1, payload = ? WHERE entity_key = ?"
                    );
                    for (key, payload) in rows {
                        let mut payload: serde_json::Value = serde_json::from_str(&payload)?;
                        merge_payload(&mut payload, output);
                        sqlx::query(&sql)
                            .bind(serde_json::to_string(&payload)?)
                            .bind(key)
                            .execute(&mut *tx)
                            .await?;
                    }
                }
            }
        }

        insert_history(&mut tx, attempt).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn requeue(
        &self,
        task_id: TaskId,
        engine_id: EngineId,
        retry_at: DateTime<Utc>,
        attempt: &AttemptRecord,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET owner_id = NULL, state = 'queued', failures = failures + 1,
                not_before_ms = ?, last_error = ?, updated_at_ms = ?
            WHERE id = ? AND owner_id = ? AND state = 'running'
            "#,
        )
        .bind(retry_at.timestamp_millis())
        .bind(attempt.error())
        .bind(self.now_ms())
        .bind(task_id.to_column())
        .bind(engine_id.to_column())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        insert_history(&mut tx, attempt).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn mark_dead(
        &self,
        task_id: TaskId,
        engine_id: EngineId,
        attempt: &AttemptRecord,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET owner_id = NULL, state = 'dead', failures = failures + 1,
                last_error = ?, updated_at_ms = ?
            WHERE id = ? AND owner_id = ? AND state = 'running'
            "#,
        )
        .bind(attempt.error())
        .bind(self.now_ms())
        .bind(task_id.to_column())
        .bind(engine_id.to_column())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        insert_history(&mut tx, attempt).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn reap_expired(&self, lease_timeout: Duration) -> Result<Vec<TaskId>, StoreError> {
        let now = self.clock.now();
        let cutoff = lease_cutoff(now, lease_timeout).timestamp_millis();

        let mut tx = self.pool.begin().await?;
        let reaped: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE tasks
            SET owner_id = NULL, state = 'queued', updated_at_ms = ?
            WHERE state = 'running'
              AND (owner_id IS NULL
                   OR owner_id NOT IN (SELECT id FROM engines WHERE last_contact_ms >= ?))
            RETURNING id
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM engines WHERE last_contact_ms < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut ids = reaped
            .iter()
            .map(|raw| parse_id(raw))
            .collect::<Result<Vec<TaskId>, _>>()?;
        ids.sort();
        Ok(ids)
    }

    async fn history(&self, task_id: TaskId) -> Result<Vec<AttemptRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT task_id, task_type, engine_id, work_start_ms, work_end_ms, succeeded, error
            FROM task_history
            WHERE task_id = ?
            ORDER BY id
            "#,
        )
        .bind(task_id.to_column())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn counts_by_state(&self) -> Result<QueueCounts, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM tasks GROUP BY state")
                .fetch_all(&self.pool)
                .await?;
        let mut counts = QueueCounts::default();
        for (state, n) in rows {
            let state = TaskState::from_str(&state).map_err(|e| StoreError::Corrupt(e.to_string()))?;
            counts.add(state, n.max(0) as usize);
        }
        Ok(counts)
    }

    async fn ensure_pipeline(&self, pipeline: &PipelineDefinition) -> Result<(), StoreError> {
        let table = pipeline.table();
        let mut stage_columns = String::new();
        for stage in pipeline.stages() {
            stage_columns.push_str(&format!(
                ",\n    {} TEXT,\n    {} INTEGER NOT NULL DEFAULT 0",
                PipelineDefinition::task_column(stage),
                PipelineDefinition::done_column(stage),
            ));
        }
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n    entity_key TEXT PRIMARY KEY,\n    \
             payload TEXT NOT NULL,\n    created_at_ms INTEGER NOT NULL{stage_columns}\n)"
        );
        sqlx::query(&ddl).execute(&self.pool).await?;

        // stages appended to an existing pipeline get their columns added
        let existing: Vec<String> =
            sqlx::query_scalar(&format!("SELECT name FROM pragma_table_info('{table}')"))
                .fetch_all(&self.pool)
                .await?;
        for stage in pipeline.stages() {
            let task_col = PipelineDefinition::task_column(stage);
            let done_col = PipelineDefinition::done_column(stage);
            if !existing.contains(&task_col) {
                sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {task_col} TEXT"))
                    .execute(&self.pool)
                    .await?;
            }
            if !existing.contains(&done_col) {
                sqlx::query(&format!(
                    "ALTER TABLE {table} ADD COLUMN {done_col} INTEGER NOT NULL DEFAULT 0"
                ))
                .execute(&self.pool)
                .await?;
            }
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_{task_col} ON {table}({task_col})"
            ))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn insert_entity(
        &self,
        pipeline: &PipelineDefinition,
        entity_key: &str,
        payload: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            "INSERT INTO {} (entity_key, payload, created_at_ms) VALUES (?, ?, ?) \
             ON CONFLICT(entity_key) DO NOTHING",
            pipeline.table()
        );
        let result = sqlx::query(&sql)
            .bind(entity_key)
            .bind(serde_json::to_string(&payload)?)
            .bind(self.now_ms())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn entity(
        &self,
        pipeline: &PipelineDefinition,
        entity_key: &str,
    ) -> Result<Option<PipelineEntity>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE entity_key = ?",
            entity_columns(pipeline),
            pipeline.table()
        );
        let row = sqlx::query(&sql)
            .bind(entity_key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| entity_from_row(pipeline, &row)).transpose()
    }

    async fn entity_for_task(
        &self,
        pipeline: &PipelineDefinition,
        stage: &str,
        task_id: TaskId,
    ) -> Result<Option<PipelineEntity>, StoreError> {
        pipeline.stage_index(stage)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            entity_columns(pipeline),
            pipeline.table(),
            PipelineDefinition::task_column(stage)
        );
        let row = sqlx::query(&sql)
            .bind(task_id.to_column())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| entity_from_row(pipeline, &row)).transpose()
    }

    async fn ready_entities(
        &self,
        pipeline: &PipelineDefinition,
        stages: &[String],
        limit: usize,
    ) -> Result<Vec<PipelineEntity>, StoreError> {
        let condition = ready_condition(pipeline, stages);
        if condition.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY created_at_ms, entity_key LIMIT ?",
            entity_columns(pipeline),
            pipeline.table(),
            condition
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| entity_from_row(pipeline, row)).collect()
    }

    async fn list_entities(
        &self,
        pipeline: &PipelineDefinition,
        limit: usize,
    ) -> Result<Vec<PipelineEntity>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY created_at_ms, entity_key LIMIT ?",
            entity_columns(pipeline),
            pipeline.table()
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| entity_from_row(pipeline, row)).collect()
    }

    async fn enqueue_stage(
        &self,
        pipeline: &PipelineDefinition,
        entity_key: &str,
        stage: &str,
        task_type: &TaskType,
    ) -> Result<Option<TaskId>, StoreError> {
        let index = pipeline.stage_index(stage)?;
        let table = pipeline.table();
        let task_col = PipelineDefinition::task_column(stage);
        let guard = match pipeline.previous_stage(index) {
            Some(prev) => format!(" AND {} = 1", PipelineDefinition::done_column(prev)),
            None => String::new(),
        };
        let task_id = self.ids.generate_task_id();
        let now = self.now_ms();

        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "UPDATE {table} SET {task_col} = ? WHERE entity_key = ? AND {task_col} IS NULL{guard}"
        );
        let result = sqlx::query(&sql)
            .bind(task_id.to_column())
            .bind(entity_key)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            let exists: Option<i64> =
                sqlx::query_scalar(&format!("SELECT 1 FROM {table} WHERE entity_key = ?"))
                    .bind(entity_key)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return match exists {
                Some(_) => Ok(None),
                None => Err(StoreError::EntityNotFound {
                    pipeline: table.to_string(),
                    key: entity_key.to_string(),
                }),
            };
        }

        let payload = serde_json::json!({
            "pipeline": table,
            "entity_key": entity_key,
            "stage": stage,
        });
        sqlx::query(
            r#"
            INSERT INTO tasks (id, task_type, payload, created_at_ms, updated_at_ms)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(task_id.to_column())
        .bind(task_type.as_str())
        .bind(serde_json::to_string(&payload)?)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
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

    async fn store() -> (SqliteStore, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteStore::new(pool, clock.clone());
        store.run_migrations().await.unwrap();
        (store, clock)
    }

    fn pipeline() -> PipelineDefinition {
        PipelineDefinition::new("sectors_test_pipeline", &["sdr", "trees"]).unwrap()
    }

    #[tokio::test]
    async fn task_row_round_trips() {
        let (store, clock) = store().await;
        let id = store
            .create_task(&TaskType::new("SDR"), json!({"sector": 1}))
            .await
            .unwrap();

        let rec = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(rec.id, id);
        assert_eq!(rec.task_type.as_str(), "SDR");
        assert_eq!(rec.state, TaskState::Queued);
        assert_eq!(rec.owner, None);
        assert_eq!(rec.payload, json!({"sector": 1}));
        assert_eq!(rec.created_at, clock.now());
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let (store, _) = store().await;
        let id = store.create_task(&TaskType::new("T"), json!({})).await.unwrap();
        let a = EngineId::from_ulid(Ulid::new());
        let b = EngineId::from_ulid(Ulid::new());

        assert_eq!(store.claim(&[id], a).await.unwrap(), vec![id]);
        assert!(store.claim(&[id], b).await.unwrap().is_empty());
        assert_eq!(store.get_task(id).await.unwrap().unwrap().owner, Some(a));
    }

    #[tokio::test]
    async fn enqueue_respects_the_previous_stage_flag() {
        let (store, _) = store().await;
        let def = pipeline();
        store.ensure_pipeline(&def).await.unwrap();
        store.insert_entity(&def, "s-1", json!({})).await.unwrap();
        let trees = TaskType::new("Trees");

        assert_eq!(store.enqueue_stage(&def, "s-1", "trees", &trees).await.unwrap(), None);

        let sdr = store
            .enqueue_stage(&def, "s-1", "sdr", &TaskType::new("SDR"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            store.enqueue_stage(&def, "s-1", "sdr", &TaskType::new("SDR")).await.unwrap(),
            None
        );

        let engine = EngineId::from_ulid(Ulid::new());
        store.claim(&[sdr], engine).await.unwrap();
        let now = Utc::now();
        let attempt = AttemptRecord::succeeded(sdr, TaskType::new("SDR"), engine, now, now);
        let stage = StageRef::new(Arc::new(def.clone()), "sdr");
        assert!(store
            .complete(sdr, engine, &[stage], Some(&json!({"ticket": 7})), &attempt)
            .await
            .unwrap());

        let entity = store.entity(&def, "s-1").await.unwrap().unwrap();
        assert!(entity.stages[0].done);
        assert_eq!(entity.payload["ticket"], 7);

        let created = store.enqueue_stage(&def, "s-1", "trees", &trees).await.unwrap();
        assert!(created.is_some());
        assert_eq!(store.unclaimed(&trees, 10).await.unwrap(), vec![created.unwrap()]);
    }

    #[tokio::test]
    async fn enqueue_for_missing_entity_is_an_error() {
        let (store, _) = store().await;
        let def = pipeline();
        store.ensure_pipeline(&def).await.unwrap();

        let err = store
            .enqueue_stage(&def, "nope", "sdr", &TaskType::new("SDR"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::EntityNotFound { .. }));
    }

    #[tokio::test]
    async fn reap_clears_stale_owners_without_counting_failures() {
        let (store, clock) = store().await;
        let id = store.create_task(&TaskType::new("T"), json!({})).await.unwrap();
        let engine = EngineId::from_ulid(Ulid::new());
        store
            .upsert_engine(&EngineRecord {
                id: engine,
                host: "worker-1".into(),
                capacity: Resources::new(4.0, 0, 1 << 30),
                last_contact: clock.now(),
            })
            .await
            .unwrap();
        store.claim(&[id], engine).await.unwrap();

        clock.advance(chrono::Duration::seconds(30));
        assert!(store.reap_expired(Duration::from_secs(60)).await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(store.reap_expired(Duration::from_secs(60)).await.unwrap(), vec![id]);

        let rec = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(rec.state, TaskState::Queued);
        assert_eq!(rec.failures, 0);
    }

    #[tokio::test]
    async fn ensure_pipeline_adds_new_stage_columns() {
        let (store, _) = store().await;
        let short = PipelineDefinition::new("grow_pipeline", &["a"]).unwrap();
        store.ensure_pipeline(&short).await.unwrap();
        store.insert_entity(&short, "k", json!({})).await.unwrap();

        let long = PipelineDefinition::new("grow_pipeline", &["a", "b"]).unwrap();
        store.ensure_pipeline(&long).await.unwrap();

        let entity = store.entity(&long, "k").await.unwrap().unwrap();
        assert_eq!(entity.stages.len(), 2);
        assert!(!entity.stages[1].done);
    }
}
