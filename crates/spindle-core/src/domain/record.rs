//! Task record: one row of the generic task table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{EngineId, TaskId};
use super::resources::Resources;
use super::state::TaskState;
use super::task::TaskType;

/// Metadata for a task as the store sees it.
///
/// Design:
/// - This is the single source of truth for claim state (`owner`).
/// - The payload is opaque to the engine; task types use it to find
///   their type-specific detail (usually a pipeline entity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_type: TaskType,

    /// Engine holding the claim. `None` means unclaimed.
    pub owner: Option<EngineId>,
    pub state: TaskState,

    /// Failed attempts so far. Lease expiry does not count.
    pub failures: u32,

    /// Not claimable before this instant (retry backoff).
    pub not_before: Option<DateTime<Utc>>,

    pub last_error: Option<String>,
    pub payload: serde_json::Value,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(
        id: TaskId,
        task_type: TaskType,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_type,
            owner: None,
            state: TaskState::Queued,
            failures: 0,
            not_before: None,
            last_error: None,
            payload,
            created_at: now,
            updated_at: now,
        }
    }

    /// Unclaimed, queued and past its backoff.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.owner.is_none()
            && self.state.is_runnable()
            && self.not_before.is_none_or(|at| at <= now)
    }

    /// Is the claim currently held by `engine_id`?
    pub fn is_owned_by(&self, engine_id: EngineId) -> bool {
        self.owner == Some(engine_id) && self.state == TaskState::Running
    }

    /// Take the claim.
    pub fn claim(&mut self, engine_id: EngineId, now: DateTime<Utc>) {
        self.owner = Some(engine_id);
        self.state = TaskState::Running;
        self.updated_at = now;
    }

    /// Give the claim back without counting a failure.
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.owner = None;
        self.state = TaskState::Queued;
        self.updated_at = now;
    }

    /// Mark as succeeded.
    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) {
        self.owner = None;
        self.state = TaskState::Succeeded;
        self.updated_at = now;
    }

    /// Count a failure and make the row claimable again after `retry_at`.
    pub fn schedule_retry(&mut self, retry_at: DateTime<Utc>, error: String, now: DateTime<Utc>) {
        self.owner = None;
        self.state = TaskState::Queued;
        self.failures = self.failures.saturating_add(1);
        self.not_before = Some(retry_at);
        self.last_error = Some(error);
        self.updated_at = now;
    }

    /// Count the final failure and retire the row.
    pub fn mark_dead(&mut self, error: String, now: DateTime<Utc>) {
        self.owner = None;
        self.state = TaskState::Dead;
        self.failures = self.failures.saturating_add(1);
        self.last_error = Some(error);
        self.updated_at = now;
    }
}

/// Liveness row of an engine process.
///
/// Only `last_contact` matters for scheduling: tasks owned by an engine
/// whose row went stale are returned to the pool. Capacity is recorded for
/// operators; the engine's own ledger stays authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineRecord {
    pub id: EngineId,
    pub host: String,
    pub capacity: Resources,
    pub last_contact: DateTime<Utc>,
}
