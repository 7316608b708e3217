//! Events - ドメインイベント
//!
//! engine / poller / reaper が状態遷移のたびに `EventSink` へ送ります。
//! `TaskDead` はオペレーターの対応が必要なので、既定の sink では error で記録されます。

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ids::{EngineId, TaskId};
use super::task::TaskType;

/// DomainEvent はドメインで発生したイベント
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    TaskCreated {
        task_id: TaskId,
        task_type: TaskType,
    },
    TaskStarted {
        task_id: TaskId,
        task_type: TaskType,
        engine_id: EngineId,
    },
    TaskSucceeded {
        task_id: TaskId,
        task_type: TaskType,
        engine_id: EngineId,
    },
    TaskRequeued {
        task_id: TaskId,
        task_type: TaskType,
        failures: u32,
        retry_at: DateTime<Utc>,
        error: String,
    },
    /// 永続的な失敗。パイプラインはこのステージで止まる。
    TaskDead {
        task_id: TaskId,
        task_type: TaskType,
        failures: u32,
        error: String,
    },
    /// 所有権を失った attempt。成功でも失敗でもない。
    TaskAbandoned {
        task_id: TaskId,
        task_type: TaskType,
        engine_id: EngineId,
    },
    StageEnqueued {
        pipeline: String,
        entity_key: String,
        stage: String,
        task_id: TaskId,
    },
    LeaseExpired {
        task_id: TaskId,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::TaskCreated { .. } => "task_created",
            DomainEvent::TaskStarted { .. } => "task_started",
            DomainEvent::TaskSucceeded { .. } => "task_succeeded",
            DomainEvent::TaskRequeued { .. } => "task_requeued",
            DomainEvent::TaskDead { .. } => "task_dead",
            DomainEvent::TaskAbandoned { .. } => "task_abandoned",
            DomainEvent::StageEnqueued { .. } => "stage_enqueued",
            DomainEvent::LeaseExpired { .. } => "lease_expired",
        }
    }
}
