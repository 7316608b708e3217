//! EventSink 実装
//!
//! - TracingEventSink: tracing への構造化ログ（既定）
//! - RecordingEventSink: 発生したイベントを保持する（テスト用）

use std::sync::Mutex;

use tracing::{debug, error, info, warn};

use crate::domain::DomainEvent;
use crate::ports::EventSink;

/// ドメインイベントを tracing に流す
///
/// `TaskDead` はオペレーターの対応が必要なので `error` レベル。
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: DomainEvent) {
        match &event {
            DomainEvent::TaskCreated { task_id, task_type } => {
                debug!(%task_id, %task_type, "task created");
            }
            DomainEvent::TaskStarted {
                task_id,
                task_type,
                engine_id,
            } => {
                info!(%task_id, %task_type, %engine_id, "task started");
            }
            DomainEvent::TaskSucceeded {
                task_id,
                task_type,
                engine_id,
            } => {
                info!(%task_id, %task_type, %engine_id, "task succeeded");
            }
            DomainEvent::TaskRequeued {
                task_id,
                task_type,
                failures,
                retry_at,
                error,
            } => {
                warn!(%task_id, %task_type, failures, %retry_at, error = %error, "task failed, requeued");
            }
            DomainEvent::TaskDead {
                task_id,
                task_type,
                failures,
                error,
            } => {
                error!(
                    %task_id,
                    %task_type,
                    failures,
                    error = %error,
                    "task permanently failed, operator attention required"
                );
            }
            DomainEvent::TaskAbandoned {
                task_id,
                task_type,
                engine_id,
            } => {
                warn!(%task_id, %task_type, %engine_id, "task ownership lost, attempt abandoned");
            }
            DomainEvent::StageEnqueued {
                pipeline,
                entity_key,
                stage,
                task_id,
            } => {
                info!(%pipeline, %entity_key, %stage, %task_id, "stage task created");
            }
            DomainEvent::LeaseExpired { task_id } => {
                warn!(%task_id, "lease expired, task returned to the pool");
            }
        }
    }
}

/// 発生したイベントを順番に保持する
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<DomainEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: DomainEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
