//! ReaperLoop - 沈黙した engine のタスクを回収
//!
//! # フロー
//! 1. `TaskStore::reap_expired(lease_timeout)` で heartbeat の途絶えた engine の
//!    running タスクを queued に戻す（failures は増やさない）
//! 2. 戻したタスクごとに `LeaseExpired` を記録
//!
//! 全ての engine で動かして構いません（冪等）。

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, warn};

use super::config::ReaperConfig;
use crate::domain::{DomainEvent, StoreError, TaskId};
use crate::ports::{EventSink, TaskStore};

pub struct ReaperLoop {
    store: Arc<dyn TaskStore>,
    events: Arc<dyn EventSink>,
    config: ReaperConfig,
}

impl ReaperLoop {
    pub fn new(store: Arc<dyn TaskStore>, events: Arc<dyn EventSink>, config: ReaperConfig) -> Self {
        Self {
            store,
            events,
            config,
        }
    }

    pub async fn reap_once(&self) -> Result<Vec<TaskId>, StoreError> {
        let reaped = self.store.reap_expired(self.config.lease_timeout).await?;
        for task_id in &reaped {
            self.events.emit(DomainEvent::LeaseExpired { task_id: *task_id });
        }
        Ok(reaped)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            lease_timeout_ms = self.config.lease_timeout.as_millis() as u64,
            "starting lease reaper"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.reap_once().await {
                        Ok(reaped) if !reaped.is_empty() => {
                            info!(count = reaped.len(), "returned tasks of silent engines");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "lease reap failed"),
                    }
                }
            }
        }
        info!("lease reaper stopped");
    }
}
