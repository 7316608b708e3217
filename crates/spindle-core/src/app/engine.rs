//! TaskEngine - claim → admission → reserve → Do → 完了記録
//!
//! # 学習ポイント
//! - 一つのスケジューリングループ + 実行中タスクごとに一つの tokio task
//! - ledger のロックは `.await` を跨がない（`Reservation` の drop で解放）
//! - 全ての調整はストアの条件付き更新で行う（engine のメモリには権威が無い）
//!
//! # 一回のパス（`poll_once`）
//! 1. 名前順に各 task type の headroom を見る
//! 2. `unclaimed` → `claim`（勝った行だけが候補）
//! 3. `can_accept` で一つ選び、残りは同じパスで返却
//! 4. ledger に予約して `do_task` を spawn
//!
//! # 完了
//! - Done → `complete`（ステージの完了フラグも同じトランザクション）
//! - Incomplete / Retryable → `Decider` が requeue か dead を決める
//! - Permanent → dead
//! - OwnershipLost → 何も書かない

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, error, info, warn};

use super::config::EngineConfig;
use crate::domain::{
    AttemptRecord, Decider, Decision, DomainEvent, EngineId, EngineRecord, Reservation,
    ResourceLedger, StoreError, TaskError, TaskId, TaskTypeDetails,
};
use crate::ports::{Clock, EventSink, TaskStore};
use crate::typed::{
    AddTask, Accepted, EngineHandle, RegisteredTask, StageRegistry, TaskContext, TaskRegistry,
};

/// Everything `EngineBuilder` wires into an engine.
pub(crate) struct EngineParts {
    pub id: EngineId,
    pub host: String,
    pub store: Arc<dyn TaskStore>,
    pub registry: TaskRegistry,
    pub stages: Arc<StageRegistry>,
    pub decider: Arc<dyn Decider>,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
    pub config: EngineConfig,
    pub notify: Arc<Notify>,
}

/// One engine process: the scheduling loop and its running tasks.
pub struct TaskEngine {
    id: EngineId,
    host: String,
    store: Arc<dyn TaskStore>,
    registry: TaskRegistry,
    stages: Arc<StageRegistry>,
    ledger: Arc<ResourceLedger>,
    decider: Arc<dyn Decider>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    notify: Arc<Notify>,
    inflight: Mutex<Vec<JoinHandle<()>>>,
    /// Claims we failed to hand back while the store was down.
    pending_release: Mutex<Vec<TaskId>>,
}

/// How a finished attempt is written back.
enum Settlement {
    Done(Option<serde_json::Value>),
    Failed { error: String, permanent: bool },
}

impl TaskEngine {
    pub(crate) fn new(parts: EngineParts) -> Self {
        Self {
            ledger: Arc::new(ResourceLedger::new(parts.config.capacity)),
            id: parts.id,
            host: parts.host,
            store: parts.store,
            registry: parts.registry,
            stages: parts.stages,
            decider: parts.decider,
            events: parts.events,
            clock: parts.clock,
            config: parts.config,
            notify: parts.notify,
            inflight: Mutex::new(Vec::new()),
            pending_release: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> EngineId {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn stages(&self) -> &Arc<StageRegistry> {
        &self.stages
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Creation callback for a registered type, for standalone tasks.
    pub fn add_task(&self, task_type: &str) -> Option<AddTask> {
        self.registry.get(task_type).map(|registered| {
            AddTask::new(
                registered.details.name.clone(),
                Arc::clone(&self.store),
                Arc::clone(&self.events),
                Arc::clone(&self.notify),
            )
        })
    }

    /// Wake the scheduling loop.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    // ========================================
    // Scheduling
    // ========================================

    /// One scheduling pass over every registered type. Returns how many
    /// tasks were started.
    pub async fn poll_once(self: &Arc<Self>) -> Result<usize, StoreError> {
        self.flush_pending_releases().await?;

        let mut started = 0;
        for registered in self.registry.iter() {
            if self.schedule_type(registered).await? {
                started += 1;
            }
        }
        Ok(started)
    }

    async fn schedule_type(self: &Arc<Self>, registered: &RegisteredTask) -> Result<bool, StoreError> {
        let details = &registered.details;
        let headroom = self.ledger.headroom(details);
        if headroom == 0 {
            return Ok(false);
        }

        let candidates = self
            .store
            .unclaimed(&details.name, headroom.min(self.config.claim_batch))
            .await?;
        if candidates.is_empty() {
            return Ok(false);
        }

        let claimed = self.store.claim(&candidates, self.id).await?;
        if claimed.is_empty() {
            debug!(task_type = %details.name, "lost every claim race");
            return Ok(false);
        }

        let handle = EngineHandle::new(
            self.id,
            self.host.clone(),
            self.ledger.snapshot(),
            Arc::clone(&self.store),
        );
        let accepted = match registered.task.can_accept(&claimed, &handle).await {
            Ok(Some(accepted)) if claimed.contains(&accepted.task_id) => Some(accepted),
            Ok(Some(accepted)) => {
                warn!(
                    task_type = %details.name,
                    task_id = %accepted.task_id,
                    "admission filter chose a task outside the candidates"
                );
                None
            }
            Ok(None) => {
                debug!(
                    task_type = %details.name,
                    candidates = claimed.len(),
                    "admission filter declined all candidates"
                );
                None
            }
            Err(err) => {
                warn!(task_type = %details.name, error = %err, "admission filter failed");
                None
            }
        };

        let Some(accepted) = accepted else {
            self.release(&claimed).await;
            return Ok(false);
        };

        let Some(reservation) = self.ledger.try_reserve(details) else {
            // Headroom was checked above, but a run may have started in between.
            self.release(&claimed).await;
            return Ok(false);
        };

        let declined: Vec<TaskId> = claimed
            .iter()
            .copied()
            .filter(|id| *id != accepted.task_id)
            .collect();
        self.release(&declined).await;

        self.spawn_run(registered.clone(), accepted, reservation);
        Ok(true)
    }

    async fn release(&self, task_ids: &[TaskId]) {
        if task_ids.is_empty() {
            return;
        }
        match self.store.release(task_ids, self.id).await {
            Ok(released) => debug!(released, "released claims"),
            Err(err) => {
                warn!(count = task_ids.len(), error = %err, "release failed, will retry");
                self.pending().extend_from_slice(task_ids);
            }
        }
    }

    async fn flush_pending_releases(&self) -> Result<(), StoreError> {
        let pending = std::mem::take(&mut *self.pending());
        if pending.is_empty() {
            return Ok(());
        }
        match self.store.release(&pending, self.id).await {
            Ok(released) => {
                debug!(released, "released deferred claims");
                Ok(())
            }
            Err(err) => {
                self.pending().extend(pending);
                Err(err)
            }
        }
    }

    // ========================================
    // Running
    // ========================================

    fn spawn_run(self: &Arc<Self>, registered: RegisteredTask, accepted: Accepted, reservation: Reservation) {
        self.events.emit(DomainEvent::TaskStarted {
            task_id: accepted.task_id,
            task_type: registered.details.name.clone(),
            engine_id: self.id,
        });

        let engine = Arc::clone(self);
        let join = tokio::spawn(async move {
            engine.execute(registered, accepted, reservation).await;
            engine.notify.notify_one();
        });

        let mut inflight = self.inflight();
        inflight.retain(|join| !join.is_finished());
        inflight.push(join);
    }

    async fn execute(&self, registered: RegisteredTask, accepted: Accepted, reservation: Reservation) {
        let details = registered.details;
        let task_id = accepted.task_id;
        let ctx = TaskContext::new(task_id, details.name.clone(), self.id, Arc::clone(&self.store));

        let work_start = self.clock.now();
        // Own tokio task so a panicking Do counts as a failed attempt.
        let task = Arc::clone(&registered.task);
        let result = tokio::spawn(async move { task.do_task(task_id, accepted.data, &ctx).await })
            .await
            .unwrap_or_else(|join_err| Err(TaskError::retryable(format!("task panicked: {join_err}"))));
        let work_end = self.clock.now();
        drop(reservation);

        let settlement = match result {
            Ok(outcome) if outcome.is_done() => Settlement::Done(outcome.output),
            Ok(outcome) => Settlement::Failed {
                error: outcome.reason.unwrap_or_else(|| "incomplete".to_string()),
                permanent: false,
            },
            Err(TaskError::OwnershipLost) => {
                self.abandon(task_id, &details);
                return;
            }
            Err(err) => Settlement::Failed {
                permanent: err.is_permanent(),
                error: err.to_string(),
            },
        };

        let mut attempts = 0;
        loop {
            match self
                .settle(&details, task_id, &settlement, work_start, work_end)
                .await
            {
                Ok(()) => return,
                Err(err) if err.is_unavailable() && attempts < self.config.completion_retries => {
                    attempts += 1;
                    let delay = self.config.store_backoff.next_delay(attempts);
                    warn!(
                        task_id = %task_id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "recording task result failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    error!(
                        task_id = %task_id,
                        task_type = %details.name,
                        error = %err,
                        "could not record task result, handing the task back"
                    );
                    self.pending().push(task_id);
                    return;
                }
            }
        }
    }

    async fn settle(
        &self,
        details: &TaskTypeDetails,
        task_id: TaskId,
        settlement: &Settlement,
        work_start: DateTime<Utc>,
        work_end: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let (error, permanent) = match settlement {
            Settlement::Done(output) => {
                let attempt = AttemptRecord::succeeded(
                    task_id,
                    details.name.clone(),
                    self.id,
                    work_start,
                    work_end,
                );
                let stages = self.stages.stages_for(&details.name);
                if self
                    .store
                    .complete(task_id, self.id, stages, output.as_ref(), &attempt)
                    .await?
                {
                    info!(task_id = %task_id, task_type = %details.name, "task succeeded");
                    self.events.emit(DomainEvent::TaskSucceeded {
                        task_id,
                        task_type: details.name.clone(),
                        engine_id: self.id,
                    });
                } else {
                    self.abandon(task_id, details);
                }
                return Ok(());
            }
            Settlement::Failed { error, permanent } => (error.as_str(), *permanent),
        };

        let record = match self.store.get_task(task_id).await? {
            Some(record) if record.is_owned_by(self.id) => record,
            _ => {
                self.abandon(task_id, details);
                return Ok(());
            }
        };

        let attempt = AttemptRecord::failed(
            task_id,
            details.name.clone(),
            self.id,
            work_start,
            work_end,
            error,
        );
        let decision = if permanent {
            Decision::MarkDead {
                reason: error.to_string(),
            }
        } else {
            self.decider.decide(&record, details, error)
        };
        let failures = record.failures.saturating_add(1);

        match decision {
            Decision::Retry { delay, reason } => {
                let retry_at = retry_at(self.clock.now(), delay);
                if !self.store.requeue(task_id, self.id, retry_at, &attempt).await? {
                    self.abandon(task_id, details);
                    return Ok(());
                }
                self.events.emit(DomainEvent::TaskRequeued {
                    task_id,
                    task_type: details.name.clone(),
                    failures,
                    retry_at,
                    error: reason,
                });
            }
            Decision::MarkDead { reason } => {
                if !self.store.mark_dead(task_id, self.id, &attempt).await? {
                    self.abandon(task_id, details);
                    return Ok(());
                }
                self.events.emit(DomainEvent::TaskDead {
                    task_id,
                    task_type: details.name.clone(),
                    failures,
                    error: reason,
                });
            }
        }
        Ok(())
    }

    fn abandon(&self, task_id: TaskId, details: &TaskTypeDetails) {
        self.events.emit(DomainEvent::TaskAbandoned {
            task_id,
            task_type: details.name.clone(),
            engine_id: self.id,
        });
    }

    /// Wait until every started task has recorded its result.
    pub async fn wait_idle(&self) {
        loop {
            let joins = std::mem::take(&mut *self.inflight());
            if joins.is_empty() {
                return;
            }
            for join in joins {
                if let Err(err) = join.await {
                    error!(?err, "task run aborted");
                }
            }
        }
    }

    pub fn running(&self) -> usize {
        self.inflight().iter().filter(|join| !join.is_finished()).count()
    }

    // ========================================
    // Liveness / loop
    // ========================================

    /// Refresh this engine's liveness row.
    pub async fn heartbeat(&self) -> Result<(), StoreError> {
        self.store
            .upsert_engine(&EngineRecord {
                id: self.id,
                host: self.host.clone(),
                capacity: self.ledger.capacity(),
                last_contact: self.clock.now(),
            })
            .await
    }

    /// Scheduling loop until `shutdown` flips. Then waits for running tasks,
    /// still heartbeating, and removes the liveness row.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            engine_id = %self.id,
            host = %self.host,
            task_types = ?self.registry.registered_types(),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "starting task engine"
        );

        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut store_failures = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.poll_once().await {
                Ok(0) => {
                    store_failures = 0;
                    self.config.poll_interval
                }
                Ok(started) => {
                    store_failures = 0;
                    debug!(started, "scheduling pass started work");
                    Duration::ZERO
                }
                Err(err) => {
                    store_failures = store_failures.saturating_add(1);
                    let delay = self.config.store_backoff.next_delay(store_failures);
                    warn!(
                        error = %err,
                        failures = store_failures,
                        delay_ms = delay.as_millis() as u64,
                        "scheduling pass failed, backing off"
                    );
                    delay
                }
            };

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(err) = self.heartbeat().await {
                        warn!(error = %err, "heartbeat failed");
                    }
                }
                _ = self.notify.notified() => {}
                _ = sleep(wait) => {}
            }
        }

        info!(engine_id = %self.id, running = self.running(), "task engine stopping");
        // 実行中のタスクは最後まで走らせる。その間も lease は更新し続ける
        let drained = self.wait_idle();
        tokio::pin!(drained);
        loop {
            tokio::select! {
                biased;
                () = &mut drained => break,
                _ = heartbeat.tick() => {
                    if let Err(err) = self.heartbeat().await {
                        warn!(error = %err, "heartbeat failed while draining");
                    }
                }
            }
        }
        if let Err(err) = self.flush_pending_releases().await {
            warn!(error = %err, "could not hand back claims on shutdown");
        }
        if let Err(err) = self.store.remove_engine(self.id).await {
            warn!(error = %err, "could not remove engine row");
        }
        info!(engine_id = %self.id, "task engine stopped");
    }

    fn inflight(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, Vec<TaskId>> {
        self.pending_release
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn retry_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
