//! EngineBuilder - engine / poller / reaper の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）: 重複登録・期待される task type の不足は起動失敗
//! - ステージの登録は各 task type の `adder` に任せる（明示的なレジストリを渡す）

use std::sync::Arc;

use tokio::sync::{Notify, watch};
use tracing::{info, warn};

use super::config::{EngineConfig, PollerConfig, ReaperConfig};
use super::engine::{EngineParts, TaskEngine};
use super::poller::PipelinePoller;
use super::reaper_loop::ReaperLoop;
use super::runtime::RuntimeHandle;
use crate::domain::{Decider, DefaultDecider, Resources, StoreError};
use crate::impls::TracingEventSink;
use crate::ports::{Clock, EventSink, IdGenerator, SystemClock, TaskStore, UlidGenerator};
use crate::typed::{AddTask, RegistryError, StageRegistry, TaskInterface, TaskRegistry};

/// EngineBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = EngineBuilder::new(store, EngineConfig::new(capacity))
///     .register(Arc::new(SdrTask::new(pipeline.clone(), calls.clone(), paths.clone(), 0)))?
///     .register(Arc::new(TreesTask::new(pipeline, calls, paths, 2)))?
///     .expect_tasks(&["SDR", "SDRTrees"])
///     .build()
///     .await?;
/// let runtime = app.start();
/// ```
///
/// # Fail-fast 設計
/// - expect_tasks() で期待される task_type を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば BuildError を返す
pub struct EngineBuilder {
    store: Arc<dyn TaskStore>,
    config: EngineConfig,
    poller_config: PollerConfig,
    reaper_config: ReaperConfig,
    registry: TaskRegistry,
    expected_tasks: Option<Vec<String>>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    decider: Arc<dyn Decider>,
    host: String,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("store error during startup: {0}")]
    Store(#[from] StoreError),
}

impl EngineBuilder {
    pub fn new(store: Arc<dyn TaskStore>, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            poller_config: PollerConfig::default(),
            reaper_config: ReaperConfig::default(),
            registry: TaskRegistry::new(),
            expected_tasks: None,
            clock: Arc::new(SystemClock),
            events: Arc::new(TracingEventSink),
            decider: Arc::new(DefaultDecider::new()),
            host: "localhost".to_string(),
        }
    }

    /// Task type を登録。同じ名前の二重登録はエラー
    pub fn register(mut self, task: Arc<dyn TaskInterface>) -> Result<Self, RegistryError> {
        self.registry.register(task)?;
        Ok(self)
    }

    /// 期待される task_type のリストを設定
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn poller_config(mut self, config: PollerConfig) -> Self {
        self.poller_config = config;
        self
    }

    pub fn reaper_config(mut self, config: ReaperConfig) -> Self {
        self.reaper_config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = decider;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// EngineBuilder を構築して App を生成
    ///
    /// # 検証
    /// - expect_tasks() で設定された task_type が全て登録されているかチェック
    /// - 各 task type の `adder` を呼び、ステージの重複をチェック
    /// - パイプラインのテーブルを用意し、engine の生存行を書く
    pub async fn build(self) -> Result<App, BuildError> {
        if let Some(expected_tasks) = &self.expected_tasks {
            let registered_types = self.registry.registered_types();
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|x| !registered_types.contains(x))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }

        let notify = Arc::new(Notify::new());
        let mut stages = StageRegistry::new();
        for registered in self.registry.iter() {
            let details = &registered.details;
            if !details.cost.fits(&Resources::default(), &self.config.capacity) {
                warn!(
                    task_type = %details.name,
                    cost = ?details.cost,
                    capacity = ?self.config.capacity,
                    "task type can never run on this machine"
                );
            }
            let add = AddTask::new(
                details.name.clone(),
                Arc::clone(&self.store),
                Arc::clone(&self.events),
                Arc::clone(&notify),
            );
            registered.task.adder(add, &mut stages)?;
        }

        for pipeline in stages.pipelines() {
            self.store.ensure_pipeline(pipeline).await?;
        }

        let id = UlidGenerator::new(Arc::clone(&self.clock)).generate_engine_id();
        let stages = Arc::new(stages);
        let engine = Arc::new(TaskEngine::new(EngineParts {
            id,
            host: self.host,
            store: Arc::clone(&self.store),
            registry: self.registry,
            stages: Arc::clone(&stages),
            decider: self.decider,
            events: Arc::clone(&self.events),
            clock: self.clock,
            config: self.config,
            notify,
        }));
        engine.heartbeat().await?;

        info!(
            engine_id = %engine.id(),
            task_types = ?engine.registry().registered_types(),
            pipelines = stages.pipelines().len(),
            "engine registered"
        );

        Ok(App {
            poller: PipelinePoller::new(Arc::clone(&self.store), stages, self.poller_config),
            reaper: ReaperLoop::new(self.store, self.events, self.reaper_config),
            engine,
        })
    }
}

/// App は起動前の engine と周辺ループ
pub struct App {
    pub engine: Arc<TaskEngine>,
    pub poller: PipelinePoller,
    pub reaper: ReaperLoop,
}

impl App {
    /// 三つのループを spawn する
    pub fn start(self) -> RuntimeHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let joins = vec![
            tokio::spawn(Arc::clone(&self.engine).run(shutdown_rx.clone())),
            tokio::spawn(self.poller.run(shutdown_rx.clone())),
            tokio::spawn(self.reaper.run(shutdown_rx)),
        ];

        RuntimeHandle::new(self.engine, shutdown_tx, joins)
    }
}
