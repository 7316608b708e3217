//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use spindle_core::app::{App, EngineBuilder, EngineConfig};
use spindle_core::domain::{
    Outcome, PipelineDefinition, Resources, RetryPolicy, TaskError, TaskId, TaskTypeDetails,
};
use spindle_core::ports::TaskStore;
use spindle_core::sealing::{
    MessageSender, PreCommitMessage, SealCalls, SealError, SectorPaths, SectorRef, SendError,
};
use spindle_core::typed::{
    AcceptData, Accepted, AddTask, EngineHandle, RegistryError, StageRegistry, TaskContext,
    TaskInterface,
};

pub const GIB: u64 = 1 << 30;

pub fn capacity() -> Resources {
    Resources::new(16.0, 2, 64 * GIB)
}

pub fn config() -> EngineConfig {
    EngineConfig::new(capacity()).with_claim_batch(10)
}

/// A task type whose attempts follow a script.
///
/// Each `do_task` pops the next scripted result; an empty script means done.
pub struct ScriptedTask {
    details: TaskTypeDetails,
    script: Mutex<VecDeque<Result<Outcome, TaskError>>>,
    repeat: Option<Result<Outcome, TaskError>>,
    accept: bool,
    stage: Option<(Arc<PipelineDefinition>, String)>,
    gate: Option<Arc<Semaphore>>,
    runs: Mutex<HashMap<TaskId, usize>>,
}

impl ScriptedTask {
    pub fn new(name: &str) -> Self {
        Self {
            details: TaskTypeDetails::new(name).with_retry(RetryPolicy::none()),
            script: Mutex::new(VecDeque::new()),
            repeat: None,
            accept: true,
            stage: None,
            gate: None,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn details(mut self, f: impl FnOnce(TaskTypeDetails) -> TaskTypeDetails) -> Self {
        self.details = f(self.details);
        self
    }

    pub fn then(self, result: Result<Outcome, TaskError>) -> Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    /// Result of every attempt once the script runs out.
    pub fn always(mut self, result: Result<Outcome, TaskError>) -> Self {
        self.repeat = Some(result);
        self
    }

    pub fn declining(mut self) -> Self {
        self.accept = false;
        self
    }

    pub fn for_stage(mut self, pipeline: &Arc<PipelineDefinition>, stage: &str) -> Self {
        self.stage = Some((Arc::clone(pipeline), stage.to_string()));
        self
    }

    /// Every attempt waits for a permit before finishing.
    pub fn gated(mut self, gate: &Arc<Semaphore>) -> Self {
        self.gate = Some(Arc::clone(gate));
        self
    }

    pub fn runs_of(&self, task_id: TaskId) -> usize {
        self.runs.lock().unwrap().get(&task_id).copied().unwrap_or(0)
    }

    pub fn all_runs(&self) -> HashMap<TaskId, usize> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskInterface for ScriptedTask {
    fn type_details(&self) -> TaskTypeDetails {
        self.details.clone()
    }

    async fn can_accept(
        &self,
        candidates: &[TaskId],
        _engine: &EngineHandle,
    ) -> Result<Option<Accepted>, TaskError> {
        if !self.accept {
            return Ok(None);
        }
        Ok(candidates.first().copied().map(Accepted::new))
    }

    async fn do_task(
        &self,
        task_id: TaskId,
        _data: AcceptData,
        _ctx: &TaskContext,
    ) -> Result<Outcome, TaskError> {
        *self.runs.lock().unwrap().entry(task_id).or_insert(0) += 1;
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => self.repeat.clone().unwrap_or_else(|| Ok(Outcome::done())),
        }
    }

    fn adder(&self, add: AddTask, stages: &mut StageRegistry) -> Result<(), RegistryError> {
        match &self.stage {
            Some((pipeline, stage)) => stages.register(pipeline, stage, add),
            None => Ok(()),
        }
    }
}

pub async fn build(store: Arc<dyn TaskStore>, tasks: Vec<Arc<dyn TaskInterface>>) -> App {
    build_with(EngineBuilder::new(store, config()), tasks).await
}

pub async fn build_with(mut builder: EngineBuilder, tasks: Vec<Arc<dyn TaskInterface>>) -> App {
    for task in tasks {
        builder = builder.register(task).unwrap();
    }
    builder.build().await.unwrap()
}

/// Run poller and engine passes until neither does anything.
pub async fn drain(app: &App) {
    for _ in 0..100 {
        let created = app.poller.poll_once().await.unwrap();
        let started = app.engine.poll_once().await.unwrap();
        app.engine.wait_idle().await;
        if created == 0 && started == 0 {
            return;
        }
    }
    panic!("pipeline did not settle");
}

/// Seal calls that write marker files instead of proofs.
#[derive(Default)]
pub struct FakeSealCalls {
    pub calls: Mutex<Vec<String>>,
}

impl FakeSealCalls {
    fn record(&self, call: &str, sector: &SectorRef) {
        self.calls.lock().unwrap().push(format!("{call} {sector}"));
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(call))
            .count()
    }
}

impl SealCalls for FakeSealCalls {
    fn generate_sdr(
        &self,
        sector: &SectorRef,
        paths: &SectorPaths,
        ticket: &str,
    ) -> Result<(), SealError> {
        self.record("sdr", sector);
        fs::write(paths.cache.join("layer"), ticket)?;
        Ok(())
    }

    fn tree_d(&self, sector: &SectorRef, _paths: &SectorPaths) -> Result<String, SealError> {
        self.record("tree_d", sector);
        Ok(format!("comm_d-{}", sector.key()))
    }

    fn tree_rc(
        &self,
        sector: &SectorRef,
        paths: &SectorPaths,
        _comm_d: &str,
    ) -> Result<String, SealError> {
        self.record("tree_rc", sector);
        fs::write(&paths.sealed, b"sealed")?;
        Ok(format!("comm_r-{}", sector.key()))
    }

    fn move_storage(
        &self,
        sector: &SectorRef,
        from: &SectorPaths,
        to: &SectorPaths,
    ) -> Result<(), SealError> {
        self.record("move_storage", sector);
        fs::copy(&from.sealed, &to.sealed)?;
        fs::remove_file(&from.sealed)?;
        Ok(())
    }
}

/// Sender that remembers what it sent.
#[derive(Default)]
pub struct RecordingSender {
    pub sent: Mutex<Vec<PreCommitMessage>>,
    pub fail_with: Mutex<Option<SendError>>,
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, message: &PreCommitMessage) -> Result<String, SendError> {
        if let Some(err) = self.fail_with.lock().unwrap().clone() {
            return Err(err);
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(message.clone());
        Ok(format!("bafy-{}", sent.len()))
    }
}

pub fn dyn_task<T: TaskInterface>(task: &Arc<T>) -> Arc<dyn TaskInterface> {
    task.clone()
}
