//! Pipeline entities and their derived stage states.
//!
//! A pipeline is a table with one row per entity and, for every stage, a
//! `task_id_<stage>` column plus an `after_<stage>` completion flag. What
//! runs next is derived from those columns alone; nothing else about stage
//! progress is stored.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::ids::TaskId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid identifier {0:?}: expected [a-z_][a-z0-9_]*")]
    InvalidIdentifier(String),

    #[error("pipeline {0} has no stages")]
    NoStages(String),

    #[error("duplicate stage {stage} in pipeline {pipeline}")]
    DuplicateStage { pipeline: String, stage: String },

    #[error("unknown stage {stage} in pipeline {pipeline}")]
    UnknownStage { pipeline: String, stage: String },
}

/// Table name plus ordered stage names.
///
/// Identifiers end up spliced into SQL, so they are restricted to
/// `[a-z_][a-z0-9_]*` when the definition is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDefinition {
    table: String,
    stages: Vec<String>,
}

impl PipelineDefinition {
    pub fn new(table: impl Into<String>, stages: &[&str]) -> Result<Self, PipelineError> {
        let table = table.into();
        validate_identifier(&table)?;
        if stages.is_empty() {
            return Err(PipelineError::NoStages(table));
        }
        let mut owned: Vec<String> = Vec::with_capacity(stages.len());
        for stage in stages {
            validate_identifier(stage)?;
            if owned.iter().any(|s| s == stage) {
                return Err(PipelineError::DuplicateStage {
                    pipeline: table,
                    stage: stage.to_string(),
                });
            }
            owned.push(stage.to_string());
        }
        Ok(Self {
            table,
            stages: owned,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn stage_index(&self, stage: &str) -> Result<usize, PipelineError> {
        self.stages
            .iter()
            .position(|s| s == stage)
            .ok_or_else(|| PipelineError::UnknownStage {
                pipeline: self.table.clone(),
                stage: stage.to_string(),
            })
    }

    /// The stage whose flag gates `index`, if any.
    pub fn previous_stage(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.stages.get(i))
            .map(String::as_str)
    }

    pub fn task_column(stage: &str) -> String {
        format!("task_id_{stage}")
    }

    pub fn done_column(stage: &str) -> String {
        format!("after_{stage}")
    }
}

fn validate_identifier(ident: &str) -> Result<(), PipelineError> {
    let mut chars = ident.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => chars
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'),
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(PipelineError::InvalidIdentifier(ident.to_string()))
    }
}

/// Derived sub-state of one stage. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Previous stage not done yet.
    Blocked,
    /// Previous stage done (or first stage) and no task created.
    Ready,
    /// Task created, flag not set.
    Running,
    Done,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageState::Blocked => "blocked",
            StageState::Ready => "ready",
            StageState::Running => "running",
            StageState::Done => "done",
        };
        f.write_str(s)
    }
}

/// Stored columns of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageStatus {
    pub task_id: Option<TaskId>,
    pub done: bool,
}

/// One pipeline row: the work item moving through the stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEntity {
    pub key: String,
    pub payload: serde_json::Value,
    /// Same order as `PipelineDefinition::stages`.
    pub stages: Vec<StageStatus>,
}

impl PipelineEntity {
    pub fn new(key: impl Into<String>, payload: serde_json::Value, stage_count: usize) -> Self {
        Self {
            key: key.into(),
            payload,
            stages: vec![StageStatus::default(); stage_count],
        }
    }

    pub fn stage_states(&self) -> Vec<StageState> {
        derive_stage_states(&self.stages)
    }

    /// Ready in one of the named stages of `pipeline`.
    pub fn has_ready_stage_in(&self, pipeline: &PipelineDefinition, stages: &[String]) -> bool {
        pipeline
            .stages()
            .iter()
            .zip(self.stage_states())
            .any(|(stage, state)| state == StageState::Ready && stages.contains(stage))
    }

    pub fn is_finished(&self) -> bool {
        self.stages.iter().all(|s| s.done)
    }

    /// Index of the stage whose task column holds `task_id`.
    pub fn stage_of(&self, task_id: TaskId) -> Option<usize> {
        self.stages.iter().position(|s| s.task_id == Some(task_id))
    }
}

/// Derive every stage's state from the stored columns.
pub fn derive_stage_states(stages: &[StageStatus]) -> Vec<StageState> {
    let mut previous_done = true;
    stages
        .iter()
        .map(|stage| {
            let state = if stage.done {
                StageState::Done
            } else if stage.task_id.is_some() {
                StageState::Running
            } else if previous_done {
                StageState::Ready
            } else {
                StageState::Blocked
            };
            previous_done = stage.done;
            state
        })
        .collect()
}

/// Merge a stage's output into the entity payload.
///
/// Object keys are inserted (overwriting), anything else is kept under `"output"`.
pub fn merge_payload(payload: &mut serde_json::Value, output: &serde_json::Value) {
    use serde_json::Value;

    if payload.is_null() {
        *payload = Value::Object(Default::default());
    }
    let Value::Object(target) = payload else {
        let previous = payload.take();
        *payload = serde_json::json!({ "payload": previous });
        return merge_payload(payload, output);
    };
    match output {
        Value::Object(fields) => {
            for (k, v) in fields {
                target.insert(k.clone(), v.clone());
            }
        }
        Value::Null => {}
        other => {
            target.insert("output".to_string(), other.clone());
        }
    }
}

/// A stage of a specific pipeline, as bound to a task type.
#[derive(Debug, Clone)]
pub struct StageRef {
    pub pipeline: Arc<PipelineDefinition>,
    pub stage: String,
}

impl StageRef {
    pub fn new(pipeline: Arc<PipelineDefinition>, stage: impl Into<String>) -> Self {
        Self {
            pipeline,
            stage: stage.into(),
        }
    }
}

impl PartialEq for StageRef {
    fn eq(&self, other: &Self) -> bool {
        self.pipeline.table() == other.pipeline.table() && self.stage == other.stage
    }
}

impl Eq for StageRef {}

impl fmt::Display for StageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.pipeline.table(), self.stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;
    use ulid::Ulid;

    fn tid() -> Option<TaskId> {
        Some(TaskId::from_ulid(Ulid::new()))
    }

    #[rstest]
    #[case::fresh(
        vec![StageStatus::default(), StageStatus::default()],
        vec![StageState::Ready, StageState::Blocked],
    )]
    #[case::first_running(
        vec![StageStatus { task_id: tid(), done: false }, StageStatus::default()],
        vec![StageState::Running, StageState::Blocked],
    )]
    #[case::first_done(
        vec![StageStatus { task_id: tid(), done: true }, StageStatus::default()],
        vec![StageState::Done, StageState::Ready],
    )]
    #[case::all_done(
        vec![StageStatus { task_id: tid(), done: true }, StageStatus { task_id: tid(), done: true }],
        vec![StageState::Done, StageState::Done],
    )]
    fn derives_states(#[case] stages: Vec<StageStatus>, #[case] expected: Vec<StageState>) {
        assert_eq!(derive_stage_states(&stages), expected);
    }

    #[rstest]
    #[case::uppercase("Sectors")]
    #[case::quote("sectors; drop table tasks")]
    #[case::leading_digit("1sectors")]
    #[case::empty("")]
    fn rejects_unsafe_identifiers(#[case] table: &str) {
        assert!(matches!(
            PipelineDefinition::new(table, &["sdr"]),
            Err(PipelineError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn rejects_duplicate_and_missing_stages() {
        assert!(matches!(
            PipelineDefinition::new("p", &["a", "a"]),
            Err(PipelineError::DuplicateStage { .. })
        ));
        assert!(matches!(
            PipelineDefinition::new("p", &[]),
            Err(PipelineError::NoStages(_))
        ));
    }

    #[test]
    fn stage_lookup() {
        let def = PipelineDefinition::new("sectors_sdr_pipeline", &["sdr", "trees"]).unwrap();

        assert_eq!(def.stage_index("trees").unwrap(), 1);
        assert_eq!(def.previous_stage(1), Some("sdr"));
        assert_eq!(def.previous_stage(0), None);
        assert!(def.stage_index("finalize").is_err());
        assert_eq!(PipelineDefinition::task_column("trees"), "task_id_trees");
        assert_eq!(PipelineDefinition::done_column("trees"), "after_trees");
    }

    #[test]
    fn merge_inserts_object_keys() {
        let mut payload = json!({"sp_id": 1000, "comm_d": "old"});
        merge_payload(&mut payload, &json!({"comm_d": "new", "comm_r": "r"}));

        assert_eq!(payload, json!({"sp_id": 1000, "comm_d": "new", "comm_r": "r"}));
    }

    #[test]
    fn merge_wraps_non_objects() {
        let mut payload = json!(null);
        merge_payload(&mut payload, &json!("cid"));
        assert_eq!(payload, json!({"output": "cid"}));

        let mut payload = json!(7);
        merge_payload(&mut payload, &json!({"a": 1}));
        assert_eq!(payload, json!({"payload": 7, "a": 1}));
    }
}
