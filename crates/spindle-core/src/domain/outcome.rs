//! Outcome model: what a task's `Do` reports back to the engine.

use serde::{Deserialize, Serialize};

/// Did the attempt finish its work?
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    /// Work finished. The stage flag (if any) is flipped with the task.
    Done,
    /// Work did not finish. Counted as a retryable failure.
    Incomplete,
}

/// Result of a successful `Do` call.
///
/// `output` is a JSON object merged into the pipeline entity payload when
/// the task completes a stage, so later stages can read what earlier ones
/// produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub kind: OutcomeKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Outcome {
    pub fn done() -> Self {
        Self {
            kind: OutcomeKind::Done,
            output: None,
            reason: None,
        }
    }

    pub fn incomplete(reason: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Incomplete,
            output: None,
            reason: Some(reason.into()),
        }
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn is_done(&self) -> bool {
        self.kind == OutcomeKind::Done
    }
}
