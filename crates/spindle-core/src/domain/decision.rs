//! Decision model: what happens to a task row after a failed attempt.
//!
//! This module defines the Decision type (what to do next) and the Decider trait
//! (how to determine it from the task row and its type's limits).

use std::time::Duration;

use super::record::TaskRecord;
use super::task_type::TaskTypeDetails;

/// The next action to take for a failed task.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Requeue the task, claimable again after `delay`.
    Retry { delay: Duration, reason: String },

    /// Mark the task as dead (give up).
    MarkDead { reason: String },
}

/// Trait for deciding the next action after a failure.
///
/// Deciders are pure functions: given the row as it was before this
/// failure and the type's limits, they return the next action without side
/// effects. Writing the decision to the store is the engine's job.
pub trait Decider: Send + Sync {
    fn decide(&self, task: &TaskRecord, details: &TaskTypeDetails, error: &str) -> Decision;
}

/// Failure counting against `max_failures`, backoff from the type's `RetryPolicy`.
///
/// - Retry while `failures + 1 < max_failures`
/// - Mark dead once `failures + 1 >= max_failures`
/// - `max_failures == 0` never gives up
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDecider;

impl DefaultDecider {
    pub fn new() -> Self {
        Self
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &TaskRecord, details: &TaskTypeDetails, error: &str) -> Decision {
        let failures = task.failures.saturating_add(1);
        if details.max_failures > 0 && failures >= details.max_failures {
            Decision::MarkDead {
                reason: format!(
                    "max failures reached ({failures}/{}): {error}",
                    details.max_failures
                ),
            }
        } else {
            let delay = details.retry.next_delay(failures);
            Decision::Retry {
                delay,
                reason: format!("failure {failures}, retry after {delay:?}: {error}"),
            }
        }
    }
}
