//! Domain model (IDs, task rows, resources, pipelines, outcomes, ...).
//!
//! ストアや engine のループに依存しない純粋な型だけを置きます。

pub mod attempt;
pub mod decision;
pub mod errors;
pub mod events;
pub mod ids;
pub mod outcome;
pub mod pipeline;
pub mod record;
pub mod resources;
pub mod retry;
pub mod state;
pub mod task;
pub mod task_type;

pub use attempt::{AttemptRecord, AttemptResult};
pub use decision::{Decider, Decision, DefaultDecider};
pub use errors::{StoreError, TaskError};
pub use events::DomainEvent;
pub use ids::{EngineId, TaskId};
pub use outcome::{Outcome, OutcomeKind};
pub use pipeline::{
    PipelineDefinition, PipelineEntity, PipelineError, StageRef, StageState, StageStatus,
};
pub use record::{EngineRecord, TaskRecord};
pub use resources::{LedgerSnapshot, Reservation, ResourceLedger, Resources};
pub use retry::RetryPolicy;
pub use state::{QueueCounts, TaskState};
pub use task::TaskType;
pub use task_type::TaskTypeDetails;
