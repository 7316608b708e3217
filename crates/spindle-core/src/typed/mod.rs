//! Typed - task type の API
//!
//! # 構成
//! - **task**: `TaskInterface`（Do / CanAccept / TypeDetails / Adder）
//! - **context**: `TaskContext`, `EngineHandle`
//! - **registry**: `TaskRegistry`（名前 → 実装）
//! - **stages**: `StageRegistry`, `AddTask`（ステージ → 作成コールバック）

pub mod context;
pub mod registry;
pub mod stages;
pub mod task;

pub use self::context::{EngineHandle, TaskContext};
pub use self::registry::{RegisteredTask, RegistryError, TaskRegistry};
pub use self::stages::{AddTask, StageRegistry};
pub use self::task::{AcceptData, Accepted, TaskInterface};
