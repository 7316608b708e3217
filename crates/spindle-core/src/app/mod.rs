//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **EngineBuilder**: 構築とワイヤリング（起動時検証）
//! - **TaskEngine**: claim → admission → reserve → Do → 完了記録
//! - **PipelinePoller**: Ready なステージにタスクを作る
//! - **ReaperLoop**: 沈黙した engine のタスクを回収
//! - **RuntimeHandle**: 三つのループの停止と join
//! - **StatusReport**: 状態別件数とステージ状態

pub mod builder;
pub mod config;
pub mod engine;
pub mod poller;
pub mod reaper_loop;
pub mod runtime;
pub mod status;

// 主要な型を再エクスポート
pub use self::builder::{App, BuildError, EngineBuilder};
pub use self::config::{EngineConfig, PollerConfig, ReaperConfig};
pub use self::engine::TaskEngine;
pub use self::poller::PipelinePoller;
pub use self::reaper_loop::ReaperLoop;
pub use self::runtime::RuntimeHandle;
pub use self::status::{EntityStatus, PipelineStatus, StatusReport};
