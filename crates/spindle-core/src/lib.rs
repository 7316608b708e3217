//! spindle-core
//!
//! ストアで協調する分散タスクスケジューラの中核です。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task row, resources, pipeline, outcome, decision, errors, events）
//! - **ports**: 抽象化レイヤー（TaskStore, Clock, IdGenerator, EventSink）
//! - **app**: engine / poller / reaper のループと builder
//! - **typed**: task type の API（TaskInterface, TaskContext, StageRegistry）
//! - **impls**: 実装（InMemoryStore, SqliteStore, イベント sink）
//! - **sealing**: セクター封印パイプラインの task type（SDR → Trees → PreCommit → MoveStorage）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod sealing;
pub mod typed;
