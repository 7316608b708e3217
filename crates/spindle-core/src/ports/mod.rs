//! Ports - 抽象化レイヤー
//!
//! engine / poller / reaper が外部（ストア、時刻、ID、イベント出力）に触れる境界です。
//!
//! # 設計原則
//! - ストアが source of truth（正本）
//! - engine 同士はストア以外を共有しない

pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::EventSink;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::TaskStore;
