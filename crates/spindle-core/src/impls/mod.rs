//! Impls - ports の実装
//!
//! - InMemoryStore: 開発・テスト用（単一 Mutex）
//! - SqliteStore: sqlx による SQLite 実装（本番用）
//! - TracingEventSink / RecordingEventSink

pub mod event_sinks;
pub mod memory_store;
pub mod sqlite_store;

pub use self::event_sinks::{RecordingEventSink, TracingEventSink};
pub use self::memory_store::InMemoryStore;
pub use self::sqlite_store::SqliteStore;

use chrono::{DateTime, Utc};
use std::time::Duration;

/// `now - lease_timeout`, clamped instead of overflowing.
pub(crate) fn lease_cutoff(now: DateTime<Utc>, lease_timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease_timeout)
        .ok()
        .and_then(|timeout| now.checked_sub_signed(timeout))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
