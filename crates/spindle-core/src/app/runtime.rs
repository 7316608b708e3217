//! RuntimeHandle - engine / poller / reaper をまとめて起動・停止する
//!
//! # 学習ポイント
//! - `watch` チャネル一本で全ループに停止を伝える
//! - 停止要求は実行中の `Do` を取り消さない。新しい claim を止めるだけ

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::error;

use super::engine::TaskEngine;

/// Handle to the running loops.
/// - `request_shutdown()` で全ループに停止を伝える
/// - `shutdown_and_join()` で engine が実行中タスクを待ち終えるまで待つ
pub struct RuntimeHandle {
    engine: Arc<TaskEngine>,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl RuntimeHandle {
    pub(crate) fn new(
        engine: Arc<TaskEngine>,
        shutdown_tx: watch::Sender<bool>,
        joins: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            engine,
            shutdown_tx,
            joins,
        }
    }

    pub fn engine(&self) -> &Arc<TaskEngine> {
        &self.engine
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                error!(?err, "runtime loop panicked");
            }
        }
    }
}
