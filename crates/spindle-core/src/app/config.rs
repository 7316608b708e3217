//! Config - engine / poller / reaper の設定
//!
//! 全て `Default` を持つ素の構造体です。環境変数からの読み込みは CLI 側
//! （`spindle-cli` の `Settings`）の責務。

use std::time::Duration;

use crate::domain::{Resources, RetryPolicy};

/// Task engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// This machine's capacity. The ledger never reserves beyond it.
    pub capacity: Resources,
    /// Idle wait between scheduling passes that started nothing.
    pub poll_interval: Duration,
    /// Upper bound on candidates claimed per type per pass.
    pub claim_batch: usize,
    pub heartbeat_interval: Duration,
    /// Backoff while the store is unavailable.
    pub store_backoff: RetryPolicy,
    /// How often a completion write is retried before the attempt is given up
    /// and left to the reaper.
    pub completion_retries: u32,
}

impl EngineConfig {
    pub fn new(capacity: Resources) -> Self {
        Self {
            capacity,
            poll_interval: Duration::from_secs(3),
            claim_batch: 10,
            heartbeat_interval: Duration::from_secs(10),
            store_backoff: RetryPolicy::new(
                Duration::from_secs(1),
                2.0,
                Duration::from_secs(30),
            ),
            completion_retries: 5,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_claim_batch(mut self, claim_batch: usize) -> Self {
        self.claim_batch = claim_batch.max(1);
        self
    }

    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    pub fn with_store_backoff(mut self, store_backoff: RetryPolicy) -> Self {
        self.store_backoff = store_backoff;
        self
    }
}

/// Pipeline poller settings.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub poll_interval: Duration,
    /// Entities examined per pipeline per pass.
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 500,
        }
    }
}

/// Lease expiry settings.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// An engine silent for longer than this loses its running tasks.
    pub lease_timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            lease_timeout: Duration::from_secs(60),
        }
    }
}
