//! TaskTypeDetails - task type の静的な記述子
//!
//! 登録後は不変です。engine はこの値だけを見てスケジューリングします
//! （同時実行数、リソースコスト、失敗許容回数、リトライ間隔）。

use serde::{Deserialize, Serialize};

use super::resources::Resources;
use super::retry::RetryPolicy;
use super::task::TaskType;

/// TaskTypeDetails は task type ごとのスケジューリング情報
///
/// # 0 の意味
/// - `max_concurrent == 0`: engine あたりの同時実行数に上限なし
/// - `max_failures == 0`: 何度失敗しても dead にしない
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTypeDetails {
    pub name: TaskType,
    pub max_concurrent: usize,
    pub cost: Resources,
    pub max_failures: u32,
    pub retry: RetryPolicy,
}

impl TaskTypeDetails {
    /// 上限なし・コストなし・デフォルトのリトライで作成
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: TaskType::new(name),
            max_concurrent: 0,
            cost: Resources::default(),
            max_failures: 0,
            retry: RetryPolicy::default_v1(),
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_cost(mut self, cost: Resources) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
