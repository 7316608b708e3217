//! MessageSender - PreCommit メッセージの送信

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::SectorRef;
use crate::domain::TaskError;

/// What a sector commits to on chain after the trees are built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreCommitMessage {
    pub sector: SectorRef,
    pub ticket: String,
    pub comm_d: String,
    pub comm_r: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Node unreachable, mempool full. Try again later.
    #[error("send failed: {0}")]
    Temporary(String),

    /// The message itself is invalid.
    #[error("message rejected: {0}")]
    Rejected(String),
}

impl From<SendError> for TaskError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Temporary(_) => TaskError::Retryable(err.to_string()),
            SendError::Rejected(_) => TaskError::Permanent(err.to_string()),
        }
    }
}

#[async_trait]
pub trait MessageSender: Send + Sync + 'static {
    /// Submit and return the message id.
    async fn send(&self, message: &PreCommitMessage) -> Result<String, SendError>;
}
