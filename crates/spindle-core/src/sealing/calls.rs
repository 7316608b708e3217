//! SealCalls - 封印の重い計算
//!
//! 全て同期関数です。task 側が `spawn_blocking` の中から呼びます。

use super::SectorRef;
use super::storage::SectorPaths;
use crate::domain::TaskError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SealError {
    /// Worth another attempt (I/O hiccup, storage busy).
    #[error("{0}")]
    Failed(String),

    /// The sector cannot be sealed as-is.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl From<SealError> for TaskError {
    fn from(err: SealError) -> Self {
        match err {
            SealError::Failed(msg) => TaskError::Retryable(msg),
            SealError::Permanent(msg) => TaskError::Permanent(msg),
        }
    }
}

impl From<std::io::Error> for SealError {
    fn from(err: std::io::Error) -> Self {
        SealError::Failed(err.to_string())
    }
}

pub trait SealCalls: Send + Sync + 'static {
    /// Layer generation into `paths.cache`.
    fn generate_sdr(
        &self,
        sector: &SectorRef,
        paths: &SectorPaths,
        ticket: &str,
    ) -> Result<(), SealError>;

    /// Data tree. Returns comm_d.
    fn tree_d(&self, sector: &SectorRef, paths: &SectorPaths) -> Result<String, SealError>;

    /// Replica and column trees into `paths.sealed`. Returns comm_r.
    fn tree_rc(
        &self,
        sector: &SectorRef,
        paths: &SectorPaths,
        comm_d: &str,
    ) -> Result<String, SealError>;

    /// Copy sealed + cache files to long-term storage, then drop the originals.
    fn move_storage(
        &self,
        sector: &SectorRef,
        from: &SectorPaths,
        to: &SectorPaths,
    ) -> Result<(), SealError>;
}
