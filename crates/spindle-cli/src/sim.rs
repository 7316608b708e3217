//! Stand-ins for the proof library and the chain node.
//!
//! The seal calls sleep for the configured delay and write small marker
//! files where the real outputs would go, so storage allocation, locality
//! and moves behave as they would with real sectors.

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use spindle_core::sealing::{
    MessageSender, PreCommitMessage, SealCalls, SealError, SectorPaths, SectorRef, SendError,
};

pub struct SimulatedSealCalls {
    delay: Duration,
}

impl SimulatedSealCalls {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

fn digest(value: impl Hash) -> String {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

impl SealCalls for SimulatedSealCalls {
    fn generate_sdr(
        &self,
        sector: &SectorRef,
        paths: &SectorPaths,
        ticket: &str,
    ) -> Result<(), SealError> {
        thread::sleep(self.delay);
        fs::create_dir_all(&paths.cache)?;
        fs::write(paths.cache.join("sc-02-data-layer-1.dat"), ticket)?;
        info!(sector = %sector, cache = %paths.cache.display(), "simulated sdr");
        Ok(())
    }

    fn tree_d(&self, sector: &SectorRef, paths: &SectorPaths) -> Result<String, SealError> {
        thread::sleep(self.delay);
        let comm_d = format!("baga6ea4sea{}", digest((sector, "d")));
        fs::write(paths.cache.join("sc-02-data-tree-d.dat"), &comm_d)?;
        Ok(comm_d)
    }

    fn tree_rc(
        &self,
        sector: &SectorRef,
        paths: &SectorPaths,
        comm_d: &str,
    ) -> Result<String, SealError> {
        if !paths.cache.join("sc-02-data-layer-1.dat").exists() {
            return Err(SealError::Failed(format!("{sector}: sdr layers missing")));
        }
        thread::sleep(self.delay);
        let comm_r = format!("bagboea4b5abc{}", digest((sector, comm_d)));
        fs::write(&paths.sealed, &comm_r)?;
        fs::write(paths.cache.join("sc-02-data-tree-r-last.dat"), &comm_r)?;
        Ok(comm_r)
    }

    fn move_storage(
        &self,
        sector: &SectorRef,
        from: &SectorPaths,
        to: &SectorPaths,
    ) -> Result<(), SealError> {
        fs::copy(&from.sealed, &to.sealed)?;
        copy_dir(&from.cache, &to.cache)?;
        fs::remove_file(&from.sealed)?;
        fs::remove_dir_all(&from.cache)?;
        info!(sector = %sector, from = %from.storage_id, to = %to.storage_id, "simulated move");
        Ok(())
    }
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        fs::copy(entry.path(), to.join(entry.file_name()))?;
    }
    Ok(())
}

/// Logs the message and hands back a made-up message id.
pub struct LoggingSender;

#[async_trait]
impl MessageSender for LoggingSender {
    async fn send(&self, message: &PreCommitMessage) -> Result<String, SendError> {
        let cid = format!("bafy2bzace{}", digest((&message.sector, &message.comm_r)));
        info!(
            sector = %message.sector,
            comm_r = %message.comm_r,
            cid = %cid,
            "precommit message (simulated)"
        );
        Ok(cid)
    }
}
