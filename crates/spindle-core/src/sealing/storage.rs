//! Storage paths for sector files.
//!
//! A machine has one or more storage roots, each usable for sealing
//! (scratch space), long-term storage, or both. Every root holds one
//! directory per file type with one entry per sector.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::SectorRef;
use super::calls::SealError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Unsealed,
    Sealed,
    Cache,
}

impl FileType {
    pub fn dir_name(&self) -> &'static str {
        match self {
            FileType::Unsealed => "unsealed",
            FileType::Sealed => "sealed",
            FileType::Cache => "cache",
        }
    }
}

/// What new files are allocated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Sealing,
    Storage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalStorageInfo {
    pub id: String,
    pub root: PathBuf,
    pub can_seal: bool,
    pub can_store: bool,
}

impl LocalStorageInfo {
    fn allows(&self, kind: PathKind) -> bool {
        match kind {
            PathKind::Sealing => self.can_seal,
            PathKind::Storage => self.can_store,
        }
    }
}

/// Locations of one sector's files under a single storage root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectorPaths {
    pub storage_id: String,
    pub unsealed: PathBuf,
    pub sealed: PathBuf,
    pub cache: PathBuf,
}

impl SectorPaths {
    fn under(storage: &LocalStorageInfo, sector: &SectorRef) -> Self {
        let name = sector.to_string();
        Self {
            storage_id: storage.id.clone(),
            unsealed: storage.root.join(FileType::Unsealed.dir_name()).join(&name),
            sealed: storage.root.join(FileType::Sealed.dir_name()).join(&name),
            cache: storage.root.join(FileType::Cache.dir_name()).join(&name),
        }
    }

    pub fn path(&self, file: FileType) -> &Path {
        match file {
            FileType::Unsealed => &self.unsealed,
            FileType::Sealed => &self.sealed,
            FileType::Cache => &self.cache,
        }
    }
}

/// Paths held for the duration of a task. Released on drop, also when the
/// task fails.
pub struct PathLease {
    paths: SectorPaths,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl PathLease {
    pub fn new(paths: SectorPaths, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            paths,
            release: Some(Box::new(release)),
        }
    }

    pub fn paths(&self) -> &SectorPaths {
        &self.paths
    }
}

impl Drop for PathLease {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

pub trait PathAllocator: Send + Sync + 'static {
    fn local_storage(&self) -> Vec<LocalStorageInfo>;

    /// Is `file` of this sector present on this machine?
    fn has_local(&self, sector: &SectorRef, file: FileType) -> bool;

    /// Find the `existing` files and reserve room for the `allocate` ones.
    ///
    /// With existing files the lease points at the root holding them,
    /// otherwise at the first root allowed for `kind`.
    fn acquire(
        &self,
        sector: &SectorRef,
        existing: &[FileType],
        allocate: &[FileType],
        kind: PathKind,
    ) -> Result<PathLease, SealError>;
}

/// Storage roots on the local filesystem.
pub struct LocalPathAllocator {
    storage: Vec<LocalStorageInfo>,
    busy: Arc<Mutex<HashSet<(SectorRef, FileType)>>>,
}

impl LocalPathAllocator {
    pub fn new(storage: Vec<LocalStorageInfo>) -> Self {
        Self {
            storage,
            busy: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn find_root(
        &self,
        sector: &SectorRef,
        existing: &[FileType],
        kind: PathKind,
    ) -> Result<&LocalStorageInfo, SealError> {
        if existing.is_empty() {
            return self
                .storage
                .iter()
                .find(|s| s.allows(kind))
                .ok_or_else(|| SealError::Failed(format!("no {kind:?} storage configured")));
        }
        self.storage
            .iter()
            .find(|s| {
                let paths = SectorPaths::under(s, sector);
                existing.iter().all(|file| paths.path(*file).exists())
            })
            .ok_or_else(|| SealError::Failed(format!("{sector}: {existing:?} not found locally")))
    }
}

impl PathAllocator for LocalPathAllocator {
    fn local_storage(&self) -> Vec<LocalStorageInfo> {
        self.storage.clone()
    }

    fn has_local(&self, sector: &SectorRef, file: FileType) -> bool {
        self.storage
            .iter()
            .any(|s| SectorPaths::under(s, sector).path(file).exists())
    }

    fn acquire(
        &self,
        sector: &SectorRef,
        existing: &[FileType],
        allocate: &[FileType],
        kind: PathKind,
    ) -> Result<PathLease, SealError> {
        let root = self.find_root(sector, existing, kind)?;
        let paths = SectorPaths::under(root, sector);

        {
            let mut busy = self.busy.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(file) = allocate.iter().find(|f| busy.contains(&(*sector, **f))) {
                return Err(SealError::Failed(format!(
                    "{sector}: {} is already being written",
                    file.dir_name()
                )));
            }
            busy.extend(allocate.iter().map(|f| (*sector, *f)));
        }

        let held: Vec<(SectorRef, FileType)> = allocate.iter().map(|f| (*sector, *f)).collect();
        let busy = Arc::clone(&self.busy);
        let lease = PathLease::new(paths, move || {
            let mut busy = busy.lock().unwrap_or_else(|p| p.into_inner());
            for entry in &held {
                busy.remove(entry);
            }
        });

        // Lease is dropped (and the reservation released) if this fails.
        for file in allocate {
            let dir = match file {
                FileType::Cache => lease.paths().cache.clone(),
                other => root.root.join(other.dir_name()),
            };
            fs::create_dir_all(dir)?;
        }
        Ok(lease)
    }
}
