//! Persistent disks backed by files in the disks directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::{ResultExt, WardenCpiResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A disk backed by a single file on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsDisk {
    id: String,
    path: PathBuf,
}

/// Maps disk ids to their backing files.
#[derive(Debug, Clone)]
pub struct FsDiskFinder {
    dir: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// A persistent disk.
#[async_trait]
pub trait Disk: Send + Sync {
    /// The disk id.
    fn id(&self) -> &str;

    /// The backing file.
    fn path(&self) -> &Path;

    /// Whether the backing file is present.
    async fn exists(&self) -> WardenCpiResult<bool>;

    /// Removes the backing file. A missing file is not an error.
    async fn delete(&self) -> WardenCpiResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FsDisk {
    /// Creates a disk handle. Nothing is touched on disk.
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }
}

impl FsDiskFinder {
    /// Creates a finder rooted at the disks directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the disk with id `id`, whether or not its file exists.
    pub fn find(&self, id: &str) -> FsDisk {
        FsDisk::new(id, self.dir.join(id))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Disk for FsDisk {
    fn id(&self) -> &str {
        &self.id
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn exists(&self) -> WardenCpiResult<bool> {
        Ok(tokio::fs::try_exists(&self.path).await?)
    }

    async fn delete(&self) -> WardenCpiResult<()> {
        tracing::debug!(disk_id = %self.id, path = %self.path.display(), "deleting disk");

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Deleting disk '{}'", self.path.display())),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
