//! Stemcell lookup.
//!
//! A stemcell is either a root filesystem unpacked under the stemcells directory or a light
//! stemcell that only names a container image. Importing stemcells happens elsewhere.

use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::{
    config::{LIGHT_STEMCELL_MANIFEST, LIGHT_STEMCELL_SCHEME},
    ResultExt, WardenCpiError, WardenCpiResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A root filesystem source for new containers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stemcell {
    /// An unpacked root filesystem directory.
    Dir {
        /// The stemcell id.
        id: String,

        /// The unpacked root filesystem.
        path: PathBuf,
    },

    /// A container image reference.
    Light {
        /// The stemcell id.
        id: String,

        /// The image reference, e.g. `bosh/warden-stemcell:1.0`.
        image_reference: String,
    },
}

/// Finds stemcells in a directory, falling back to ids that look like image references.
#[derive(Debug, Clone)]
pub struct CompositeStemcellFinder {
    dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct LightStemcellManifest {
    #[serde(default)]
    image_reference: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Stemcell {
    /// The stemcell id.
    pub fn id(&self) -> &str {
        match self {
            Stemcell::Dir { id, .. } | Stemcell::Light { id, .. } => id,
        }
    }

    /// What the container runtime should use as root filesystem.
    pub fn rootfs_uri(&self) -> String {
        match self {
            Stemcell::Dir { path, .. } => path.display().to_string(),
            Stemcell::Light {
                image_reference, ..
            } => format!("{LIGHT_STEMCELL_SCHEME}{image_reference}"),
        }
    }
}

impl CompositeStemcellFinder {
    /// Creates a finder rooted at the stemcells directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Looks up stemcell `id`. Returns `None` when it cannot be found.
    pub async fn find(&self, id: &str) -> WardenCpiResult<Option<Stemcell>> {
        let dir = self.dir.join(id);

        if tokio::fs::try_exists(&dir).await? {
            let manifest = dir.join(LIGHT_STEMCELL_MANIFEST);
            if tokio::fs::try_exists(&manifest).await? {
                return Self::find_light(id, &manifest).await.map(Some);
            }

            tracing::debug!(stemcell_id = id, path = %dir.display(), "found stemcell directory");
            return Ok(Some(Stemcell::Dir {
                id: id.to_string(),
                path: dir,
            }));
        }

        if is_light_stemcell_id(id) {
            tracing::debug!(stemcell_id = id, "treating stemcell id as image reference");
            return Ok(Some(Stemcell::Light {
                id: id.to_string(),
                image_reference: id.to_string(),
            }));
        }

        Ok(None)
    }

    /// Removes stemcell `id` from the stemcells directory.
    ///
    /// A missing stemcell is not an error. Ids that are not a single path component, such as
    /// image references, have nothing on disk and are left alone.
    pub async fn delete(&self, id: &str) -> WardenCpiResult<()> {
        let mut components = Path::new(id).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) {
            tracing::debug!(stemcell_id = id, "stemcell has no directory to delete");
            return Ok(());
        }

        let dir = self.dir.join(id);
        tracing::debug!(stemcell_id = id, path = %dir.display(), "deleting stemcell");

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Removing '{}'", dir.display())),
        }
    }

    async fn find_light(id: &str, manifest: &Path) -> WardenCpiResult<Stemcell> {
        let contents = tokio::fs::read(manifest)
            .await
            .context("Reading light stemcell metadata")?;

        let manifest: LightStemcellManifest = serde_json::from_slice(&contents)
            .context("Unmarshalling light stemcell metadata")?;

        if manifest.image_reference.is_empty() {
            return Err(WardenCpiError::InvalidStemcell(
                id.to_string(),
                "Light stemcell metadata missing image_reference".to_string(),
            ));
        }

        Ok(Stemcell::Light {
            id: id.to_string(),
            image_reference: manifest.image_reference,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Whether `id` looks like an image reference rather than a path.
fn is_light_stemcell_id(id: &str) -> bool {
    id.len() > 3
        && !id.starts_with('/')
        && !id.starts_with("../")
        && (id.contains(':') || id.contains('/'))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
