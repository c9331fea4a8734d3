//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Bind mount paths as seen from inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsGuestBindMounts {
    ephemeral_path: String,
    persistent_dir: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FsGuestBindMounts {
    /// Creates guest paths from the configured mount points.
    pub fn new(ephemeral_path: impl Into<String>, persistent_dir: impl Into<String>) -> Self {
        Self {
            ephemeral_path: ephemeral_path.into(),
            persistent_dir: persistent_dir.into(),
        }
    }

    /// Where the host ephemeral directory is mounted.
    pub fn make_ephemeral(&self) -> &str {
        &self.ephemeral_path
    }

    /// Where the host persistent directory is mounted.
    pub fn make_persistent(&self) -> &str {
        &self.persistent_dir
    }

    /// Where disk `disk_id` shows up inside the container.
    pub fn mount_persistent(&self, disk_id: &str) -> String {
        format!("{}/{}", self.persistent_dir.trim_end_matches('/'), disk_id)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
