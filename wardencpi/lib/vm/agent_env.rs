use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{AgentOptions, BlobstoreOptions};

use super::Networks;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The boot configuration the in-container agent reads on start.
///
/// Fields this crate does not know about are kept in `extra` so that a fetch followed by an
/// update does not drop them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentEnv {
    /// Agent id assigned by the director.
    #[serde(default)]
    pub agent_id: String,

    /// Identity of the VM.
    #[serde(default)]
    pub vm: VmSpec,

    /// Message bus URL.
    #[serde(default)]
    pub mbus: String,

    /// NTP servers.
    #[serde(default)]
    pub ntp: Vec<String>,

    /// Blobstore settings.
    #[serde(default)]
    pub blobstore: BlobstoreOptions,

    /// Networks of the VM.
    #[serde(default)]
    pub networks: Networks,

    /// Disk hints.
    #[serde(default)]
    pub disks: DisksSpec,

    /// User environment passed through from the director.
    #[serde(default)]
    pub env: serde_json::Map<String, serde_json::Value>,

    /// Unknown fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// VM identity inside an [`AgentEnv`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    /// VM name; the VM id.
    #[serde(default)]
    pub name: String,

    /// VM id.
    #[serde(default)]
    pub id: String,
}

/// Where the agent finds each disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisksSpec {
    /// System disk hint.
    #[serde(default)]
    pub system: DiskHint,

    /// Ephemeral disk hint, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<DiskHint>,

    /// Persistent disk id to hint.
    #[serde(default)]
    pub persistent: BTreeMap<String, DiskHint>,
}

/// Tells the agent where a disk shows up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DiskHint {
    /// A path, e.g. `/warden-cpi-dev/disk-1`.
    Path(String),

    /// A structured hint such as `{"path": ..., "volume_id": ...}`.
    Details(serde_json::Map<String, serde_json::Value>),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AgentEnv {
    /// Builds the agent env for a freshly created VM.
    pub fn for_vm(
        agent_id: impl Into<String>,
        vm_id: impl Into<String>,
        networks: Networks,
        env: serde_json::Map<String, serde_json::Value>,
        agent_options: &AgentOptions,
    ) -> Self {
        let vm_id = vm_id.into();

        Self {
            agent_id: agent_id.into(),
            vm: VmSpec {
                name: vm_id.clone(),
                id: vm_id,
            },
            mbus: agent_options.get_mbus().clone(),
            ntp: agent_options.get_ntp().clone(),
            blobstore: agent_options.get_blobstore().clone(),
            networks,
            disks: DisksSpec::default(),
            env,
            extra: Default::default(),
        }
    }

    /// Sets the system disk hint.
    pub fn attach_system_disk(&mut self, hint: DiskHint) {
        self.disks.system = hint;
    }

    /// Records a persistent disk.
    pub fn attach_persistent_disk(&mut self, disk_id: impl Into<String>, hint: DiskHint) {
        self.disks.persistent.insert(disk_id.into(), hint);
    }

    /// Forgets a persistent disk.
    pub fn detach_persistent_disk(&mut self, disk_id: &str) {
        self.disks.persistent.remove(disk_id);
    }

    /// Returns the ids of every recorded persistent disk.
    pub fn persistent_disk_ids(&self) -> Vec<String> {
        self.disks.persistent.keys().cloned().collect()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for DiskHint {
    fn default() -> Self {
        Self::Path(String::new())
    }
}

impl From<String> for DiskHint {
    fn from(path: String) -> Self {
        Self::Path(path)
    }
}

impl From<&str> for DiskHint {
    fn from(path: &str) -> Self {
        Self::Path(path.to_string())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
