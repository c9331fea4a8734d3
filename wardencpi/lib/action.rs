//! The CPI operations, with decoded arguments.
//!
//! Every failure is wrapped with the step and the ids involved, e.g.
//! `Attaching disk 'disk-1' to VM 'vm-1': ...`.

use std::sync::Arc;

use serde_json::{Map, Value};
use wardenutils::{HostCmdRunner, TokioSleeper};

use crate::{
    config::{Config, VmCloudProperties, DEFAULT_RESOLV_CONF_PATH},
    disk::{Disk, FsDiskFinder},
    runtime::ContainerClient,
    stemcell::CompositeStemcellFinder,
    vm::{
        FsGuestBindMounts, FsHostBindMounts, IpTablesPorts, Networks, UuidGenerator,
        WardenAgentEnvServiceFactory, WardenCreator, WardenFinder, WardenMetadataService,
    },
    ResultExt, WardenCpiError, WardenCpiResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The CPI.
pub struct Cpi {
    creator: WardenCreator,
    finder: WardenFinder,
    stemcell_finder: CompositeStemcellFinder,
    disk_finder: FsDiskFinder,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Cpi {
    /// Validates `config` and wires the host collaborators around `client`.
    pub fn new(config: &Config, client: Arc<dyn ContainerClient>) -> WardenCpiResult<Self> {
        config.validate()?;

        let actions = config.get_actions();
        let cmd_runner = Arc::new(HostCmdRunner);
        let sleeper = Arc::new(TokioSleeper);

        let ports = Arc::new(IpTablesPorts::new(cmd_runner.clone(), sleeper.clone()));
        let host_bind_mounts = Arc::new(FsHostBindMounts::new(
            actions.get_host_ephemeral_bind_mounts_dir(),
            actions.get_host_persistent_bind_mounts_dir(),
            cmd_runner,
            sleeper,
        ));
        let guest_bind_mounts = Arc::new(FsGuestBindMounts::new(
            actions.get_guest_ephemeral_bind_mount_path(),
            actions.get_guest_persistent_bind_mounts_dir(),
        ));

        let agent_env_service_factory = Arc::new(WardenAgentEnvServiceFactory::new(
            actions.get_agent_env_service(),
            actions.get_registry().clone(),
        ));
        let metadata_service = Arc::new(WardenMetadataService::new(
            actions.get_agent_env_service(),
            actions.get_registry().clone(),
        ));

        let creator = WardenCreator::new(
            Arc::new(UuidGenerator),
            client.clone(),
            metadata_service,
            agent_env_service_factory.clone(),
            ports.clone(),
            host_bind_mounts.clone(),
            guest_bind_mounts.clone(),
            DEFAULT_RESOLV_CONF_PATH,
            actions.get_agent().clone(),
        );

        let finder = WardenFinder::new(
            client,
            agent_env_service_factory,
            ports,
            host_bind_mounts,
            guest_bind_mounts,
        );

        Ok(Self::from_parts(
            creator,
            finder,
            CompositeStemcellFinder::new(actions.get_stemcells_dir()),
            FsDiskFinder::new(actions.get_disks_dir()),
        ))
    }

    /// Assembles a CPI from already built parts.
    pub fn from_parts(
        creator: WardenCreator,
        finder: WardenFinder,
        stemcell_finder: CompositeStemcellFinder,
        disk_finder: FsDiskFinder,
    ) -> Self {
        Self {
            creator,
            finder,
            stemcell_finder,
            disk_finder,
        }
    }

    /// Creates a VM from stemcell `stemcell_id` and returns its id.
    pub async fn create_vm(
        &self,
        agent_id: &str,
        stemcell_id: &str,
        cloud_properties: Value,
        networks: Networks,
        env: Map<String, Value>,
    ) -> WardenCpiResult<String> {
        let stemcell = self
            .stemcell_finder
            .find(stemcell_id)
            .await
            .with_context(|| format!("Finding stemcell '{stemcell_id}'"))?
            .ok_or_else(|| WardenCpiError::StemcellNotFound(stemcell_id.to_string()))?;

        let cloud_properties: VmCloudProperties = serde_json::from_value(cloud_properties)
            .context("Parsing VM cloud properties")?;

        let props = cloud_properties
            .as_vm_props()
            .context("Validating 'ports' configuration")?;

        let vm = self
            .creator
            .create(agent_id, &stemcell, props, networks, env)
            .await
            .with_context(|| format!("Creating VM with agent ID '{agent_id}'"))?;

        Ok(vm.get_id().clone())
    }

    /// Deletes VM `vm_id` along with any host state it left behind.
    pub async fn delete_vm(&self, vm_id: &str) -> WardenCpiResult<()> {
        let vm = self
            .finder
            .find(vm_id)
            .await
            .with_context(|| format!("Finding VM '{vm_id}'"))?;

        vm.delete()
            .await
            .with_context(|| format!("Deleting VM '{vm_id}'"))
    }

    /// Whether VM `vm_id` has a live container.
    pub async fn has_vm(&self, vm_id: &str) -> WardenCpiResult<bool> {
        let vm = self
            .finder
            .find(vm_id)
            .await
            .with_context(|| format!("Finding VM '{vm_id}'"))?;

        Ok(vm.container_exists())
    }

    /// Attaches disk `disk_id` to VM `vm_id` and returns the disk hint.
    pub async fn attach_disk(&self, vm_id: &str, disk_id: &str) -> WardenCpiResult<String> {
        let vm = self
            .finder
            .find(vm_id)
            .await
            .with_context(|| format!("Finding VM '{vm_id}'"))?;

        if !vm.container_exists() {
            return Err(WardenCpiError::VmNotFound(vm_id.to_string()));
        }

        let disk = self.disk_finder.find(disk_id);

        vm.attach_disk(&disk)
            .await
            .with_context(|| format!("Attaching disk '{disk_id}' to VM '{vm_id}'"))
    }

    /// Detaches disk `disk_id` from VM `vm_id`.
    pub async fn detach_disk(&self, vm_id: &str, disk_id: &str) -> WardenCpiResult<()> {
        let vm = self
            .finder
            .find(vm_id)
            .await
            .with_context(|| format!("Finding VM '{vm_id}'"))?;

        if !vm.container_exists() {
            return Err(WardenCpiError::VmNotFound(vm_id.to_string()));
        }

        let disk = self.disk_finder.find(disk_id);

        vm.detach_disk(&disk)
            .await
            .with_context(|| format!("Detaching disk '{disk_id}' from VM '{vm_id}'"))
    }

    /// Returns the ids of the disks attached to VM `vm_id`.
    pub async fn get_disks(&self, vm_id: &str) -> WardenCpiResult<Vec<String>> {
        let vm = self
            .finder
            .find(vm_id)
            .await
            .with_context(|| format!("Finding VM '{vm_id}'"))?;

        vm.disk_ids()
            .await
            .with_context(|| format!("Listing disks of VM '{vm_id}'"))
    }

    /// Deletes stemcell `stemcell_id`. A missing stemcell is not an error.
    pub async fn delete_stemcell(&self, stemcell_id: &str) -> WardenCpiResult<()> {
        self.stemcell_finder
            .delete(stemcell_id)
            .await
            .with_context(|| format!("Deleting stemcell '{stemcell_id}'"))
    }

    /// Whether disk `disk_id` has a backing file.
    pub async fn has_disk(&self, disk_id: &str) -> WardenCpiResult<bool> {
        self.disk_finder
            .find(disk_id)
            .exists()
            .await
            .with_context(|| format!("Finding disk '{disk_id}'"))
    }

    /// Deletes the backing file of disk `disk_id`.
    pub async fn delete_disk(&self, disk_id: &str) -> WardenCpiResult<()> {
        self.disk_finder
            .find(disk_id)
            .delete()
            .await
            .with_context(|| format!("Deleting disk '{disk_id}'"))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
