use std::{fmt, sync::Arc};

use getset::Getters;

use crate::{disk::Disk, runtime::ContainerClient, ResultExt, WardenCpiError, WardenCpiResult};

use super::{AgentEnvService, FsGuestBindMounts, HostBindMounts, Ports};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A VM backed by a container.
///
/// A VM without an agent env service has no container: only host-side state such as bind
/// mount directories and forwarded ports may remain, and only [`delete`](WardenVm::delete)
/// is meaningful.
#[derive(Getters)]
pub struct WardenVm {
    /// The VM id, which is also the container handle.
    #[getset(get = "pub with_prefix")]
    id: String,

    client: Arc<dyn ContainerClient>,
    agent_env_service: Option<Arc<dyn AgentEnvService>>,
    ports: Arc<dyn Ports>,
    host_bind_mounts: Arc<dyn HostBindMounts>,
    guest_bind_mounts: Arc<FsGuestBindMounts>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WardenVm {
    /// Creates a VM. Pass `None` for `agent_env_service` when the container does not exist.
    pub fn new(
        id: impl Into<String>,
        client: Arc<dyn ContainerClient>,
        agent_env_service: Option<Arc<dyn AgentEnvService>>,
        ports: Arc<dyn Ports>,
        host_bind_mounts: Arc<dyn HostBindMounts>,
        guest_bind_mounts: Arc<FsGuestBindMounts>,
    ) -> Self {
        Self {
            id: id.into(),
            client,
            agent_env_service,
            ports,
            host_bind_mounts,
            guest_bind_mounts,
        }
    }

    /// Whether the backing container exists.
    pub fn container_exists(&self) -> bool {
        self.agent_env_service.is_some()
    }

    /// Destroys the container, then removes forwarded ports and both bind mount directories.
    ///
    /// The container goes first so its mounts are released before the directories are
    /// unmounted. Host state is cleaned up even when there is no container.
    pub async fn delete(&self) -> WardenCpiResult<()> {
        if self.container_exists() {
            tracing::debug!(vm_id = %self.id, "destroying container");
            self.client
                .destroy(&self.id)
                .await
                .context("Deleting container")?;
        }

        self.ports
            .remove_forwarded(&self.id)
            .await
            .context("Removing forwarded ports")?;

        self.host_bind_mounts
            .delete_ephemeral(&self.id)
            .await
            .context("Deleting ephemeral bind mounts")?;

        self.host_bind_mounts
            .delete_persistent(&self.id)
            .await
            .context("Deleting persistent bind mounts")
    }

    /// Mounts `disk` into the VM and records it in the agent env.
    ///
    /// Returns the path at which the disk shows up inside the container. A failed agent env
    /// update leaves the host mount in place.
    pub async fn attach_disk(&self, disk: &dyn Disk) -> WardenCpiResult<String> {
        let service = self.agent_env_service()?;

        let mut agent_env = service.fetch().await.context("Fetching agent env")?;

        self.host_bind_mounts
            .mount_persistent(&self.id, disk.id(), disk.path())
            .await
            .context("Mounting persistent bind mounts dir")?;

        let hint = self.guest_bind_mounts.mount_persistent(disk.id());
        agent_env.attach_persistent_disk(disk.id(), hint.clone().into());

        service
            .update(&agent_env)
            .await
            .context("Updating agent env")?;

        tracing::info!(vm_id = %self.id, disk_id = disk.id(), hint = %hint, "attached disk");
        Ok(hint)
    }

    /// Unmounts `disk` from the VM and removes it from the agent env.
    pub async fn detach_disk(&self, disk: &dyn Disk) -> WardenCpiResult<()> {
        let service = self.agent_env_service()?;

        let mut agent_env = service.fetch().await.context("Fetching agent env")?;

        self.host_bind_mounts
            .unmount_persistent(&self.id, disk.id())
            .await
            .context("Unmounting persistent bind mounts dir")?;

        agent_env.detach_persistent_disk(disk.id());

        service
            .update(&agent_env)
            .await
            .context("Updating agent env")?;

        tracing::info!(vm_id = %self.id, disk_id = disk.id(), "detached disk");
        Ok(())
    }

    /// Returns the ids of the disks recorded in the agent env.
    ///
    /// A VM without a container has no disks.
    pub async fn disk_ids(&self) -> WardenCpiResult<Vec<String>> {
        match &self.agent_env_service {
            Some(service) => Ok(service
                .fetch()
                .await
                .context("Fetching agent env")?
                .persistent_disk_ids()),
            None => Ok(Vec::new()),
        }
    }

    fn agent_env_service(&self) -> WardenCpiResult<&Arc<dyn AgentEnvService>> {
        self.agent_env_service
            .as_ref()
            .ok_or_else(|| WardenCpiError::VmNotFound(self.id.clone()))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Debug for WardenVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WardenVm")
            .field("id", &self.id)
            .field("container_exists", &self.container_exists())
            .finish_non_exhaustive()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
