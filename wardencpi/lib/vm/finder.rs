use std::sync::Arc;

use crate::{
    runtime::{ContainerClient, Properties},
    ResultExt, WardenCpiResult,
};

use super::{
    AgentEnvServiceFactory, ContainerFileService, FsGuestBindMounts, HostBindMounts, Ports,
    WardenVm,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Looks up VMs among the live containers.
pub struct WardenFinder {
    client: Arc<dyn ContainerClient>,
    agent_env_service_factory: Arc<dyn AgentEnvServiceFactory>,
    ports: Arc<dyn Ports>,
    host_bind_mounts: Arc<dyn HostBindMounts>,
    guest_bind_mounts: Arc<FsGuestBindMounts>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WardenFinder {
    /// Creates a finder.
    pub fn new(
        client: Arc<dyn ContainerClient>,
        agent_env_service_factory: Arc<dyn AgentEnvServiceFactory>,
        ports: Arc<dyn Ports>,
        host_bind_mounts: Arc<dyn HostBindMounts>,
        guest_bind_mounts: Arc<FsGuestBindMounts>,
    ) -> Self {
        Self {
            client,
            agent_env_service_factory,
            ports,
            host_bind_mounts,
            guest_bind_mounts,
        }
    }

    /// Finds VM `id`.
    ///
    /// Always returns a VM; [`WardenVm::container_exists`] tells whether a container with
    /// handle `id` is live. A VM without a container can still be deleted to clean up host
    /// state left by a failed create. All containers are listed rather than looked up by
    /// handle so that an absent container is not confused with a runtime failure.
    pub async fn find(&self, id: &str) -> WardenCpiResult<WardenVm> {
        tracing::debug!(vm_id = id, "finding container");

        let containers = self
            .client
            .containers(Properties::new())
            .await
            .context("Listing all containers")?;

        let agent_env_service = containers
            .into_iter()
            .find(|container| container.handle() == id)
            .map(|container| {
                let file_service = Arc::new(ContainerFileService::new(container));
                self.agent_env_service_factory.new_service(file_service, id)
            });

        tracing::debug!(vm_id = id, found = agent_env_service.is_some(), "found container");

        Ok(WardenVm::new(
            id,
            self.client.clone(),
            agent_env_service,
            self.ports.clone(),
            self.host_bind_mounts.clone(),
            self.guest_bind_mounts.clone(),
        ))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
