use std::{path::PathBuf, sync::Arc};

use serde_json::{Map, Value};

use crate::{
    config::{AgentOptions, VmProps},
    runtime::{
        BindMount, BindMountMode, BindMountOrigin, Container, ContainerClient, ContainerSpec,
        ProcessSpec,
    },
    stemcell::Stemcell,
    ResultExt, WardenCpiError, WardenCpiResult,
};

use super::{
    AgentEnv, AgentEnvServiceFactory, ContainerFileService, FsGuestBindMounts, HostBindMounts,
    MetadataService, Networks, Ports, ResolvConf, WardenVm,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const AGENT_START_SCRIPT: &str = "umount /etc/resolv.conf
umount /etc/hosts
umount /etc/hostname
rm -rf /var/vcap/data/sys
mkdir -p /var/vcap/data/sys
exec env -i /usr/sbin/runsvdir-start";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Generates new VM ids.
pub trait IdGenerator: Send + Sync {
    /// Returns a fresh id.
    fn generate(&self) -> WardenCpiResult<String>;
}

/// Generates random v4 UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

/// Provisions containers as VMs.
pub struct WardenCreator {
    id_generator: Arc<dyn IdGenerator>,
    client: Arc<dyn ContainerClient>,
    metadata_service: Arc<dyn MetadataService>,
    agent_env_service_factory: Arc<dyn AgentEnvServiceFactory>,
    ports: Arc<dyn Ports>,
    host_bind_mounts: Arc<dyn HostBindMounts>,
    guest_bind_mounts: Arc<FsGuestBindMounts>,
    resolv_conf_path: PathBuf,
    agent_options: AgentOptions,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WardenCreator {
    /// Creates a VM creator.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id_generator: Arc<dyn IdGenerator>,
        client: Arc<dyn ContainerClient>,
        metadata_service: Arc<dyn MetadataService>,
        agent_env_service_factory: Arc<dyn AgentEnvServiceFactory>,
        ports: Arc<dyn Ports>,
        host_bind_mounts: Arc<dyn HostBindMounts>,
        guest_bind_mounts: Arc<FsGuestBindMounts>,
        resolv_conf_path: impl Into<PathBuf>,
        agent_options: AgentOptions,
    ) -> Self {
        Self {
            id_generator,
            client,
            metadata_service,
            agent_env_service_factory,
            ports,
            host_bind_mounts,
            guest_bind_mounts,
            resolv_conf_path: resolv_conf_path.into(),
            agent_options,
        }
    }

    /// Provisions a container from `stemcell` and boots the agent in it.
    ///
    /// Host bind mount directories are made before the container exists, so a failure up to
    /// that point leaves nothing to undo. Any later failure stops the container and returns
    /// the error of the failing step; the directories are left for a subsequent delete.
    pub async fn create(
        &self,
        agent_id: &str,
        stemcell: &Stemcell,
        props: VmProps,
        mut networks: Networks,
        env: Map<String, Value>,
    ) -> WardenCpiResult<WardenVm> {
        let id = self.id_generator.generate().context("Generating VM id")?;

        let network_cidr = resolve_network_cidr(&networks)?;

        let resolv_conf = ResolvConf::from_path(&self.resolv_conf_path)
            .await
            .context("Reading system resolv.conf")?;
        networks.backfill_default_dns(&resolv_conf.nameservers);
        networks.mark_preconfigured();

        let host_ephemeral_path = self
            .host_bind_mounts
            .make_ephemeral(&id)
            .await
            .context("Making host ephemeral bind mount path")?;

        let host_persistent_dir = self
            .host_bind_mounts
            .make_persistent(&id)
            .await
            .context("Making host persistent bind mounts dir")?;

        let bind_mounts = vec![
            BindMount {
                src_path: host_ephemeral_path.display().to_string(),
                dst_path: self.guest_bind_mounts.make_ephemeral().to_string(),
                mode: BindMountMode::Rw,
                origin: BindMountOrigin::Host,
            },
            BindMount {
                src_path: host_persistent_dir.display().to_string(),
                dst_path: self.guest_bind_mounts.make_persistent().to_string(),
                mode: BindMountMode::Rw,
                origin: BindMountOrigin::Host,
            },
        ];

        let spec = ContainerSpec::builder()
            .handle(id.as_str())
            .rootfs_path(stemcell.rootfs_uri())
            .network(network_cidr)
            .bind_mounts(bind_mounts)
            .privileged(true)
            .build();

        tracing::debug!(vm_id = %id, ?spec, "creating container");

        let container = self
            .client
            .create(spec)
            .await
            .context("Creating container")?;

        match self
            .provision(&id, agent_id, container.clone(), props, networks, env)
            .await
        {
            Ok(vm) => {
                tracing::info!(vm_id = %id, agent_id, stemcell_id = stemcell.id(), "created vm");
                Ok(vm)
            }
            Err(e) => {
                clean_up_container(container.as_ref()).await;
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        id: &str,
        agent_id: &str,
        container: Arc<dyn Container>,
        props: VmProps,
        networks: Networks,
        env: Map<String, Value>,
    ) -> WardenCpiResult<WardenVm> {
        let info = container.info().await.context("Getting container info")?;

        self.ports
            .forward(id, &info.container_ip, &props.port_mappings)
            .await
            .context("Forwarding host ports")?;

        let mut agent_env = AgentEnv::for_vm(agent_id, id, networks, env, &self.agent_options);
        agent_env.attach_system_disk("".into());

        let file_service = Arc::new(ContainerFileService::new(container.clone()));
        let agent_env_service = self
            .agent_env_service_factory
            .new_service(file_service.clone(), id);

        agent_env_service
            .update(&agent_env)
            .await
            .context("Updating container's agent env")?;

        self.metadata_service
            .save(file_service.as_ref(), id)
            .await
            .context("Updating container's metadata")?;

        start_agent(container.as_ref())
            .await
            .context("Running BOSH Agent in container")?;

        Ok(WardenVm::new(
            id,
            self.client.clone(),
            Some(agent_env_service),
            self.ports.clone(),
            self.host_bind_mounts.clone(),
            self.guest_bind_mounts.clone(),
        ))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the `ip/prefix` to give the container, or `None` for a dynamic network.
fn resolve_network_cidr(networks: &Networks) -> WardenCpiResult<Option<String>> {
    if networks.is_empty() {
        return Err(WardenCpiError::NoNetworks);
    }

    let Some((name, network)) = networks.default_for("gateway") else {
        return Err(WardenCpiError::NoNetworks);
    };

    if network.is_dynamic() {
        tracing::debug!(network = name, "network is dynamic, runtime assigns the ip");
        return Ok(None);
    }

    network.ip_with_prefix().map(Some)
}

/// Starts the supervisor that runs the agent. The process is not waited on.
async fn start_agent(container: &dyn Container) -> WardenCpiResult<()> {
    let spec = ProcessSpec::builder()
        .path("/bin/bash")
        .args(vec!["-c".to_string(), AGENT_START_SCRIPT.to_string()])
        .user("root")
        .build();

    let process = container.run(spec).await?;
    tracing::debug!(handle = container.handle(), process_id = process.id(), "started agent");

    Ok(())
}

async fn clean_up_container(container: &dyn Container) {
    if let Err(e) = container.stop(true).await {
        tracing::error!(handle = container.handle(), error = %e, "failed stopping container");
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> WardenCpiResult<String> {
        Ok(uuid::Uuid::new_v4().to_string())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
