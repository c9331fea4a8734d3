use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::Deserialize;

use crate::{
    config::{RegistryOptions, AGENT_ENV_PATH},
    ResultExt, WardenCpiError, WardenCpiResult,
};

use super::{AgentEnv, FileService};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Keeps the agent env in a file inside the container.
pub struct FsAgentEnvService {
    file_service: Arc<dyn FileService>,
    path: String,
}

/// Keeps the agent env in an HTTP registry.
pub struct RegistryAgentEnvService {
    client: Client,
    endpoint: String,
    username: String,
    password: String,
}

/// Chooses an agent env backend from the configured backend name.
#[derive(Debug, Clone)]
pub struct WardenAgentEnvServiceFactory {
    agent_env_service: String,
    registry: RegistryOptions,
}

#[derive(Deserialize)]
struct RegistryResponse {
    #[serde(alias = "Settings")]
    settings: String,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Reads and writes the agent env of one VM.
#[async_trait]
pub trait AgentEnvService: Send + Sync {
    /// Fetches the current agent env.
    ///
    /// Fails until [`update`](AgentEnvService::update) has succeeded at least once.
    async fn fetch(&self) -> WardenCpiResult<AgentEnv>;

    /// Replaces the agent env.
    async fn update(&self, agent_env: &AgentEnv) -> WardenCpiResult<()>;
}

/// Builds an [`AgentEnvService`] for a VM.
pub trait AgentEnvServiceFactory: Send + Sync {
    /// Returns the agent env service of `vm_id`, reaching its container through `file_service`.
    fn new_service(
        &self,
        file_service: Arc<dyn FileService>,
        vm_id: &str,
    ) -> Arc<dyn AgentEnvService>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FsAgentEnvService {
    /// Creates a service storing the agent env at the well-known path.
    pub fn new(file_service: Arc<dyn FileService>) -> Self {
        Self {
            file_service,
            path: AGENT_ENV_PATH.to_string(),
        }
    }
}

impl RegistryAgentEnvService {
    /// Creates a service for `vm_id` against the configured registry.
    pub fn new(registry: &RegistryOptions, vm_id: &str) -> Self {
        Self {
            client: Client::new(),
            endpoint: format!("{}/instances/{}/settings", registry.endpoint(), vm_id),
            username: registry.get_username().clone(),
            password: registry.get_password().clone(),
        }
    }

    fn check_status(&self, status: reqwest::StatusCode) -> WardenCpiResult<()> {
        if !status.is_success() {
            return Err(WardenCpiError::RegistryStatus {
                status: status.as_u16(),
                endpoint: self.endpoint.clone(),
            });
        }

        Ok(())
    }
}

impl WardenAgentEnvServiceFactory {
    /// Creates a factory for the `fs` or `registry` backend.
    pub fn new(agent_env_service: impl Into<String>, registry: RegistryOptions) -> Self {
        Self {
            agent_env_service: agent_env_service.into(),
            registry,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl AgentEnvService for FsAgentEnvService {
    async fn fetch(&self) -> WardenCpiResult<AgentEnv> {
        let contents = self
            .file_service
            .download(&self.path)
            .await
            .context("Downloading agent env from container")?;

        let agent_env: AgentEnv =
            serde_json::from_slice(&contents).context("Unmarshalling agent env")?;

        tracing::debug!(agent_id = %agent_env.agent_id, "fetched agent env");
        Ok(agent_env)
    }

    async fn update(&self, agent_env: &AgentEnv) -> WardenCpiResult<()> {
        tracing::debug!(agent_id = %agent_env.agent_id, "updating agent env");

        let contents = serde_json::to_vec(agent_env).context("Marshalling agent env")?;

        self.file_service
            .upload(&self.path, Bytes::from(contents))
            .await
            .context("Uploading agent env to container")
    }
}

#[async_trait]
impl AgentEnvService for RegistryAgentEnvService {
    async fn fetch(&self) -> WardenCpiResult<AgentEnv> {
        tracing::debug!(endpoint = %self.endpoint, "fetching agent env from registry");

        let response = self
            .client
            .get(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .context("Fetching agent env from registry")?;

        self.check_status(response.status())?;

        let body: RegistryResponse = serde_json::from_slice(
            &response
                .bytes()
                .await
                .with_context(|| format!("Reading response from registry '{}'", self.endpoint))?,
        )
        .context("Unmarshalling registry response")?;

        serde_json::from_str(&body.settings).context("Unmarshalling agent env from registry")
    }

    async fn update(&self, agent_env: &AgentEnv) -> WardenCpiResult<()> {
        tracing::debug!(endpoint = %self.endpoint, "updating agent env in registry");

        let contents = serde_json::to_vec(agent_env).context("Marshalling agent env")?;

        let response = self
            .client
            .put(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .body(contents)
            .send()
            .await
            .with_context(|| format!("Updating registry endpoint '{}'", self.endpoint))?;

        self.check_status(response.status())
    }
}

impl AgentEnvServiceFactory for WardenAgentEnvServiceFactory {
    fn new_service(
        &self,
        file_service: Arc<dyn FileService>,
        vm_id: &str,
    ) -> Arc<dyn AgentEnvService> {
        if self.agent_env_service == "registry" {
            Arc::new(RegistryAgentEnvService::new(&self.registry, vm_id))
        } else {
            Arc::new(FsAgentEnvService::new(file_service))
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
