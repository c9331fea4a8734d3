use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use crate::{
    config::{RegistryOptions, AGENT_ENV_PATH, METADATA_PATH, USER_DATA_PATH},
    ResultExt, WardenCpiResult,
};

use super::FileService;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Writes the user data and instance metadata files the agent reads on boot.
#[derive(Debug, Clone)]
pub struct WardenMetadataService {
    agent_env_service: String,
    registry: RegistryOptions,
}

#[derive(Debug, Serialize)]
struct UserData {
    registry: RegistryEndpoint,
}

#[derive(Debug, Serialize)]
struct RegistryEndpoint {
    endpoint: String,
}

#[derive(Debug, Serialize)]
struct Metadata<'a> {
    #[serde(rename = "instance-id")]
    instance_id: &'a str,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Persists CPI metadata into a VM.
#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Writes user data and then the instance id of `vm_id` through `file_service`.
    async fn save(&self, file_service: &dyn FileService, vm_id: &str) -> WardenCpiResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WardenMetadataService {
    /// Creates a metadata service for the `fs` or `registry` agent env backend.
    pub fn new(agent_env_service: impl Into<String>, registry: RegistryOptions) -> Self {
        Self {
            agent_env_service: agent_env_service.into(),
            registry,
        }
    }

    fn registry_endpoint(&self) -> String {
        if self.agent_env_service == "registry" {
            self.registry.endpoint_with_credentials()
        } else {
            AGENT_ENV_PATH.to_string()
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl MetadataService for WardenMetadataService {
    async fn save(&self, file_service: &dyn FileService, vm_id: &str) -> WardenCpiResult<()> {
        let user_data = UserData {
            registry: RegistryEndpoint {
                endpoint: self.registry_endpoint(),
            },
        };

        let contents = serde_json::to_vec(&user_data).context("Marshalling user data")?;
        tracing::debug!(path = USER_DATA_PATH, "saving user data");

        file_service
            .upload(USER_DATA_PATH, Bytes::from(contents))
            .await
            .context("Saving user data")?;

        let metadata = Metadata { instance_id: vm_id };
        let contents = serde_json::to_vec(&metadata).context("Marshalling metadata")?;
        tracing::debug!(path = METADATA_PATH, vm_id, "saving metadata");

        file_service
            .upload(METADATA_PATH, Bytes::from(contents))
            .await
            .context("Saving metadata")
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
