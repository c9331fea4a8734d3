use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::WardenCpiResult;

use super::{
    ContainerInfo, ContainerSpec, ProcessOutput, ProcessSpec, Properties, StreamInSpec,
    StreamOutSpec,
};

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// A connection to a Garden-style container runtime.
#[async_trait]
pub trait ContainerClient: Send + Sync {
    /// Creates a container.
    async fn create(&self, spec: ContainerSpec) -> WardenCpiResult<Arc<dyn Container>>;

    /// Destroys the container with `handle`.
    async fn destroy(&self, handle: &str) -> WardenCpiResult<()>;

    /// Lists containers whose properties match `filter`.
    ///
    /// An empty filter lists every container.
    async fn containers(&self, filter: Properties) -> WardenCpiResult<Vec<Arc<dyn Container>>>;
}

/// A single live container.
#[async_trait]
pub trait Container: Send + Sync {
    /// Returns the container handle.
    fn handle(&self) -> &str;

    /// Fetches runtime information about the container.
    async fn info(&self) -> WardenCpiResult<ContainerInfo>;

    /// Starts a process. The process keeps running if the returned handle is dropped.
    async fn run(&self, spec: ProcessSpec) -> WardenCpiResult<Box<dyn Process>>;

    /// Extracts a tar stream into a directory of the container.
    async fn stream_in(&self, spec: StreamInSpec) -> WardenCpiResult<()>;

    /// Archives a path of the container as a tar stream.
    async fn stream_out(&self, spec: StreamOutSpec) -> WardenCpiResult<Bytes>;

    /// Stops every process in the container, forcefully when `kill` is set.
    async fn stop(&self, kill: bool) -> WardenCpiResult<()>;
}

/// A process started inside a container.
#[async_trait]
pub trait Process: Send {
    /// Returns the runtime's id for the process.
    fn id(&self) -> &str;

    /// Waits for the process to exit.
    async fn wait(&mut self) -> WardenCpiResult<ProcessOutput>;
}
