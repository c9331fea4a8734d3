use std::collections::BTreeMap;

use bytes::Bytes;
use getset::Getters;
use typed_builder::TypedBuilder;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Key/value properties attached to a container, also used as a list filter.
pub type Properties = BTreeMap<String, String>;

/// Everything the runtime needs to create a container.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ContainerSpec {
    /// Container handle; the VM id.
    #[builder(setter(into))]
    handle: String,

    /// Root filesystem: a directory path or a `docker://` image reference.
    #[builder(setter(into))]
    rootfs_path: String,

    /// Static `ip/prefix` to assign, or `None` to let the runtime pick.
    #[builder(default)]
    network: Option<String>,

    /// Host directories to expose inside the container.
    #[builder(default)]
    bind_mounts: Vec<BindMount>,

    /// Whether the container runs privileged.
    #[builder(default)]
    privileged: bool,

    /// Properties to attach to the container.
    #[builder(default)]
    properties: Properties,
}

/// A host directory exposed inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Source path.
    pub src_path: String,

    /// Destination path inside the container.
    pub dst_path: String,

    /// Whether the mount is writable.
    pub mode: BindMountMode,

    /// Which filesystem the source path belongs to.
    pub origin: BindMountOrigin,
}

/// Access mode of a [`BindMount`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMountMode {
    /// Read-only.
    Ro,

    /// Read-write.
    Rw,
}

/// Origin of a [`BindMount`] source path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMountOrigin {
    /// The source lives on the host.
    Host,

    /// The source lives inside the container.
    Container,
}

/// Information the runtime reports about a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Lifecycle state, e.g. `active`.
    pub state: String,

    /// Address of the container on the bridge network.
    pub container_ip: String,

    /// Address of the host side of the bridge.
    pub host_ip: String,
}

/// A process to run inside a container.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ProcessSpec {
    /// Executable path.
    #[builder(setter(into))]
    path: String,

    /// Arguments.
    #[builder(default)]
    args: Vec<String>,

    /// User to run as.
    #[builder(setter(into))]
    user: String,
}

/// Exit status and captured output of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code.
    pub exit_code: i32,

    /// Captured standard output.
    pub stdout: Bytes,

    /// Captured standard error.
    pub stderr: Bytes,
}

/// A tar stream to extract into a container directory.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct StreamInSpec {
    /// Directory to extract into.
    #[builder(setter(into))]
    path: String,

    /// User that owns the extracted files.
    #[builder(setter(into))]
    user: String,

    /// The tar archive.
    tar_stream: Bytes,
}

/// A path to archive out of a container.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct StreamOutSpec {
    /// File or directory to archive.
    #[builder(setter(into))]
    path: String,

    /// User to read as.
    #[builder(setter(into))]
    user: String,
}
