//! VM lifecycle on top of containers.
//!
//! A VM is a privileged container with two host directories bind mounted into it: one for
//! ephemeral data and one holding a mount point per attached persistent disk. Its boot
//! configuration, the agent env, lives inside the container or in a registry.

mod agent_env;
mod agent_env_service;
mod creator;
mod file_service;
mod finder;
mod guest_bind_mounts;
mod host_bind_mounts;
mod metadata;
mod network;
mod ports;
mod resolvconf;
mod vm;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use agent_env::*;
pub use agent_env_service::*;
pub use creator::*;
pub use file_service::*;
pub use finder::*;
pub use guest_bind_mounts::*;
pub use host_bind_mounts::*;
pub use metadata::*;
pub use network::*;
pub use ports::*;
pub use resolvconf::*;
pub use vm::*;
