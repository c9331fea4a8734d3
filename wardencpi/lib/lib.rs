//! `wardencpi` lets a BOSH director treat Garden containers as virtual machines.
//!
//! # Overview
//!
//! Each VM is a privileged container. The CPI provides:
//! - VM creation, lookup and deletion on top of a container runtime
//! - Persistent disks as loop-mounted files, bind mounted into the VM
//! - Host port forwarding through iptables NAT rules tagged per VM
//! - The agent env, a JSON document the in-container agent boots from, kept either in the
//!   container itself or in an HTTP registry
//!
//! Every step that touches the host or the runtime can fail on its own. Creation stops the
//! container when a later step fails, and deletion cleans up host state even when the
//! container is already gone.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use serde_json::{json, Map};
//! use wardencpi::{action::Cpi, config::Config, runtime::ContainerClient, vm::Networks};
//!
//! async fn create(client: Arc<dyn ContainerClient>) -> anyhow::Result<()> {
//!     wardencpi::init_logging();
//!
//!     let config = Config::from_path("/var/vcap/jobs/warden_cpi/config/cpi.json").await?;
//!     let cpi = Cpi::new(&config, client)?;
//!
//!     let vm_id = cpi
//!         .create_vm("agent-1", "stemcell-1", json!({}), Networks::default(), Map::new())
//!         .await?;
//!     cpi.attach_disk(&vm_id, "disk-1").await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`action`] - The CPI operations
//! - [`config`] - Configuration, cloud properties and well-known paths
//! - [`disk`] - File-backed persistent disks
//! - [`runtime`] - The container runtime interface
//! - [`stemcell`] - Stemcell lookup
//! - [`vm`] - VM lifecycle, bind mounts, port forwarding and the agent env

#![warn(missing_docs)]

mod error;
mod log;

#[cfg(test)]
mod fakes;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod action;
pub mod config;
pub mod disk;
pub mod runtime;
pub mod stemcell;
pub mod vm;

pub use error::*;
pub use log::*;
