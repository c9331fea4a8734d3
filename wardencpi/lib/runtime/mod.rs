//! The container runtime seam.
//!
//! VMs are backed by containers of a Garden-style runtime. This module only describes the
//! runtime; the connection itself is supplied by the caller.

mod traits;
mod types;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use traits::*;
pub use types::*;
