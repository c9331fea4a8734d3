//! Configuration types and helpers.

mod cloud_properties;
mod cpi;
mod defaults;
mod port_range;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use cloud_properties::*;
pub use cpi::*;
pub use defaults::*;
pub use port_range::*;
