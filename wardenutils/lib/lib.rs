//! `wardenutils` is a library containing host utilities for the wardencpi project.

#![warn(missing_docs)]

pub mod cmd;
pub mod error;
pub mod sleeper;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use cmd::*;
pub use error::*;
pub use sleeper::*;
