//! `wardenutils::error` is a module containing error utilities for the wardencpi project.

use std::{
    error::Error,
    fmt::{self, Display},
};

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a wardenutils-related operation.
pub type WardenutilsResult<T> = Result<T, WardenutilsError>;

/// An error that occurred while running a host utility.
#[derive(pretty_error_debug::Debug, Error)]
pub enum WardenutilsError {
    /// A command could not be spawned at all.
    #[error("failed to spawn '{command}': {source}")]
    CommandSpawn {
        /// The command line that was attempted.
        command: String,

        /// The underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// A command ran but exited unsuccessfully.
    #[error("command '{command}' exited with {exit_code:?}, stdout: '{stdout}' stderr: '{stderr}'")]
    CommandFailed {
        /// The command line that was run.
        command: String,

        /// The exit code, if the process was not killed by a signal.
        exit_code: Option<i32>,

        /// Captured standard output.
        stdout: String,

        /// Captured standard error.
        stderr: String,
    },

    /// An error that occurred when performing an IO operation
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Custom error.
    #[error("Custom error: {0}")]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WardenutilsError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> WardenutilsError {
        WardenutilsError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Returns the captured standard error of a failed command.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            WardenutilsError::CommandFailed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `WardenutilsResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> WardenutilsResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
