use std::{
    error::Error,
    fmt::{self, Display},
};
use thiserror::Error;
use wardenutils::WardenutilsError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a wardencpi-related operation.
pub type WardenCpiResult<T> = Result<T, WardenCpiError>;

/// An error that occurred during a CPI operation.
#[derive(pretty_error_debug::Debug, Error)]
pub enum WardenCpiError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON document could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// A host command failed.
    #[error(transparent)]
    Utils(#[from] WardenutilsError),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// A port range was out of bounds or malformed.
    #[error("invalid port range: {0}")]
    InvalidPortRange(String),

    /// Host and container port ranges have different lengths.
    #[error("Host and container port ranges must have same length")]
    PortRangeLengthMismatch,

    /// Host and container port ranges of length > 1 differ.
    #[error("Host and container port ranges must be same")]
    PortRangeMismatch,

    /// A port range was used with a protocol other than tcp or udp.
    #[error("Port ranges can only be used with tcp or udp protocol, got '{0}'")]
    UnsupportedProtocolForRange(String),

    /// A port mapping had no protocol.
    #[error("Protocol must be specified")]
    MissingProtocol,

    /// No network was given to a VM.
    #[error("Expected exactly one network; received zero")]
    NoNetworks,

    /// A network had an unusable address or netmask.
    #[error("invalid network '{0}'")]
    InvalidNetwork(String),

    /// The CPI configuration is incomplete or malformed.
    #[error("Validating config: {}", .0.join("; "))]
    ConfigValidationErrors(Vec<String>),

    /// A VM was required to exist but does not.
    #[error("VM '{0}' does not exist")]
    VmNotFound(String),

    /// A stemcell was required to exist but does not.
    #[error("Expected to find stemcell '{0}'")]
    StemcellNotFound(String),

    /// Stemcell metadata on disk is unusable.
    #[error("invalid stemcell '{0}': {1}")]
    InvalidStemcell(String, String),

    /// The container runtime reported a failure.
    #[error("container runtime error: {0}")]
    Runtime(String),

    /// A privileged script inside a container exited non-zero.
    #[error("Script exited with non-0 exit code {exit_code}, stdout: '{stdout}' stderr: '{stderr}'")]
    ScriptFailed {
        /// The script's exit code.
        exit_code: i32,

        /// Captured standard output.
        stdout: String,

        /// Captured standard error.
        stderr: String,
    },

    /// A tar stream from a container could not be read.
    #[error("reading tar stream for '{path}': {source}")]
    InvalidTarStream {
        /// The file the stream was expected to contain.
        path: String,

        /// The underlying read error.
        #[source]
        source: std::io::Error,
    },

    /// The agent env registry answered with a non-2xx status.
    #[error("Received non-2xx status code '{status}' when contacting registry '{endpoint}'")]
    RegistryStatus {
        /// The HTTP status code.
        status: u16,

        /// The endpoint that was contacted, without credentials.
        endpoint: String,
    },

    /// A contended resource stayed busy for every retry attempt.
    #[error("{resource} still busy after {attempts} attempts: {source}")]
    ResourceBusy {
        /// What was being retried.
        resource: String,

        /// How many attempts were made.
        attempts: u32,

        /// The error from the last attempt.
        #[source]
        source: Box<WardenCpiError>,
    },

    /// An error annotated with the step that produced it.
    #[error("{context}: {source}")]
    Context {
        /// Description of the failing step.
        context: String,

        /// The underlying error.
        #[source]
        source: Box<WardenCpiError>,
    },
}

/// Coarse classification of a [`WardenCpiError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A VM, disk or stemcell was absent when required.
    NotFound,

    /// Malformed input such as a bad port mapping or missing network.
    Validation,

    /// A mount or firewall resource stayed contended through every retry.
    ResourceBusy,

    /// The container runtime, filesystem, firewall tool or registry failed.
    Dependency,

    /// A document or stream had an unexpected shape.
    Protocol,
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Attaches a step description to a failing result.
pub trait ResultExt<T> {
    /// Wraps the error with `context`.
    fn context(self, context: impl Into<String>) -> WardenCpiResult<T>;

    /// Wraps the error with a lazily built context.
    fn with_context<S, F>(self, f: F) -> WardenCpiResult<T>
    where
        S: Into<String>,
        F: FnOnce() -> S;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WardenCpiError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> WardenCpiError {
        WardenCpiError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Wraps this error with a step description.
    pub fn wrap(self, context: impl Into<String>) -> WardenCpiError {
        WardenCpiError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Returns the innermost error, looking through step descriptions.
    pub fn root(&self) -> &WardenCpiError {
        match self {
            WardenCpiError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns the captured standard error of a failed host command, if that is the root cause.
    pub fn stderr(&self) -> Option<&str> {
        match self.root() {
            WardenCpiError::Utils(e) => e.stderr(),
            _ => None,
        }
    }

    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WardenCpiError::Context { source, .. } => source.kind(),
            WardenCpiError::ResourceBusy { .. } => ErrorKind::ResourceBusy,
            WardenCpiError::VmNotFound(_) | WardenCpiError::StemcellNotFound(_) => {
                ErrorKind::NotFound
            }
            WardenCpiError::InvalidPortRange(_)
            | WardenCpiError::PortRangeLengthMismatch
            | WardenCpiError::PortRangeMismatch
            | WardenCpiError::UnsupportedProtocolForRange(_)
            | WardenCpiError::MissingProtocol
            | WardenCpiError::NoNetworks
            | WardenCpiError::InvalidNetwork(_)
            | WardenCpiError::ConfigValidationErrors(_)
            | WardenCpiError::InvalidStemcell(..) => ErrorKind::Validation,
            WardenCpiError::Json(_) | WardenCpiError::InvalidTarStream { .. } => {
                ErrorKind::Protocol
            }
            WardenCpiError::Io(_)
            | WardenCpiError::HttpRequest(_)
            | WardenCpiError::Utils(_)
            | WardenCpiError::Custom(_)
            | WardenCpiError::Runtime(_)
            | WardenCpiError::ScriptFailed { .. }
            | WardenCpiError::RegistryStatus { .. } => ErrorKind::Dependency,
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

/// Creates an `Ok` `WardenCpiResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> WardenCpiResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<WardenCpiError>,
{
    fn context(self, context: impl Into<String>) -> WardenCpiResult<T> {
        self.map_err(|e| e.into().wrap(context))
    }

    fn with_context<S, F>(self, f: F) -> WardenCpiResult<T>
    where
        S: Into<String>,
        F: FnOnce() -> S,
    {
        self.map_err(|e| e.into().wrap(f()))
    }
}

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

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
