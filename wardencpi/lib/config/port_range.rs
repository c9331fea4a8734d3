use std::{fmt, str::FromStr, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{WardenCpiError, WardenCpiResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

static PORT_RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\A([1-9][0-9]*)(\s*[\-:]\s*([1-9][0-9]*))?\z").expect("valid port range regex")
});

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An inclusive range of ports, both ends in `1..=65535`.
///
/// ## Format
/// A range is written as a single port (`"8080"`) or as two ports joined by `-` or `:`
/// (`"1000-2000"`, `"1000:2000"`). Whitespace around the delimiter is allowed.
///
/// ## Examples
///
/// ```
/// use wardencpi::config::PortRange;
///
/// let range = "10-12".parse::<PortRange>().unwrap();
/// assert_eq!(range, PortRange::new(10, 12).unwrap());
/// assert_eq!(range.len(), 3);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    start: u16,
    end: u16,
}

/// Maps a range of host ports onto a range of container ports for one protocol.
///
/// Ranges longer than one port must be identical on both sides and are only supported for
/// `tcp` and `udp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    host: PortRange,
    container: PortRange,
    protocol: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PortRange {
    /// Creates a new range from `start` to `end`, inclusive.
    pub fn new(start: u32, end: u32) -> WardenCpiResult<Self> {
        if start == 0 || start > u16::MAX as u32 {
            return Err(WardenCpiError::InvalidPortRange(format!(
                "Port range start must be > 0 and <= 65535, got {start}"
            )));
        }

        if end == 0 || end > u16::MAX as u32 {
            return Err(WardenCpiError::InvalidPortRange(format!(
                "Port range end must be > 0 and <= 65535, got {end}"
            )));
        }

        if start > end {
            return Err(WardenCpiError::InvalidPortRange(format!(
                "Port range start must be <= end, got {start}-{end}"
            )));
        }

        Ok(Self {
            start: start as u16,
            end: end as u16,
        })
    }

    /// Creates a range covering a single port.
    pub fn single(port: u16) -> WardenCpiResult<Self> {
        Self::new(port as u32, port as u32)
    }

    /// Returns the first port of the range.
    pub fn start(&self) -> u16 {
        self.start
    }

    /// Returns the last port of the range.
    pub fn end(&self) -> u16 {
        self.end
    }

    /// Returns the number of ports in the range.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u32 {
        (self.end - self.start) as u32 + 1
    }

    /// Renders the range as `start` or `start<sep>end`.
    pub fn join(&self, sep: &str) -> String {
        if self.len() == 1 {
            self.start.to_string()
        } else {
            format!("{}{}{}", self.start, sep, self.end)
        }
    }
}

impl PortMapping {
    /// Creates a mapping after checking that both ranges and the protocol are compatible.
    pub fn new(
        host: PortRange,
        container: PortRange,
        protocol: impl Into<String>,
    ) -> WardenCpiResult<Self> {
        let protocol = protocol.into();

        if host.len() != container.len() {
            return Err(WardenCpiError::PortRangeLengthMismatch);
        }

        if protocol.is_empty() {
            return Err(WardenCpiError::MissingProtocol);
        }

        if host.len() > 1 {
            if host != container {
                return Err(WardenCpiError::PortRangeMismatch);
            }

            if protocol != "tcp" && protocol != "udp" {
                return Err(WardenCpiError::UnsupportedProtocolForRange(protocol));
            }
        }

        Ok(Self {
            host,
            container,
            protocol,
        })
    }

    /// Returns the host side of the mapping.
    pub fn host(&self) -> PortRange {
        self.host
    }

    /// Returns the container side of the mapping.
    pub fn container(&self) -> PortRange {
        self.container
    }

    /// Returns the protocol, e.g. `tcp`.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for PortRange {
    type Err = WardenCpiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = PORT_RANGE_RE.captures(s).ok_or_else(|| {
            WardenCpiError::InvalidPortRange(format!(
                "Port range must match '{}', got '{s}'",
                PORT_RANGE_RE.as_str()
            ))
        })?;

        let parse = |digits: &str| {
            digits
                .parse::<u32>()
                .map_err(|_| WardenCpiError::InvalidPortRange(format!("'{s}' is out of bounds")))
        };

        let start = parse(&captures[1])?;
        let end = match captures.get(3) {
            Some(end) => parse(end.as_str())?,
            None => start,
        };

        Self::new(start, end)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.join("-"))
    }
}

impl Serialize for PortRange {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PortRange {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
