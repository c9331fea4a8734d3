use std::{path::Path, sync::LazyLock};

use regex::Regex;

use crate::{ResultExt, WardenCpiResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

// Accepts a superset of IPv6 and skips IPv4-embedded IPv6 forms.
static NAMESERVER_RE: LazyLock<Regex> = LazyLock::new(|| {
    let ipv4_block = r"(25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)";
    let ipv4 = format!(r"({ipv4_block}\.){{3}}{ipv4_block}");
    let ipv6 = r"([0-9A-Fa-f]{0,4}:){2,7}([0-9A-Fa-f]{0,4})";

    Regex::new(&format!(r"^\s*nameserver\s*(({ipv4})|({ipv6}))\s*$"))
        .expect("valid nameserver regex")
});

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The parts of a resolver configuration file the CPI cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvConf {
    /// Nameserver addresses in file order.
    pub nameservers: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ResolvConf {
    /// Reads and parses the resolver configuration at `path`.
    pub async fn from_path(path: impl AsRef<Path>) -> WardenCpiResult<Self> {
        let contents = tokio::fs::read_to_string(path.as_ref())
            .await
            .context("Reading resolv.conf")?;

        Ok(Self::parse(&contents))
    }

    /// Extracts nameservers from resolver configuration text, ignoring `#` comments.
    pub fn parse(contents: &str) -> Self {
        let nameservers = contents
            .split('\n')
            .map(|line| line.split_once('#').map_or(line, |(before, _)| before))
            .filter_map(|line| NAMESERVER_RE.captures(line))
            .filter_map(|captures| captures.get(1).map(|m| m.as_str().to_string()))
            .collect();

        Self { nameservers }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
