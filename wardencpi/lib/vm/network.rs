use std::{
    collections::BTreeMap,
    net::Ipv4Addr,
    ops::{Deref, DerefMut},
};

use ipnetwork::{ipv4_mask_to_prefix, Ipv4Network as Ipv4Net};
use serde::{Deserialize, Serialize};

use crate::{WardenCpiError, WardenCpiResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Networks requested for a VM, keyed by network name.
///
/// Backed by a `BTreeMap` so that default-network fallback always picks the same network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Networks(BTreeMap<String, Network>);

/// A single network of a VM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Network {
    /// Network type: `manual`, `dynamic` or `vip`.
    #[serde(rename = "type", default)]
    pub network_type: String,

    /// Static IP address.
    #[serde(default)]
    pub ip: String,

    /// Dotted-quad netmask.
    #[serde(default)]
    pub netmask: String,

    /// Gateway address.
    #[serde(default)]
    pub gateway: String,

    /// DNS servers.
    #[serde(default)]
    pub dns: Vec<String>,

    /// What this network is the default for, e.g. `dns` and `gateway`.
    #[serde(rename = "default", default)]
    pub default_for: Vec<String>,

    /// Opaque cloud properties.
    #[serde(default)]
    pub cloud_properties: serde_json::Map<String, serde_json::Value>,

    /// Set once the CPI has applied the network, so the agent does not reconfigure it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub preconfigured: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Networks {
    /// Returns the name and network that is default for `what`.
    ///
    /// When no network claims it, the network with the smallest name is chosen.
    pub fn default_for(&self, what: &str) -> Option<(&str, &Network)> {
        if let Some((name, network)) = self.0.iter().find(|(_, n)| n.is_default_for(what)) {
            return Some((name, network));
        }

        let (name, network) = self.0.iter().next()?;
        if self.0.len() > 1 {
            tracing::warn!(
                network = %name,
                default_for = what,
                "no network is marked default, falling back to first network by name"
            );
        }

        Some((name, network))
    }

    /// Fills the DNS servers of the DNS-default network when it has none.
    pub fn backfill_default_dns(&mut self, nameservers: &[String]) {
        let Some(name) = self.default_for("dns").map(|(name, _)| name.to_string()) else {
            return;
        };

        if let Some(network) = self.0.get_mut(&name) {
            if network.dns.is_empty() {
                tracing::debug!(network = %name, ?nameservers, "backfilling dns servers");
                network.dns = nameservers.to_vec();
            }
        }
    }

    /// Marks every network as already configured by the CPI.
    pub fn mark_preconfigured(&mut self) {
        for network in self.0.values_mut() {
            network.preconfigured = true;
        }
    }
}

impl Network {
    /// Whether the network is the default for `what`.
    pub fn is_default_for(&self, what: &str) -> bool {
        self.default_for.iter().any(|d| d == what)
    }

    /// Whether the network gets its address from the runtime.
    pub fn is_dynamic(&self) -> bool {
        self.network_type == "dynamic"
    }

    /// Returns `ip/prefix`, e.g. `10.244.0.2/24`.
    pub fn ip_with_prefix(&self) -> WardenCpiResult<String> {
        let ip: Ipv4Addr = self
            .ip
            .parse()
            .map_err(|_| WardenCpiError::InvalidNetwork(format!("bad ip '{}'", self.ip)))?;

        let mask: Ipv4Addr = self.netmask.parse().map_err(|_| {
            WardenCpiError::InvalidNetwork(format!("bad netmask '{}'", self.netmask))
        })?;

        let prefix = ipv4_mask_to_prefix(mask).map_err(|_| {
            WardenCpiError::InvalidNetwork(format!("non-contiguous netmask '{}'", self.netmask))
        })?;

        let net = Ipv4Net::new(ip, prefix)
            .map_err(|e| WardenCpiError::InvalidNetwork(e.to_string()))?;

        Ok(net.to_string())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Deref for Networks {
    type Target = BTreeMap<String, Network>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Networks {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl FromIterator<(String, Network)> for Networks {
    fn from_iter<T: IntoIterator<Item = (String, Network)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
