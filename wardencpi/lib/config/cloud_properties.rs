use serde::{Deserialize, Deserializer};

use crate::{ResultExt, WardenCpiResult};

use super::{PortMapping, PortRange, DEFAULT_PORT_PROTOCOL};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// VM cloud properties as supplied by the director for `create_vm`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VmCloudProperties {
    /// Ports to forward from the host into the container.
    #[serde(default)]
    pub ports: Vec<VmCloudPropertiesPort>,
}

/// One `ports` entry of [`VmCloudProperties`].
///
/// `host` and `container` accept either JSON numbers (`80`) or strings (`"1000:2000"`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VmCloudPropertiesPort {
    /// Host port or range.
    #[serde(default, deserialize_with = "deserialize_always_string")]
    pub host: String,

    /// Container port or range. Defaults to `host` when empty.
    #[serde(default, deserialize_with = "deserialize_always_string")]
    pub container: String,

    /// Protocol. Defaults to `tcp` when empty.
    #[serde(default)]
    pub protocol: String,
}

/// Properties that shape a VM, derived from [`VmCloudProperties`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmProps {
    /// Validated port mappings.
    pub port_mappings: Vec<PortMapping>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AlwaysString {
    Number(u64),
    Text(String),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmCloudProperties {
    /// Validates every port entry and converts them into [`VmProps`].
    pub fn as_vm_props(&self) -> WardenCpiResult<VmProps> {
        let port_mappings = self
            .ports
            .iter()
            .enumerate()
            .map(|(i, port)| port.port_mapping().with_context(|| format!("Validating ports[{i}]")))
            .collect::<WardenCpiResult<Vec<_>>>()?;

        Ok(VmProps { port_mappings })
    }
}

impl VmCloudPropertiesPort {
    fn port_mapping(&self) -> WardenCpiResult<PortMapping> {
        let host: PortRange = self.host.parse()?;

        let container = if self.container.is_empty() {
            host
        } else {
            self.container.parse()?
        };

        let protocol = if self.protocol.is_empty() {
            DEFAULT_PORT_PROTOCOL
        } else {
            self.protocol.as_str()
        };

        PortMapping::new(host, container, protocol)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn deserialize_always_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match AlwaysString::deserialize(deserializer)? {
        AlwaysString::Number(n) => n.to_string(),
        AlwaysString::Text(s) => s,
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
