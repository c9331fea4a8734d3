use std::time::Duration;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Where the agent env JSON lives inside a container.
pub const AGENT_ENV_PATH: &str = "/var/vcap/bosh/warden-cpi-agent-env.json";

/// Where CPI metadata (`{"instance-id": ...}`) lives inside a container.
pub const METADATA_PATH: &str = "/var/vcap/bosh/warden-cpi-metadata.json";

/// Where user data (`{"registry": {"endpoint": ...}}`) lives inside a container.
pub const USER_DATA_PATH: &str = "/var/vcap/bosh/warden-cpi-user-data.json";

/// Directory inside a container used to stage file transfers.
pub const STAGING_DIR: &str = "/tmp";

/// Unprivileged in-container user that owns staged downloads.
pub const UNPRIVILEGED_USER: &str = "vcap";

/// Prefix of the comment attached to every forwarded-port rule.
pub const IPTABLES_COMMENT_PREFIX: &str = "bosh-warden-cpi";

/// Interface pattern of the container bridge, excluded from DNAT rules.
pub const BRIDGE_INTERFACE_MATCH: &str = "w+";

/// Host resolver configuration consulted for default DNS servers.
pub const DEFAULT_RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

/// Agent env backend used when none is configured.
pub const DEFAULT_AGENT_ENV_SERVICE: &str = "fs";

/// Protocol assumed for port mappings that do not name one.
pub const DEFAULT_PORT_PROTOCOL: &str = "tcp";

/// File inside a stemcell directory that marks it as a light stemcell.
pub const LIGHT_STEMCELL_MANIFEST: &str = "light-stemcell.json";

/// Scheme prepended to light stemcell image references.
pub const LIGHT_STEMCELL_SCHEME: &str = "docker://";

/// Maximum attempts for busy mount, directory and iptables operations.
pub const BUSY_RETRY_ATTEMPTS: u32 = 60;

/// Wait between `umount` attempts on a busy mount.
pub const UNMOUNT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Wait between attempts to remove a busy directory tree.
pub const DELETE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Wait between `iptables` attempts while the xtables lock is held.
pub const IPTABLES_LOCK_RETRY_DELAY: Duration = Duration::from_millis(500);
