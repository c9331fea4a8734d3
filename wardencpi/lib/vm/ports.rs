use std::sync::Arc;

use async_trait::async_trait;
use wardenutils::{CmdOutput, CmdRunner, Sleeper};

use crate::{
    config::{
        PortMapping, PortRange, BRIDGE_INTERFACE_MATCH, BUSY_RETRY_ATTEMPTS,
        IPTABLES_COMMENT_PREFIX, IPTABLES_LOCK_RETRY_DELAY,
    },
    ResultExt, WardenCpiError, WardenCpiResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const LOCK_CONTENDED: &str = "Resource temporarily unavailable";

const MISSING_RULE: &str = "No chain/target/match by that name";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Forwards host ports to containers with iptables DNAT rules in the `nat` table.
///
/// Every rule carries a comment naming its VM so all rules of a VM can be found again.
pub struct IpTablesPorts {
    cmd_runner: Arc<dyn CmdRunner>,
    sleeper: Arc<dyn Sleeper>,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Host port forwarding for VMs.
#[async_trait]
pub trait Ports: Send + Sync {
    /// Forwards every mapping to `container_ip`.
    ///
    /// If any mapping fails, every rule of `vm_id` is removed before the error is returned.
    async fn forward(
        &self,
        vm_id: &str,
        container_ip: &str,
        mappings: &[PortMapping],
    ) -> WardenCpiResult<()>;

    /// Removes every rule of `vm_id`.
    async fn remove_forwarded(&self, vm_id: &str) -> WardenCpiResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl IpTablesPorts {
    /// Creates a port forwarder.
    pub fn new(cmd_runner: Arc<dyn CmdRunner>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            cmd_runner,
            sleeper,
        }
    }

    /// Runs `iptables -w -t nat <action> <rule>`, waiting out xtables lock contention.
    async fn iptables(&self, action: &str, rule: &[String]) -> WardenCpiResult<CmdOutput> {
        let mut args = vec![
            "-w".to_string(),
            "-t".to_string(),
            "nat".to_string(),
            action.to_string(),
        ];
        args.extend_from_slice(rule);

        let mut attempt = 1;
        loop {
            match self.cmd_runner.run_command("iptables", &args).await {
                Ok(output) => return Ok(output),
                Err(e) if e.stderr().is_some_and(|s| s.contains(LOCK_CONTENDED)) => {
                    if attempt >= BUSY_RETRY_ATTEMPTS {
                        return Err(WardenCpiError::ResourceBusy {
                            resource: "xtables lock".to_string(),
                            attempts: attempt,
                            source: Box::new(e.into()),
                        });
                    }

                    tracing::debug!(attempt, "xtables lock is held, retrying");
                    self.sleeper.sleep(IPTABLES_LOCK_RETRY_DELAY).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn remove_rules_with_id(&self, vm_id: &str) -> WardenCpiResult<()> {
        let rules = self
            .cmd_runner
            .run_command("iptables-save", &wardenutils::args(["-t", "nat"]))
            .await
            .context("Listing nat table rules to remove rules")?;

        let comment = comment(vm_id);
        let mut last_err = None;

        for line in rules.stdout.lines() {
            if !line.split_whitespace().any(|token| token == comment) {
                continue;
            }

            // Skip the leading `-A`.
            let rule: Vec<String> = line.split(' ').skip(1).map(str::to_string).collect();

            if let Err(e) = self.iptables("-D", &rule).await {
                if e.stderr().is_some_and(|s| s.contains(MISSING_RULE)) {
                    tracing::debug!(vm_id, rule = line, "rule already removed");
                    continue;
                }

                tracing::warn!(vm_id, rule = line, error = %e, "failed to remove rule");
                last_err = Some(e);
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Ports for IpTablesPorts {
    async fn forward(
        &self,
        vm_id: &str,
        container_ip: &str,
        mappings: &[PortMapping],
    ) -> WardenCpiResult<()> {
        for mapping in mappings {
            let rule = forward_rule(vm_id, container_ip, mapping);

            if let Err(e) = self.iptables("-A", &rule).await {
                if let Err(cleanup) = self.remove_rules_with_id(vm_id).await {
                    tracing::error!(vm_id, error = %cleanup, "failed to roll back forwarded ports");
                }

                return Err(e.wrap(format!("Forwarding host port(s) '{}'", mapping.host())));
            }

            tracing::debug!(vm_id, host = %mapping.host(), container_ip, "forwarded port(s)");
        }

        Ok(())
    }

    async fn remove_forwarded(&self, vm_id: &str) -> WardenCpiResult<()> {
        self.remove_rules_with_id(vm_id).await
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn comment(vm_id: &str) -> String {
    format!("{IPTABLES_COMMENT_PREFIX}-{vm_id}")
}

fn forward_rule(vm_id: &str, container_ip: &str, mapping: &PortMapping) -> Vec<String> {
    wardenutils::args([
        "PREROUTING".to_string(),
        "-p".to_string(),
        mapping.protocol().to_string(),
        // Traffic already on the container bridge is not forwarded again.
        "!".to_string(),
        "-i".to_string(),
        BRIDGE_INTERFACE_MATCH.to_string(),
        "--dport".to_string(),
        mapping.host().join(":"),
        "-j".to_string(),
        "DNAT".to_string(),
        "--to".to_string(),
        join_host_port(container_ip, mapping.container()),
        "-m".to_string(),
        "comment".to_string(),
        "--comment".to_string(),
        comment(vm_id),
    ])
}

fn join_host_port(ip: &str, ports: PortRange) -> String {
    if ip.contains(':') {
        format!("[{ip}]:{}", ports.join("-"))
    } else {
        format!("{ip}:{}", ports.join("-"))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
