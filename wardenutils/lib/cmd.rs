//! `wardenutils::cmd` runs host commands such as `mount`, `umount` and `iptables`.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::{WardenutilsError, WardenutilsResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Captured output of a command that exited successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    /// Standard output, lossily decoded as UTF-8.
    pub stdout: String,

    /// Standard error, lossily decoded as UTF-8.
    pub stderr: String,
}

/// Runs commands on the host using `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct HostCmdRunner;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Runs a program to completion and captures its output.
///
/// A non-zero exit status is reported as [`WardenutilsError::CommandFailed`] carrying both
/// output streams, so callers can tell benign failures apart by inspecting `stderr`.
#[async_trait]
pub trait CmdRunner: Send + Sync {
    /// Runs `program` with `args` and waits for it to exit.
    async fn run_command(&self, program: &str, args: &[String]) -> WardenutilsResult<CmdOutput>;
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Renders a program and its arguments the way they would be typed in a shell.
pub fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Converts a list of string-likes into owned command arguments.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl CmdRunner for HostCmdRunner {
    async fn run_command(&self, program: &str, args: &[String]) -> WardenutilsResult<CmdOutput> {
        let command = command_line(program, args);
        tracing::debug!(command = %command, "running command");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| WardenutilsError::CommandSpawn {
                command: command.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            tracing::debug!(command = %command, status = %output.status, stderr = %stderr, "command failed");
            return Err(WardenutilsError::CommandFailed {
                command,
                exit_code: output.status.code(),
                stdout,
                stderr,
            });
        }

        Ok(CmdOutput { stdout, stderr })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
