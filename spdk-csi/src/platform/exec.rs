//! External command execution with a deadline.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{CsiError, Result};

/// Deadline for host commands such as `nvme connect` or `iscsiadm`.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(40);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

/// Run a command and fail unless it exits zero. Returns stdout.
pub async fn run_checked(runner: &dyn CommandRunner, program: &str, args: &[&str]) -> Result<String> {
    let output = runner.run(program, args).await?;
    if !output.success() {
        return Err(CsiError::CommandFailed {
            command: format!("{} {}", program, args.join(" ")),
            output: output.stderr.trim().to_string(),
        });
    }
    Ok(output.stdout)
}

/// Runs commands on the host through `tokio::process`. A command that
/// outlives the deadline is killed.
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::with_timeout(COMMAND_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        info!(program, args = ?args, "Running command");
        let child = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CsiError::Timeout(format!(
                    "{} {} did not finish within {:?}",
                    program,
                    args.join(" "),
                    self.timeout
                )));
            }
        };

        let output = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(program, code = ?output.code, stdout = %output.stdout.trim(), "Command finished");
        Ok(output)
    }
}
