//! NVMe-oF and iSCSI initiators using the host's userspace tools.
//!
//! Login commands may fail for benign reasons (an existing session from a
//! repeated request, for instance), so their failures are only logged and
//! the appearance of the device decides the outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Initiator, NodeEnv, context_field};
use crate::context::ContextMap;
use crate::error::Result;
use crate::platform::{CommandRunner, PollConfig, find_entry_containing};

/// Run a command whose failure is not fatal by itself.
async fn run_logged(runner: &dyn CommandRunner, program: &str, args: &[&str]) {
    match runner.run(program, args).await {
        Ok(output) if output.success() => {}
        Ok(output) => warn!(
            program,
            args = ?args,
            code = ?output.code,
            stderr = %output.stderr.trim(),
            "Command failed"
        ),
        Err(e) => warn!(program, args = ?args, error = %e, "Command failed"),
    }
}

/// Wait for an entry of `dir` containing `needle`.
async fn wait_for_link(poll: &PollConfig, dir: &Path, needle: &str) -> Result<String> {
    let link = poll
        .until(&format!("{}/*{}*", dir.display(), needle), || {
            find_entry_containing(dir, needle)
        })
        .await?;
    Ok(link.to_string_lossy().into_owned())
}

async fn wait_for_link_gone(poll: &PollConfig, dir: &Path, needle: &str) -> Result<()> {
    poll.until(&format!("{}/*{}* to go away", dir.display(), needle), || {
        find_entry_containing(dir, needle).is_none().then_some(())
    })
    .await
}

pub struct NvmfInitiator {
    runner: Arc<dyn CommandRunner>,
    poll: PollConfig,
    by_id: PathBuf,
    transport: String,
    addr: String,
    port: String,
    nqn: String,
    /// Serial/model string the device link under `by-id` carries
    model: String,
}

impl NvmfInitiator {
    pub fn new(env: &NodeEnv, transport: &str, addr: &str, port: &str, nqn: &str, model: &str) -> Self {
        Self {
            runner: env.runner.clone(),
            poll: env.poll,
            by_id: env.paths.disk_by_id(),
            transport: transport.to_lowercase(),
            addr: addr.to_string(),
            port: port.to_string(),
            nqn: nqn.to_string(),
            model: model.to_string(),
        }
    }

    pub fn from_context(env: &NodeEnv, context: &ContextMap) -> Result<Self> {
        Ok(Self::new(
            env,
            context_field(context, "targetType")?,
            context_field(context, "targetAddr")?,
            context_field(context, "targetPort")?,
            context_field(context, "nqn")?,
            context_field(context, "model")?,
        ))
    }
}

#[async_trait]
impl Initiator for NvmfInitiator {
    async fn connect(&mut self) -> Result<String> {
        info!(nqn = %self.nqn, addr = %self.addr, port = %self.port, "Connecting NVMe-oF target");
        run_logged(
            self.runner.as_ref(),
            "nvme",
            &[
                "connect",
                "-t",
                &self.transport,
                "-a",
                &self.addr,
                "-s",
                &self.port,
                "-n",
                &self.nqn,
            ],
        )
        .await;
        wait_for_link(&self.poll, &self.by_id, &self.model).await
    }

    async fn disconnect(&mut self) -> Result<()> {
        info!(nqn = %self.nqn, "Disconnecting NVMe-oF target");
        run_logged(self.runner.as_ref(), "nvme", &["disconnect", "-n", &self.nqn]).await;
        wait_for_link_gone(&self.poll, &self.by_id, &self.model).await
    }
}

pub struct IscsiInitiator {
    runner: Arc<dyn CommandRunner>,
    poll: PollConfig,
    by_path: PathBuf,
    portal: String,
    iqn: String,
}

impl IscsiInitiator {
    pub fn from_context(env: &NodeEnv, context: &ContextMap) -> Result<Self> {
        Ok(Self {
            runner: env.runner.clone(),
            poll: env.poll,
            by_path: env.paths.disk_by_path(),
            portal: format!(
                "{}:{}",
                context_field(context, "targetAddr")?,
                context_field(context, "targetPort")?
            ),
            iqn: context_field(context, "iqn")?.to_string(),
        })
    }
}

#[async_trait]
impl Initiator for IscsiInitiator {
    async fn connect(&mut self) -> Result<String> {
        info!(iqn = %self.iqn, portal = %self.portal, "Logging in to iSCSI target");
        run_logged(
            self.runner.as_ref(),
            "iscsiadm",
            &["-m", "discovery", "-t", "sendtargets", "-p", &self.portal],
        )
        .await;
        run_logged(
            self.runner.as_ref(),
            "iscsiadm",
            &["-m", "node", "-T", &self.iqn, "-p", &self.portal, "--login"],
        )
        .await;
        wait_for_link(&self.poll, &self.by_path, &self.iqn).await
    }

    async fn disconnect(&mut self) -> Result<()> {
        info!(iqn = %self.iqn, portal = %self.portal, "Logging out of iSCSI target");
        run_logged(
            self.runner.as_ref(),
            "iscsiadm",
            &["-m", "node", "-T", &self.iqn, "-p", &self.portal, "--logout"],
        )
        .await;
        wait_for_link_gone(&self.poll, &self.by_path, &self.iqn).await
    }
}
