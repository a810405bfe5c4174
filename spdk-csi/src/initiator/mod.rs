//! Initiators: attach a published volume to this host as a block device.
//!
//! The host path logs in with `nvme-cli` or `iscsiadm`. When the node
//! config lists an accelerator, volumes are attached through it instead
//! (see [`xpu`]).

pub mod host;
pub mod opi;
pub mod pci;
pub mod sma;
pub mod xpu;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::NodeConfig;
use crate::context::ContextMap;
use crate::error::{CsiError, Result};
use crate::platform::{CommandRunner, HostPaths, PollConfig};

pub use host::{IscsiInitiator, NvmfInitiator};
pub use xpu::{XpuInitiator, XpuTargetType};

/// Deadline for each accelerator RPC
pub const XPU_TIMEOUT: Duration = Duration::from_secs(60);

/// Attach or detach one volume. Both directions tolerate repeats.
#[async_trait]
pub trait Initiator: Send {
    /// Connect and return the local block device path.
    async fn connect(&mut self) -> Result<String>;

    async fn disconnect(&mut self) -> Result<()>;
}

/// Host facilities shared by all initiators of one node plugin.
#[derive(Clone)]
pub struct NodeEnv {
    pub runner: Arc<dyn CommandRunner>,
    pub paths: HostPaths,
    pub poll: PollConfig,
    /// Serializes PCI function scan-and-claim across concurrent stages
    pub pci_lock: Arc<Mutex<()>>,
    pub node_config: NodeConfig,
    pub xpu_timeout: Duration,
}

impl NodeEnv {
    pub fn new(runner: Arc<dyn CommandRunner>, node_config: NodeConfig) -> Self {
        Self {
            runner,
            paths: HostPaths::default(),
            poll: PollConfig::default(),
            pci_lock: Arc::new(Mutex::new(())),
            node_config,
            xpu_timeout: XPU_TIMEOUT,
        }
    }
}

/// Required entry of a volume context.
pub(crate) fn context_field<'a>(context: &'a ContextMap, key: &str) -> Result<&'a str> {
    context
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CsiError::InvalidArgument(format!("volume context has no '{}'", key)))
}

/// Initiator for a volume context: the first configured accelerator if
/// any, otherwise the host initiator matching `targetType`.
pub fn initiator_for(env: &NodeEnv, context: &ContextMap) -> Result<Box<dyn Initiator>> {
    if let Some(xpu) = env.node_config.xpu_list.first() {
        return Ok(Box::new(XpuInitiator::new(env.clone(), xpu, context)?));
    }

    let target_type = context_field(context, "targetType")?.to_lowercase();
    match target_type.as_str() {
        "tcp" | "rdma" => Ok(Box::new(NvmfInitiator::from_context(env, context)?)),
        "iscsi" => Ok(Box::new(IscsiInitiator::from_context(env, context)?)),
        other => Err(CsiError::InvalidArgument(format!("unknown initiator: {}", other))),
    }
}
