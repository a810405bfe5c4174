//! Offload initiator: volumes attached through an accelerator (xPU).
//!
//! The accelerator is driven over SMA or OPI and the volume shows up on the
//! host as a local NVMe/TCP connection, an NVMe namespace or a virtio-blk
//! disk. Accelerator handles and the claimed PCI function are persisted to
//! `xpu-context.json` next to the staging directory so that unstage after a
//! restart releases them.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};
use tracing::{info, warn};

use super::host::NvmfInitiator;
use super::opi::OpiAccelerator;
use super::pci::{self, PciFunction};
use super::sma::{LOCAL_NVMF_ADDR, LOCAL_NVMF_NQN_PREFIX, LOCAL_NVMF_PORT, SmaAccelerator};
use super::{Initiator, NodeEnv, context_field};
use crate::config::XpuConfig;
use crate::context::{self, ContextMap, XPU_CONTEXT_FILE};
use crate::error::{CsiError, Result};
use crate::metrics;

const DEVICE_PATH: &str = "devicePath";
const PF_ID: &str = "pfID";
const VF_ID: &str = "vfID";
const PCI_BDF: &str = "pciBdf";

/// The accelerator side of an offload attachment.
#[async_trait]
pub trait Accelerator: Send + Sync {
    /// Expose the volume; `function` is the claimed PCI function for
    /// transports that need one. Leaves nothing behind on failure.
    async fn attach(&mut self, function: Option<PciFunction>) -> Result<()>;

    /// Release what `attach` created. Missing objects are not an error.
    async fn detach(&mut self) -> Result<()>;

    /// Handles to persist so `detach` works from a fresh process.
    fn handles(&self) -> ContextMap;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XpuFamily {
    Sma,
    Opi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XpuTransport {
    NvmfTcp,
    Nvme,
    VirtioBlk,
}

/// Parsed `xpu-{family}-{transport}` target type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XpuTargetType {
    pub family: XpuFamily,
    pub transport: XpuTransport,
}

impl FromStr for XpuTargetType {
    type Err = CsiError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CsiError::Config(format!("invalid xPU target type '{}'", s));
        let parts: Vec<&str> = s.split('-').collect();
        let [prefix, family, transport] = parts.as_slice() else {
            return Err(invalid());
        };
        if *prefix != "xpu" {
            return Err(invalid());
        }
        let family = match *family {
            "sma" => XpuFamily::Sma,
            "opi" => XpuFamily::Opi,
            _ => return Err(invalid()),
        };
        let transport = match *transport {
            "nvmftcp" => XpuTransport::NvmfTcp,
            "nvme" => XpuTransport::Nvme,
            "virtioblk" => XpuTransport::VirtioBlk,
            _ => return Err(invalid()),
        };
        match (family, transport) {
            (XpuFamily::Sma, XpuTransport::VirtioBlk) | (XpuFamily::Opi, XpuTransport::NvmfTcp) => {
                Err(CsiError::Config(format!("unsupported xPU target type '{}'", s)))
            }
            _ => Ok(Self { family, transport }),
        }
    }
}

/// Lazily connected channel to the accelerator's gRPC service. Every call
/// on it is bounded by `timeout`.
fn channel(addr: &str, timeout: Duration) -> Result<Channel> {
    let uri = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    };
    let endpoint = Endpoint::from_shared(uri)
        .map_err(|e| CsiError::Config(format!("invalid xPU address '{}': {}", addr, e)))?
        .connect_timeout(Duration::from_secs(10))
        .timeout(timeout)
        .tcp_nodelay(true);
    Ok(endpoint.connect_lazy())
}

pub struct XpuInitiator {
    env: NodeEnv,
    target: XpuTargetType,
    model: String,
    state_dir: PathBuf,
    accelerator: Box<dyn Accelerator>,
    device_path: String,
    function: Option<PciFunction>,
}

impl XpuInitiator {
    /// Build from the volume context; state from an earlier connect is
    /// picked up from `xpu-context.json` under `stagingParentPath`.
    pub fn new(env: NodeEnv, xpu: &XpuConfig, context: &ContextMap) -> Result<Self> {
        let target: XpuTargetType = xpu.target_type.parse()?;
        let state_dir = PathBuf::from(context_field(context, "stagingParentPath")?);
        let stored = context::lookup_context(&state_dir, XPU_CONTEXT_FILE)?.unwrap_or_default();

        let channel = channel(&xpu.target_addr, env.xpu_timeout)?;
        let accelerator: Box<dyn Accelerator> = match target.family {
            XpuFamily::Sma => Box::new(SmaAccelerator::new(channel, target.transport, context, &stored)?),
            XpuFamily::Opi => Box::new(OpiAccelerator::new(channel, target.transport, context, &stored)?),
        };

        let function = match (
            stored.get(PF_ID).and_then(|v| v.parse().ok()),
            stored.get(VF_ID).and_then(|v| v.parse().ok()),
        ) {
            (Some(pf), Some(vf)) => Some(PciFunction { pf, vf }),
            _ => None,
        };

        Ok(Self {
            model: context_field(context, "model")?.to_string(),
            device_path: stored.get(DEVICE_PATH).cloned().unwrap_or_default(),
            env,
            target,
            state_dir,
            accelerator,
            function,
        })
    }

    fn local_nvmf(&self) -> NvmfInitiator {
        NvmfInitiator::new(
            &self.env,
            "tcp",
            LOCAL_NVMF_ADDR,
            LOCAL_NVMF_PORT,
            &format!("{}{}", LOCAL_NVMF_NQN_PREFIX, self.model),
            &self.model,
        )
    }

    fn save(&self) -> Result<()> {
        let mut state = self.accelerator.handles();
        state.insert(DEVICE_PATH.into(), self.device_path.clone());
        if let Some(function) = self.function {
            state.insert(PF_ID.into(), function.pf.to_string());
            state.insert(VF_ID.into(), function.vf.to_string());
            state.insert(PCI_BDF.into(), function.bdf());
        }
        context::stash_context(&self.state_dir, XPU_CONTEXT_FILE, &state)
    }

    /// Best-effort undo of a half-finished connect.
    async fn release(&mut self) {
        if let Err(e) = self.accelerator.detach().await {
            warn!(model = %self.model, error = %e, "Failed to release accelerator resources");
        }
        if self.function.take().is_some() {
            metrics::adjust_pci_functions(-1.0);
        }
    }

    async fn connect_nvmf_tcp(&mut self) -> Result<String> {
        self.accelerator.attach(None).await?;
        match self.local_nvmf().connect().await {
            Ok(device) => Ok(device),
            Err(e) => {
                self.release().await;
                Err(e)
            }
        }
    }

    /// Pick a free function and attach the volume to it. Free slots are
    /// read from sysfs, so the node-wide PCI lock stays held until the
    /// claimed slot is listed there.
    async fn claim_function(&mut self) -> Result<PciFunction> {
        let pci_lock = self.env.pci_lock.clone();
        let _claim = pci_lock.lock().await;

        let function = pci::free_function(&self.env.paths, self.env.node_config.kvm_pci_bridges)?;
        info!(
            model = %self.model,
            pf = function.pf,
            vf = function.vf,
            bdf = %function.bdf(),
            "Using next available PCI function"
        );
        self.accelerator.attach(Some(function)).await?;
        self.function = Some(function);
        metrics::adjust_pci_functions(1.0);

        let bdf = function.bdf();
        let slot = self.env.paths.pci_devices().join(&bdf);
        let listed = self
            .env
            .poll
            .until(&format!("PCI function {}", bdf), || slot.exists().then_some(()))
            .await;
        if let Err(e) = listed {
            warn!(model = %self.model, bdf = %bdf, error = %e, "PCI function did not show up");
            self.release().await;
            return Err(e);
        }
        Ok(function)
    }

    async fn connect_pci(&mut self) -> Result<String> {
        let bdf = self.claim_function().await?.bdf();
        let found = match self.target.transport {
            XpuTransport::VirtioBlk => {
                pci::wait_virtio_device(&self.env.paths, &self.env.poll, &bdf).await
            }
            _ => pci::wait_nvme_device(&self.env.paths, &self.env.poll, &self.model, Some(&bdf)).await,
        };
        match found {
            Ok(device) => Ok(device),
            Err(e) => {
                warn!(model = %self.model, bdf = %bdf, error = %e, "Device did not appear");
                self.release().await;
                Err(e)
            }
        }
    }

    async fn connect_nvme(&mut self) -> Result<String> {
        if let Some(name) = pci::find_nvme_device(&self.env.paths, &self.model, None)? {
            let device = self.env.paths.dev.join(&name);
            if device.exists() {
                info!(model = %self.model, device = %device.display(), "Found existing device");
                return Ok(device.to_string_lossy().into_owned());
            }
        }
        self.connect_pci().await
    }
}

#[async_trait]
impl Initiator for XpuInitiator {
    async fn connect(&mut self) -> Result<String> {
        let device = match self.target.transport {
            XpuTransport::NvmfTcp => self.connect_nvmf_tcp().await?,
            XpuTransport::Nvme => self.connect_nvme().await?,
            XpuTransport::VirtioBlk => self.connect_pci().await?,
        };
        self.device_path = device.clone();
        self.save()?;
        info!(model = %self.model, device = %device, target = ?self.target, "xPU volume connected");
        Ok(device)
    }

    async fn disconnect(&mut self) -> Result<()> {
        match self.target.transport {
            XpuTransport::NvmfTcp => {
                if let Err(e) = self.local_nvmf().disconnect().await {
                    warn!(model = %self.model, error = %e, "Local NVMe/TCP disconnect failed");
                }
                self.accelerator.detach().await?;
            }
            XpuTransport::Nvme | XpuTransport::VirtioBlk => {
                let mut device = self.device_path.clone();
                if device.is_empty() && self.target.transport == XpuTransport::Nvme {
                    if let Some(name) = pci::find_nvme_device(&self.env.paths, &self.model, None)? {
                        device = self.env.paths.dev.join(name).to_string_lossy().into_owned();
                    }
                }
                self.accelerator.detach().await?;
                if self.function.take().is_some() {
                    metrics::adjust_pci_functions(-1.0);
                }
                if !device.is_empty() {
                    pci::wait_device_gone(&self.env.poll, &device).await?;
                }
            }
        }
        self.device_path.clear();
        context::cleanup_context(&self.state_dir, XPU_CONTEXT_FILE)?;
        info!(model = %self.model, target = ?self.target, "xPU volume disconnected");
        Ok(())
    }
}
