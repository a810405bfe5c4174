//! Storage Management Agent client.
//!
//! A volume is exposed by creating a device on the agent and attaching the
//! volume to it. The device handle is the only state; it is persisted by
//! the caller through [`Accelerator::handles`].

use async_trait::async_trait;
use tonic::transport::Channel;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::context_field;
use super::pci::PciFunction;
use super::xpu::{Accelerator, XpuTransport};
use crate::context::ContextMap;
use crate::error::{CsiError, Result};
use crate::sma::storage_management_agent_client::StorageManagementAgentClient;
use crate::sma::{
    AttachVolumeRequest, CreateDeviceRequest, DeleteDeviceRequest, DetachVolumeRequest,
    NvmeDeviceParameters, NvmfAddress, NvmfTcpDeviceParameters, NvmfVolumeConnectionParameters,
    NvmfVolumeDiscoveryParameters, VolumeParameters, create_device_request,
    nvmf_volume_connection_parameters, volume_parameters,
};
use crate::undo::UndoStack;

/// Local NVMe/TCP listener the agent exposes for `nvmftcp` devices
pub const LOCAL_NVMF_ADDR: &str = "127.0.0.1";
pub const LOCAL_NVMF_PORT: &str = "4421";
pub const LOCAL_NVMF_NQN_PREFIX: &str = "nqn.2022-04.io.spdk.csi:cnode0:uuid:";

const DEVICE_HANDLE: &str = "deviceHandle";

pub struct SmaAccelerator {
    client: StorageManagementAgentClient<Channel>,
    transport: XpuTransport,
    model: String,
    /// Volume UUID in binary form
    volume_id: Vec<u8>,
    nqn: String,
    discovery: NvmfAddress,
    device_handle: String,
}

impl SmaAccelerator {
    pub fn new(
        channel: Channel,
        transport: XpuTransport,
        context: &ContextMap,
        stored: &ContextMap,
    ) -> Result<Self> {
        let model = context_field(context, "model")?;
        let volume_id = Uuid::parse_str(model)
            .map_err(|e| CsiError::InvalidArgument(format!("volume model '{}' is not a UUID: {}", model, e)))?
            .as_bytes()
            .to_vec();
        Ok(Self {
            client: StorageManagementAgentClient::new(channel),
            transport,
            model: model.to_string(),
            volume_id,
            nqn: context.get("nqn").cloned().unwrap_or_default(),
            discovery: NvmfAddress {
                trtype: context.get("targetType").cloned().unwrap_or_default(),
                traddr: context.get("targetAddr").cloned().unwrap_or_default(),
                trsvcid: context.get("targetPort").cloned().unwrap_or_default(),
            },
            device_handle: stored.get(DEVICE_HANDLE).cloned().unwrap_or_default(),
        })
    }

    fn device_params(&self, function: Option<PciFunction>) -> Result<create_device_request::Params> {
        match (self.transport, function) {
            (XpuTransport::NvmfTcp, _) => Ok(create_device_request::Params::NvmfTcp(
                NvmfTcpDeviceParameters {
                    subnqn: format!("{}{}", LOCAL_NVMF_NQN_PREFIX, self.model),
                    adrfam: "ipv4".into(),
                    traddr: LOCAL_NVMF_ADDR.into(),
                    trsvcid: LOCAL_NVMF_PORT.into(),
                    allow_any_host: true,
                    hosts: Vec::new(),
                },
            )),
            (XpuTransport::Nvme, Some(function)) => {
                Ok(create_device_request::Params::Nvme(NvmeDeviceParameters {
                    physical_id: function.physical_id(),
                    virtual_id: 0,
                }))
            }
            (XpuTransport::Nvme, None) => Err(CsiError::Internal(
                "nvme device needs a PCI function".into(),
            )),
            (XpuTransport::VirtioBlk, _) => Err(CsiError::Config(
                "SMA does not support virtio-blk devices".into(),
            )),
        }
    }

    fn volume_params(&self) -> VolumeParameters {
        VolumeParameters {
            volume_id: self.volume_id.clone(),
            connection_params: Some(volume_parameters::ConnectionParams::Nvmf(
                NvmfVolumeConnectionParameters {
                    subnqn: self.nqn.clone(),
                    hostnqn: String::new(),
                    params: Some(nvmf_volume_connection_parameters::Params::Discovery(
                        NvmfVolumeDiscoveryParameters {
                            discovery_endpoints: vec![self.discovery.clone()],
                        },
                    )),
                },
            )),
        }
    }
}

#[async_trait]
impl Accelerator for SmaAccelerator {
    async fn attach(&mut self, function: Option<PciFunction>) -> Result<()> {
        let params = self.device_params(function)?;
        info!(model = %self.model, transport = ?self.transport, "SMA CreateDevice");
        let handle = self
            .client
            .create_device(CreateDeviceRequest {
                volume: None,
                params: Some(params),
            })
            .await?
            .into_inner()
            .handle;
        if handle.is_empty() {
            return Err(CsiError::Backend("SMA CreateDevice returned no device handle".into()));
        }

        let mut undo = UndoStack::new();
        let mut client = self.client.clone();
        let created = handle.clone();
        undo.push(format!("delete device {}", created), move || async move {
            client
                .delete_device(DeleteDeviceRequest { handle: created })
                .await?;
            Ok(())
        });

        info!(model = %self.model, device_handle = %handle, "SMA AttachVolume");
        let attached = self
            .client
            .attach_volume(AttachVolumeRequest {
                volume: Some(self.volume_params()),
                device_handle: handle.clone(),
            })
            .await;
        if let Err(status) = attached {
            undo.unwind().await;
            return Err(status.into());
        }
        undo.commit();
        self.device_handle = handle;
        Ok(())
    }

    async fn detach(&mut self) -> Result<()> {
        if self.device_handle.is_empty() {
            debug!(model = %self.model, "No SMA device recorded, nothing to detach");
            return Ok(());
        }
        let handle = self.device_handle.clone();

        info!(model = %self.model, device_handle = %handle, "SMA DetachVolume");
        if let Err(status) = self
            .client
            .detach_volume(DetachVolumeRequest {
                volume_id: self.volume_id.clone(),
                device_handle: handle.clone(),
            })
            .await
        {
            // Deleting the device drops any volume still attached to it
            warn!(device_handle = %handle, error = %status, "SMA DetachVolume failed");
        }

        info!(device_handle = %handle, "SMA DeleteDevice");
        match self
            .client
            .delete_device(DeleteDeviceRequest { handle: handle.clone() })
            .await
        {
            Ok(_) => {}
            Err(status) if status.code() == tonic::Code::NotFound => {
                debug!(device_handle = %handle, "SMA device already gone");
            }
            Err(status) => return Err(status.into()),
        }
        self.device_handle.clear();
        Ok(())
    }

    fn handles(&self) -> ContextMap {
        let mut handles = ContextMap::new();
        handles.insert(DEVICE_HANDLE.to_string(), self.device_handle.clone());
        handles
    }
}
