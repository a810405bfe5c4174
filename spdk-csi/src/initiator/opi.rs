//! OPI storage client.
//!
//! The accelerator connects to the storage target itself (remote controller
//! and path) and exposes the volume to the host as an NVMe namespace or a
//! virtio-blk device on a PCI function. Every created object is named
//! `opi-spdkcsi-{model}`; deletes pass `allow_missing` so repeats succeed.

use async_trait::async_trait;
use tonic::transport::Channel;
use tracing::{debug, info};

use super::context_field;
use super::pci::PciFunction;
use super::xpu::{Accelerator, XpuTransport};
use crate::context::ContextMap;
use crate::error::{CsiError, Result};
use crate::opi::frontend_nvme_service_client::FrontendNvmeServiceClient;
use crate::opi::frontend_virtio_blk_service_client::FrontendVirtioBlkServiceClient;
use crate::opi::nvme_remote_controller_service_client::NvmeRemoteControllerServiceClient;
use crate::opi::{
    CreateNvmeControllerRequest, CreateNvmeNamespaceRequest, CreateNvmePathRequest,
    CreateNvmeRemoteControllerRequest, CreateNvmeSubsystemRequest, CreateVirtioBlkRequest,
    DeleteNvmeControllerRequest, DeleteNvmeNamespaceRequest, DeleteNvmePathRequest,
    DeleteNvmeRemoteControllerRequest, DeleteNvmeSubsystemRequest, DeleteVirtioBlkRequest,
    NvmeAddressFamily, NvmeController, NvmeControllerSpec, NvmeMultipath, NvmeNamespace,
    NvmeNamespaceSpec, NvmePath, NvmeRemoteController, NvmeSubsystem, NvmeSubsystemSpec,
    NvmeTransportType, PciEndpoint, VirtioBlk,
};
use crate::undo::UndoStack;

pub const OBJECT_PREFIX: &str = "opi-spdkcsi-";
pub const SUBSYSTEM_NQN_PREFIX: &str = "nqn.2016-06.io.spdk.csi:subsystem:uuid:";
pub const HOST_NQN_PREFIX: &str = "nqn.2023-04.io.spdk.csi:remote.controller:uuid:";

/// Names of the objects created on the accelerator, empty when absent.
#[derive(Debug, Default, Clone)]
struct Objects {
    remote_controller: String,
    path: String,
    subsystem: String,
    controller: String,
    namespace: String,
    virtio_blk: String,
}

const REMOTE_CONTROLLER: &str = "nvmfRemoteControllerName";
const PATH: &str = "nvmfPathName";
const SUBSYSTEM: &str = "subsystemName";
const CONTROLLER: &str = "nvmeControllerName";
const NAMESPACE: &str = "namespaceName";
const VIRTIO_BLK: &str = "virtioBlkName";

impl Objects {
    fn from_stored(stored: &ContextMap) -> Self {
        let get = |key: &str| stored.get(key).cloned().unwrap_or_default();
        Self {
            remote_controller: get(REMOTE_CONTROLLER),
            path: get(PATH),
            subsystem: get(SUBSYSTEM),
            controller: get(CONTROLLER),
            namespace: get(NAMESPACE),
            virtio_blk: get(VIRTIO_BLK),
        }
    }
}

pub struct OpiAccelerator {
    nvme: FrontendNvmeServiceClient<Channel>,
    virtio: FrontendVirtioBlkServiceClient<Channel>,
    remote: NvmeRemoteControllerServiceClient<Channel>,
    transport: XpuTransport,
    model: String,
    nqn: String,
    target_addr: String,
    target_port: i64,
    objects: Objects,
}

impl OpiAccelerator {
    pub fn new(
        channel: Channel,
        transport: XpuTransport,
        context: &ContextMap,
        stored: &ContextMap,
    ) -> Result<Self> {
        if transport == XpuTransport::NvmfTcp {
            return Err(CsiError::Config("OPI does not support nvmftcp devices".into()));
        }
        let port = context_field(context, "targetPort")?;
        let target_port = port
            .parse()
            .map_err(|_| CsiError::InvalidArgument(format!("invalid targetPort '{}'", port)))?;
        Ok(Self {
            nvme: FrontendNvmeServiceClient::new(channel.clone()),
            virtio: FrontendVirtioBlkServiceClient::new(channel.clone()),
            remote: NvmeRemoteControllerServiceClient::new(channel),
            transport,
            model: context_field(context, "model")?.to_string(),
            nqn: context_field(context, "nqn")?.to_string(),
            target_addr: context_field(context, "targetAddr")?.to_string(),
            target_port,
            objects: Objects::from_stored(stored),
        })
    }

    fn object_id(&self) -> String {
        format!("{}{}", OBJECT_PREFIX, self.model)
    }

    /// Remote controller and path to the storage target, shared by both
    /// transports.
    async fn connect_remote(&mut self, undo: &mut UndoStack<'_>) -> Result<()> {
        let controller = self
            .remote
            .create_nvme_remote_controller(CreateNvmeRemoteControllerRequest {
                nvme_remote_controller: Some(NvmeRemoteController {
                    name: String::new(),
                    multipath: NvmeMultipath::Multipath as i32,
                }),
                nvme_remote_controller_id: self.object_id(),
            })
            .await?
            .into_inner();
        debug!(name = %controller.name, "OPI remote controller created");
        let mut client = self.remote.clone();
        let name = controller.name.clone();
        undo.push(format!("delete remote controller {}", name), move || async move {
            client
                .delete_nvme_remote_controller(DeleteNvmeRemoteControllerRequest {
                    name,
                    allow_missing: true,
                })
                .await?;
            Ok(())
        });
        self.objects.remote_controller = controller.name;

        let path = self
            .remote
            .create_nvme_path(CreateNvmePathRequest {
                nvme_path: Some(NvmePath {
                    name: String::new(),
                    trtype: NvmeTransportType::Tcp as i32,
                    adrfam: NvmeAddressFamily::Ipv4 as i32,
                    traddr: self.target_addr.clone(),
                    trsvcid: self.target_port,
                    subnqn: self.nqn.clone(),
                    hostnqn: format!("{}{}", HOST_NQN_PREFIX, self.model),
                    controller_name_ref: self.objects.remote_controller.clone(),
                }),
                nvme_path_id: self.object_id(),
            })
            .await?
            .into_inner();
        debug!(name = %path.name, "OPI path created");
        let mut client = self.remote.clone();
        let name = path.name.clone();
        undo.push(format!("delete path {}", name), move || async move {
            client
                .delete_nvme_path(DeleteNvmePathRequest {
                    name,
                    allow_missing: true,
                })
                .await?;
            Ok(())
        });
        self.objects.path = path.name;
        Ok(())
    }

    /// Subsystem, controller on the PCI function, then after the remote
    /// connection a namespace backed by the volume.
    async fn attach_nvme(&mut self, function: PciFunction, undo: &mut UndoStack<'_>) -> Result<()> {
        let subsystem = self
            .nvme
            .create_nvme_subsystem(CreateNvmeSubsystemRequest {
                nvme_subsystem: Some(NvmeSubsystem {
                    name: String::new(),
                    spec: Some(NvmeSubsystemSpec {
                        nqn: format!("{}{}", SUBSYSTEM_NQN_PREFIX, self.model),
                        serial_number: String::new(),
                        model_number: String::new(),
                    }),
                }),
                nvme_subsystem_id: self.object_id(),
            })
            .await?
            .into_inner();
        let mut client = self.nvme.clone();
        let name = subsystem.name.clone();
        undo.push(format!("delete subsystem {}", name), move || async move {
            client
                .delete_nvme_subsystem(DeleteNvmeSubsystemRequest {
                    name,
                    allow_missing: true,
                })
                .await?;
            Ok(())
        });
        self.objects.subsystem = subsystem.name;

        let controller = self
            .nvme
            .create_nvme_controller(CreateNvmeControllerRequest {
                nvme_controller: Some(NvmeController {
                    name: String::new(),
                    spec: Some(NvmeControllerSpec {
                        subsystem_name_ref: self.objects.subsystem.clone(),
                        pcie_id: Some(pci_endpoint(function)),
                    }),
                }),
                nvme_controller_id: self.object_id(),
            })
            .await?
            .into_inner();
        let mut client = self.nvme.clone();
        let name = controller.name.clone();
        undo.push(format!("delete controller {}", name), move || async move {
            client
                .delete_nvme_controller(DeleteNvmeControllerRequest {
                    name,
                    allow_missing: true,
                })
                .await?;
            Ok(())
        });
        self.objects.controller = controller.name;

        self.connect_remote(undo).await?;

        let namespace = self
            .nvme
            .create_nvme_namespace(CreateNvmeNamespaceRequest {
                nvme_namespace: Some(NvmeNamespace {
                    name: String::new(),
                    spec: Some(NvmeNamespaceSpec {
                        subsystem_name_ref: self.objects.subsystem.clone(),
                        // One volume per subsystem
                        host_nsid: 1,
                        volume_name_ref: self.model.clone(),
                    }),
                }),
                nvme_namespace_id: self.object_id(),
            })
            .await?
            .into_inner();
        self.objects.namespace = namespace.name;
        Ok(())
    }

    async fn attach_virtio_blk(&mut self, function: PciFunction, undo: &mut UndoStack<'_>) -> Result<()> {
        self.connect_remote(undo).await?;

        let device = self
            .virtio
            .create_virtio_blk(CreateVirtioBlkRequest {
                virtio_blk: Some(VirtioBlk {
                    name: String::new(),
                    pcie_id: Some(pci_endpoint(function)),
                    volume_name_ref: self.model.clone(),
                }),
                virtio_blk_id: self.object_id(),
            })
            .await?
            .into_inner();
        self.objects.virtio_blk = device.name;
        Ok(())
    }
}

fn pci_endpoint(function: PciFunction) -> PciEndpoint {
    PciEndpoint {
        port_id: 0,
        physical_function: function.physical_id() as i32,
        virtual_function: 0,
    }
}

#[async_trait]
impl Accelerator for OpiAccelerator {
    async fn attach(&mut self, function: Option<PciFunction>) -> Result<()> {
        let function =
            function.ok_or_else(|| CsiError::Internal("OPI devices need a PCI function".into()))?;
        info!(model = %self.model, transport = ?self.transport, bdf = %function.bdf(), "OPI attach");

        let mut undo = UndoStack::new();
        let result = match self.transport {
            XpuTransport::Nvme => self.attach_nvme(function, &mut undo).await,
            _ => self.attach_virtio_blk(function, &mut undo).await,
        };
        match result {
            Ok(()) => {
                undo.commit();
                Ok(())
            }
            Err(e) => {
                if !undo.is_empty() {
                    info!(model = %self.model, steps = undo.len(), "Cleaning up incomplete OPI attach");
                    undo.unwind().await;
                }
                self.objects = Objects::default();
                Err(e)
            }
        }
    }

    /// Deletes in reverse creation order. A failed delete stops the walk so
    /// the remaining names stay recorded for a retry.
    async fn detach(&mut self) -> Result<()> {
        info!(model = %self.model, objects = ?self.objects, "OPI detach");
        if !self.objects.namespace.is_empty() {
            self.nvme
                .delete_nvme_namespace(DeleteNvmeNamespaceRequest {
                    name: self.objects.namespace.clone(),
                    allow_missing: true,
                })
                .await?;
            self.objects.namespace.clear();
        }
        if !self.objects.virtio_blk.is_empty() {
            self.virtio
                .delete_virtio_blk(DeleteVirtioBlkRequest {
                    name: self.objects.virtio_blk.clone(),
                    allow_missing: true,
                })
                .await?;
            self.objects.virtio_blk.clear();
        }
        if !self.objects.path.is_empty() {
            self.remote
                .delete_nvme_path(DeleteNvmePathRequest {
                    name: self.objects.path.clone(),
                    allow_missing: true,
                })
                .await?;
            self.objects.path.clear();
        }
        if !self.objects.remote_controller.is_empty() {
            self.remote
                .delete_nvme_remote_controller(DeleteNvmeRemoteControllerRequest {
                    name: self.objects.remote_controller.clone(),
                    allow_missing: true,
                })
                .await?;
            self.objects.remote_controller.clear();
        }
        if !self.objects.controller.is_empty() {
            self.nvme
                .delete_nvme_controller(DeleteNvmeControllerRequest {
                    name: self.objects.controller.clone(),
                    allow_missing: true,
                })
                .await?;
            self.objects.controller.clear();
        }
        if !self.objects.subsystem.is_empty() {
            self.nvme
                .delete_nvme_subsystem(DeleteNvmeSubsystemRequest {
                    name: self.objects.subsystem.clone(),
                    allow_missing: true,
                })
                .await?;
            self.objects.subsystem.clear();
        }
        Ok(())
    }

    fn handles(&self) -> ContextMap {
        [
            (REMOTE_CONTROLLER, &self.objects.remote_controller),
            (PATH, &self.objects.path),
            (SUBSYSTEM, &self.objects.subsystem),
            (CONTROLLER, &self.objects.controller),
            (NAMESPACE, &self.objects.namespace),
            (VIRTIO_BLK, &self.objects.virtio_blk),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
    }
}
