//! NVMe-oF export of lvol bdevs.
//!
//! One subsystem per volume, named `nqn.2020-04.io.spdk.csi:uuid:{lvol}`,
//! with a single namespace and one listener on the endpoint's target
//! address.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{TargetEngine, UndoStack};
use crate::backend::client::{call_typed, is_invalid_parameters};
use crate::backend::RpcCaller;
use crate::context::ContextMap;
use crate::error::{CsiError, Result};

pub const NQN_PREFIX: &str = "nqn.2020-04.io.spdk.csi:uuid:";
pub const NVMF_PORT: &str = "4420";
const SERIAL_NUMBER: &str = "spdkcsi-sn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmfTransport {
    Tcp,
    Rdma,
}

impl NvmfTransport {
    /// Transport name as SPDK expects it.
    pub fn as_spdk(&self) -> &'static str {
        match self {
            NvmfTransport::Tcp => "TCP",
            NvmfTransport::Rdma => "RDMA",
        }
    }
}

impl fmt::Display for NvmfTransport {
    /// Lower-case form used in volume contexts and by `nvme connect -t`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NvmfTransport::Tcp => write!(f, "tcp"),
            NvmfTransport::Rdma => write!(f, "rdma"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Namespace {
    nsid: u32,
    bdev_name: String,
}

#[derive(Debug, Deserialize)]
struct ListenAddress {
    #[serde(default)]
    traddr: String,
    #[serde(default)]
    trsvcid: String,
}

#[derive(Debug, Deserialize)]
struct Subsystem {
    #[serde(default)]
    namespaces: Vec<Namespace>,
    #[serde(default)]
    listen_addresses: Vec<ListenAddress>,
}

pub struct NvmfTarget {
    rpc: Arc<dyn RpcCaller>,
    transport: NvmfTransport,
    target_addr: String,
}

pub fn nqn_for(lvol_id: &str) -> String {
    format!("{}{}", NQN_PREFIX, lvol_id)
}

impl NvmfTarget {
    pub fn new(rpc: Arc<dyn RpcCaller>, transport: NvmfTransport, target_addr: &str) -> Self {
        Self {
            rpc,
            transport,
            target_addr: target_addr.to_string(),
        }
    }

    /// Current state of the volume's subsystem, `None` if absent.
    async fn subsystem(&self, nqn: &str) -> Result<Option<Subsystem>> {
        let result: Result<Vec<Subsystem>> =
            call_typed(self.rpc.as_ref(), "nvmf_get_subsystems", json!({ "nqn": nqn })).await;
        match result {
            Ok(mut subsystems) => Ok(subsystems.pop()),
            Err(e) if is_invalid_parameters(&e) || e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn ensure_transport(&self) -> Result<()> {
        let params = json!({ "trtype": self.transport.as_spdk() });
        match self.rpc.call("nvmf_create_transport", params).await {
            Ok(_) | Err(CsiError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn has_listener(&self, subsystem: &Subsystem) -> bool {
        subsystem
            .listen_addresses
            .iter()
            .any(|l| l.traddr == self.target_addr && l.trsvcid == NVMF_PORT)
    }

    async fn apply(
        &self,
        lvol_id: &str,
        nqn: &str,
        existing: Option<Subsystem>,
        undo: &mut UndoStack<'_>,
    ) -> Result<()> {
        self.ensure_transport().await?;

        let existing = match existing {
            Some(subsystem) => subsystem,
            None => {
                self.rpc
                    .call(
                        "nvmf_create_subsystem",
                        json!({
                            "nqn": nqn,
                            "serial_number": SERIAL_NUMBER,
                            "allow_any_host": true,
                            "model_number": lvol_id,
                        }),
                    )
                    .await?;
                let rpc = self.rpc.clone();
                let nqn_owned = nqn.to_string();
                undo.push(format!("delete subsystem {}", nqn), move || async move {
                    rpc.call("nvmf_delete_subsystem", json!({ "nqn": nqn_owned }))
                        .await
                        .map(|_| ())
                });
                Subsystem {
                    namespaces: Vec::new(),
                    listen_addresses: Vec::new(),
                }
            }
        };

        if !existing.namespaces.iter().any(|ns| ns.bdev_name == lvol_id) {
            let nsid: u32 = call_typed(
                self.rpc.as_ref(),
                "nvmf_subsystem_add_ns",
                json!({ "nqn": nqn, "namespace": { "bdev_name": lvol_id } }),
            )
            .await?;
            let rpc = self.rpc.clone();
            let nqn_owned = nqn.to_string();
            undo.push(format!("remove namespace {}", nsid), move || async move {
                rpc.call(
                    "nvmf_subsystem_remove_ns",
                    json!({ "nqn": nqn_owned, "nsid": nsid }),
                )
                .await
                .map(|_| ())
            });
        }

        if !self.has_listener(&existing) {
            self.rpc
                .call(
                    "nvmf_subsystem_add_listener",
                    json!({
                        "nqn": nqn,
                        "listen_address": {
                            "trtype": self.transport.as_spdk(),
                            "traddr": self.target_addr,
                            "trsvcid": NVMF_PORT,
                            "adrfam": "IPv4",
                        },
                    }),
                )
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TargetEngine for NvmfTarget {
    async fn publish(&self, lvol_id: &str) -> Result<()> {
        let nqn = nqn_for(lvol_id);
        let existing = self.subsystem(&nqn).await?;
        if let Some(subsystem) = &existing {
            let exported = subsystem.namespaces.iter().any(|ns| ns.bdev_name == lvol_id);
            if exported && self.has_listener(subsystem) {
                debug!(lvol_id, "NVMf subsystem already published");
                return Ok(());
            }
        }

        let mut undo = UndoStack::new();
        match self.apply(lvol_id, &nqn, existing, &mut undo).await {
            Ok(()) => {
                undo.commit();
                info!(lvol_id, nqn = %nqn, "Published volume over NVMf");
                Ok(())
            }
            Err(e) => {
                warn!(lvol_id, error = %e, "NVMf publish failed, rolling back");
                undo.unwind().await;
                Err(e)
            }
        }
    }

    async fn unpublish(&self, lvol_id: &str) -> Result<bool> {
        let nqn = nqn_for(lvol_id);
        let Some(subsystem) = self.subsystem(&nqn).await? else {
            return Ok(false);
        };

        for ns in &subsystem.namespaces {
            // Subsystem deletion below also drops the namespace
            if let Err(e) = self
                .rpc
                .call("nvmf_subsystem_remove_ns", json!({ "nqn": nqn, "nsid": ns.nsid }))
                .await
            {
                warn!(lvol_id, nsid = ns.nsid, error = %e, "Failed to remove namespace");
            }
        }

        match self.rpc.call("nvmf_delete_subsystem", json!({ "nqn": nqn })).await {
            Ok(_) => {}
            Err(e) if is_invalid_parameters(&e) || e.is_not_found() => {
                debug!(lvol_id, "NVMf subsystem vanished during unpublish");
            }
            Err(e) => return Err(e),
        }
        info!(lvol_id, nqn = %nqn, "Unpublished NVMf volume");
        Ok(true)
    }

    async fn is_published(&self, lvol_id: &str) -> Result<bool> {
        Ok(self.subsystem(&nqn_for(lvol_id)).await?.is_some())
    }

    fn connection(&self, lvol_id: &str) -> ContextMap {
        let mut ctx = ContextMap::new();
        ctx.insert("targetType".to_string(), self.transport.to_string());
        ctx.insert("targetAddr".to_string(), self.target_addr.clone());
        ctx.insert("targetPort".to_string(), NVMF_PORT.to_string());
        ctx.insert("nqn".to_string(), nqn_for(lvol_id));
        ctx.insert("model".to_string(), lvol_id.to_string());
        ctx
    }
}
