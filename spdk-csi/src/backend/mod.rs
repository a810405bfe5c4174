//! Storage backends.
//!
//! A [`Backend`] manages logical volumes on one storage endpoint and exports
//! them to initiators. The management API is chosen per endpoint from its
//! configured [`BackendKind`]: classic SPDK JSON-RPC ([`SpdkBackend`]) or the
//! cluster REST API ([`RestBackend`]).

pub mod client;
pub mod rest;
pub mod spdk;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::{BackendKind, EndpointConfig, RpcToken};
use crate::context::ContextMap;
use crate::error::Result;

pub use client::{JsonRpcClient, RestCaller, RestClient, RpcCaller};
pub use rest::RestBackend;
pub use spdk::SpdkBackend;

pub const MIB: u64 = 1024 * 1024;

/// Logical volume store (pool) with capacity in MiB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LvStore {
    pub name: String,
    pub uuid: String,
    pub total_size_mib: u64,
    pub free_size_mib: u64,
}

/// Wire shape of an lvstore, shared by `bdev_lvol_get_lvstores` and
/// `csi/get_pools`.
#[derive(Debug, Deserialize)]
pub(crate) struct RawLvStore {
    pub name: String,
    pub uuid: String,
    pub free_clusters: u64,
    pub cluster_size: u64,
    pub total_data_clusters: u64,
}

impl From<RawLvStore> for LvStore {
    fn from(raw: RawLvStore) -> Self {
        Self {
            total_size_mib: raw.total_data_clusters * raw.cluster_size / MIB,
            free_size_mib: raw.free_clusters * raw.cluster_size / MIB,
            name: raw.name,
            uuid: raw.uuid,
        }
    }
}

/// Volume attributes and the connection metadata a node needs to attach
/// it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub uuid: String,
    pub name: String,
    pub lvs_name: String,
    pub size_bytes: u64,
    /// targetType, targetAddr, targetPort, nqn or iqn, model
    pub connection: ContextMap,
}

impl VolumeInfo {
    /// Flattened volume context handed to the node plugin.
    pub fn to_context(&self) -> ContextMap {
        let mut context = self.connection.clone();
        context.insert("name".to_string(), self.name.clone());
        context.insert("uuid".to_string(), self.uuid.clone());
        context.insert("pool_id".to_string(), self.lvs_name.clone());
        context.insert("lvolSize".to_string(), self.size_bytes.to_string());
        context
            .entry("model".to_string())
            .or_insert_with(|| self.uuid.clone());
        context
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub uuid: String,
    pub name: String,
    pub lvs_name: String,
    /// lvol ID of the source volume, empty when unknown
    pub source_uuid: String,
    pub size_bytes: u64,
    /// Seconds since the epoch, when the backend records it
    pub created_at: Option<i64>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Management URL, for logging.
    fn info(&self) -> &str;

    async fn lvstores(&self) -> Result<Vec<LvStore>>;

    /// Resolve `lvs_name/lvol_name` to an lvol ID.
    async fn find_volume(&self, lvs_name: &str, lvol_name: &str) -> Result<Option<String>>;

    async fn create_volume(&self, lvs_name: &str, lvol_name: &str, size_mib: u64) -> Result<String>;

    async fn clone_snapshot(&self, snapshot_id: &str, clone_name: &str) -> Result<String>;

    async fn resize_volume(&self, lvol_id: &str, size_mib: u64) -> Result<()>;

    async fn volume_info(&self, lvol_id: &str) -> Result<VolumeInfo>;

    async fn delete_volume(&self, lvol_id: &str) -> Result<()>;

    /// Export the volume. Already exported is success; a missing volume is
    /// `NotFound`.
    async fn publish_volume(&self, lvol_id: &str) -> Result<()>;

    /// Withdraw the export. Nothing exported is `NotPublished`; a missing
    /// volume is `NotFound`.
    async fn unpublish_volume(&self, lvol_id: &str) -> Result<()>;

    /// Whether anything of the export is left; DeleteVolume only unpublishes
    /// when this holds.
    async fn is_published(&self, lvol_id: &str) -> Result<bool>;

    async fn create_snapshot(&self, lvol_id: &str, snapshot_name: &str) -> Result<String>;

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()>;

    async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>>;

    /// Snapshot named `snapshot_name` in `lvs_name`, if any.
    async fn find_snapshot(&self, lvs_name: &str, snapshot_name: &str) -> Result<Option<SnapshotInfo>> {
        Ok(self
            .list_snapshots()
            .await?
            .into_iter()
            .find(|s| s.name == snapshot_name && s.lvs_name == lvs_name))
    }
}

/// Build the backend for one configured endpoint.
pub fn connect(endpoint: &EndpointConfig, token: &RpcToken) -> Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match endpoint.backend {
        BackendKind::JsonRpc => {
            let client = JsonRpcClient::new(
                &endpoint.name,
                &endpoint.rpc_url,
                &token.username,
                &token.password,
            )?;
            Arc::new(SpdkBackend::new(
                Arc::new(client),
                &endpoint.rpc_url,
                &endpoint.target_type,
                &endpoint.target_addr,
            )?)
        }
        BackendKind::Rest => {
            let client = RestClient::new(
                &endpoint.name,
                &endpoint.rpc_url,
                &token.username,
                &token.password,
            )?;
            Arc::new(RestBackend::new(Arc::new(client)))
        }
    };
    Ok(backend)
}
