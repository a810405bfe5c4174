//! Cluster REST backend. The cluster exports volumes itself, so publishing
//! is a single call and connection metadata comes back with the volume.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::client::request_typed;
use super::{Backend, LvStore, MIB, RawLvStore, RestCaller, SnapshotInfo, VolumeInfo};
use crate::context::ContextMap;
use crate::error::{CsiError, Result};

const CLEAR_METHOD: &str = "unmap";
const THIN_PROVISION: bool = true;

#[derive(Debug, Deserialize)]
struct RestVolume {
    name: String,
    uuid: String,
    block_size: u64,
    num_blocks: u64,
    #[serde(default)]
    pool_id: String,
    #[serde(default, rename = "targetType")]
    target_type: String,
    #[serde(default, rename = "targetAddr")]
    target_addr: String,
    #[serde(default, rename = "targetPort")]
    target_port: String,
    #[serde(default)]
    nqn: String,
    #[serde(default)]
    model: String,
}

impl RestVolume {
    fn connection(&self) -> ContextMap {
        let mut ctx = ContextMap::new();
        for (key, value) in [
            ("targetType", &self.target_type),
            ("targetAddr", &self.target_addr),
            ("targetPort", &self.target_port),
            ("nqn", &self.nqn),
            ("model", &self.model),
        ] {
            if !value.is_empty() {
                ctx.insert(key.to_string(), value.clone());
            }
        }
        ctx
    }
}

#[derive(Debug, Deserialize)]
struct RestSnapshot {
    uuid: String,
    name: String,
    #[serde(default)]
    pool_name: String,
    #[serde(default)]
    source_uuid: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    created_at: Option<i64>,
}

pub struct RestBackend {
    client: Arc<dyn RestCaller>,
}

impl RestBackend {
    pub fn new(client: Arc<dyn RestCaller>) -> Self {
        Self { client }
    }

    /// Lookup by ID or by `pool/name`; `None` when absent.
    async fn lookup(&self, key: &str) -> Result<Option<RestVolume>> {
        let path = format!("csi/get_volume_info/{}", key);
        let result: Result<Vec<RestVolume>> =
            request_typed(self.client.as_ref(), Method::GET, &path, None).await;
        match result {
            Ok(volumes) => Ok(volumes.into_iter().next()),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        self.client.request(method, path, body).await
    }
}

#[async_trait]
impl Backend for RestBackend {
    fn info(&self) -> &str {
        self.client.url()
    }

    async fn lvstores(&self) -> Result<Vec<LvStore>> {
        let raw: Vec<RawLvStore> =
            request_typed(self.client.as_ref(), Method::GET, "csi/get_pools", None).await?;
        Ok(raw.into_iter().map(LvStore::from).collect())
    }

    async fn find_volume(&self, lvs_name: &str, lvol_name: &str) -> Result<Option<String>> {
        let alias = format!("{}/{}", lvs_name, lvol_name);
        Ok(self.lookup(&alias).await?.map(|v| v.uuid))
    }

    async fn create_volume(&self, lvs_name: &str, lvol_name: &str, size_mib: u64) -> Result<String> {
        let lvol_id: String = request_typed(
            self.client.as_ref(),
            Method::POST,
            "csi/create_volume",
            Some(json!({
                "lvol_name": lvol_name,
                "size": size_mib * MIB,
                "lvs_name": lvs_name,
                "clear_method": CLEAR_METHOD,
                "thin_provision": THIN_PROVISION,
            })),
        )
        .await?;
        info!(lvs_name, lvol_name, lvol_id = %lvol_id, size_mib, "Created volume");
        Ok(lvol_id)
    }

    async fn clone_snapshot(&self, snapshot_id: &str, clone_name: &str) -> Result<String> {
        request_typed(
            self.client.as_ref(),
            Method::POST,
            "csi/clone_snapshot",
            Some(json!({ "snapshot_id": snapshot_id, "clone_name": clone_name })),
        )
        .await
    }

    async fn resize_volume(&self, lvol_id: &str, size_mib: u64) -> Result<()> {
        self.call(
            Method::POST,
            "csi/resize_volume",
            Some(json!({ "lvol_id": lvol_id, "size": size_mib * MIB })),
        )
        .await?;
        Ok(())
    }

    async fn volume_info(&self, lvol_id: &str) -> Result<VolumeInfo> {
        let volume = self
            .lookup(lvol_id)
            .await?
            .ok_or_else(|| CsiError::NotFound(format!("volume {} not found", lvol_id)))?;
        Ok(VolumeInfo {
            connection: volume.connection(),
            size_bytes: volume.block_size * volume.num_blocks,
            name: volume.name,
            uuid: volume.uuid,
            lvs_name: volume.pool_id,
        })
    }

    async fn delete_volume(&self, lvol_id: &str) -> Result<()> {
        self.call(Method::DELETE, &format!("csi/delete_lvol/{}", lvol_id), None)
            .await?;
        info!(lvol_id, "Deleted volume");
        Ok(())
    }

    async fn publish_volume(&self, lvol_id: &str) -> Result<()> {
        self.call(Method::GET, &format!("csi/publish_volume/{}", lvol_id), None)
            .await?;
        Ok(())
    }

    async fn unpublish_volume(&self, lvol_id: &str) -> Result<()> {
        let result = self
            .call(Method::GET, &format!("csi/unpublish_volume/{}", lvol_id), None)
            .await?;
        if result == Value::Bool(false) {
            return Err(CsiError::NotPublished(lvol_id.to_string()));
        }
        Ok(())
    }

    async fn is_published(&self, lvol_id: &str) -> Result<bool> {
        request_typed(
            self.client.as_ref(),
            Method::GET,
            &format!("csi/is_volume_published/{}", lvol_id),
            None,
        )
        .await
    }

    async fn create_snapshot(&self, lvol_id: &str, snapshot_name: &str) -> Result<String> {
        request_typed(
            self.client.as_ref(),
            Method::POST,
            "csi/create_snapshot",
            Some(json!({ "lvol_id": lvol_id, "snapshot_name": snapshot_name })),
        )
        .await
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.call(
            Method::DELETE,
            &format!("csi/delete_snapshot/{}", snapshot_id),
            None,
        )
        .await?;
        Ok(())
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        let raw: Vec<RestSnapshot> =
            request_typed(self.client.as_ref(), Method::GET, "csi/list_snapshots", None).await?;
        Ok(raw
            .into_iter()
            .map(|s| SnapshotInfo {
                uuid: s.uuid,
                name: s.name,
                lvs_name: s.pool_name,
                source_uuid: s.source_uuid,
                size_bytes: s.size,
                created_at: s.created_at,
            })
            .collect())
    }
}
