//! Classic SPDK backend: lvol management over JSON-RPC, exports through a
//! [`TargetEngine`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::client::{call_typed, is_invalid_parameters};
use super::{Backend, LvStore, RawLvStore, RpcCaller, SnapshotInfo, VolumeInfo};
use crate::error::{CsiError, Result};
use crate::target::{TargetEngine, engine_for};

const CLEAR_METHOD: &str = "unmap";
const THIN_PROVISION: bool = true;

#[derive(Debug, Default, Deserialize)]
struct LvolDetails {
    #[serde(default)]
    lvol_store_uuid: String,
    #[serde(default)]
    snapshot: bool,
    #[serde(default)]
    clones: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DriverSpecific {
    #[serde(default)]
    lvol: Option<LvolDetails>,
}

#[derive(Debug, Deserialize)]
struct Bdev {
    name: String,
    uuid: String,
    block_size: u64,
    num_blocks: u64,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    driver_specific: Option<DriverSpecific>,
}

impl Bdev {
    fn lvol(&self) -> Option<&LvolDetails> {
        self.driver_specific.as_ref().and_then(|d| d.lvol.as_ref())
    }

    /// Lvol name without the lvstore prefix of its `lvs/name` alias.
    fn lvol_name(&self) -> &str {
        self.aliases
            .first()
            .and_then(|alias| alias.split_once('/'))
            .map(|(_, name)| name)
            .unwrap_or(&self.name)
    }

    fn size_bytes(&self) -> u64 {
        self.block_size * self.num_blocks
    }
}

pub struct SpdkBackend {
    url: String,
    rpc: Arc<dyn RpcCaller>,
    engine: Box<dyn TargetEngine>,
}

impl SpdkBackend {
    pub fn new(
        rpc: Arc<dyn RpcCaller>,
        url: &str,
        target_type: &str,
        target_addr: &str,
    ) -> Result<Self> {
        let engine = engine_for(target_type, target_addr, rpc.clone())?;
        Ok(Self {
            url: url.to_string(),
            rpc,
            engine,
        })
    }

    /// Bdev by name, UUID or `lvs/lvol` alias. `None` when absent.
    async fn bdev(&self, name: &str) -> Result<Option<Bdev>> {
        let result: Result<Vec<Bdev>> =
            call_typed(self.rpc.as_ref(), "bdev_get_bdevs", json!({ "name": name })).await;
        match result {
            Ok(bdevs) => Ok(bdevs.into_iter().next()),
            Err(e) if e.is_not_found() || is_invalid_parameters(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn require_bdev(&self, lvol_id: &str) -> Result<Bdev> {
        self.bdev(lvol_id)
            .await?
            .ok_or_else(|| CsiError::NotFound(format!("volume {} not found", lvol_id)))
    }

    async fn lvstore_names(&self) -> Result<HashMap<String, String>> {
        Ok(self
            .lvstores()
            .await?
            .into_iter()
            .map(|lvs| (lvs.uuid, lvs.name))
            .collect())
    }

    async fn delete_lvol(&self, lvol_id: &str) -> Result<()> {
        self.rpc
            .call("bdev_lvol_delete", json!({ "name": lvol_id }))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for SpdkBackend {
    fn info(&self) -> &str {
        &self.url
    }

    async fn lvstores(&self) -> Result<Vec<LvStore>> {
        let raw: Vec<RawLvStore> =
            call_typed(self.rpc.as_ref(), "bdev_lvol_get_lvstores", json!(null)).await?;
        Ok(raw.into_iter().map(LvStore::from).collect())
    }

    async fn find_volume(&self, lvs_name: &str, lvol_name: &str) -> Result<Option<String>> {
        let alias = format!("{}/{}", lvs_name, lvol_name);
        Ok(self.bdev(&alias).await?.map(|bdev| bdev.uuid))
    }

    async fn create_volume(&self, lvs_name: &str, lvol_name: &str, size_mib: u64) -> Result<String> {
        let lvol_id: String = call_typed(
            self.rpc.as_ref(),
            "bdev_lvol_create",
            json!({
                "lvol_name": lvol_name,
                "size_in_mib": size_mib,
                "lvs_name": lvs_name,
                "clear_method": CLEAR_METHOD,
                "thin_provision": THIN_PROVISION,
            }),
        )
        .await?;
        info!(lvs_name, lvol_name, lvol_id = %lvol_id, size_mib, "Created lvol");
        Ok(lvol_id)
    }

    async fn clone_snapshot(&self, snapshot_id: &str, clone_name: &str) -> Result<String> {
        let lvol_id: String = call_typed(
            self.rpc.as_ref(),
            "bdev_lvol_clone",
            json!({ "snapshot_name": snapshot_id, "clone_name": clone_name }),
        )
        .await?;
        info!(snapshot_id, clone_name, lvol_id = %lvol_id, "Cloned snapshot");
        Ok(lvol_id)
    }

    async fn resize_volume(&self, lvol_id: &str, size_mib: u64) -> Result<()> {
        self.require_bdev(lvol_id).await?;
        self.rpc
            .call(
                "bdev_lvol_resize",
                json!({ "name": lvol_id, "size_in_mib": size_mib }),
            )
            .await?;
        info!(lvol_id, size_mib, "Resized lvol");
        Ok(())
    }

    async fn volume_info(&self, lvol_id: &str) -> Result<VolumeInfo> {
        let bdev = self.require_bdev(lvol_id).await?;
        let lvs_uuid = bdev.lvol().map(|l| l.lvol_store_uuid.clone()).unwrap_or_default();
        let lvs_name = self
            .lvstore_names()
            .await?
            .remove(&lvs_uuid)
            .ok_or_else(|| CsiError::Backend(format!("lvstore for {} not found", lvol_id)))?;

        Ok(VolumeInfo {
            name: bdev.lvol_name().to_string(),
            size_bytes: bdev.size_bytes(),
            connection: self.engine.connection(&bdev.uuid),
            uuid: bdev.uuid,
            lvs_name,
        })
    }

    async fn delete_volume(&self, lvol_id: &str) -> Result<()> {
        self.delete_lvol(lvol_id).await?;
        info!(lvol_id, "Deleted lvol");
        Ok(())
    }

    async fn publish_volume(&self, lvol_id: &str) -> Result<()> {
        self.require_bdev(lvol_id).await?;
        self.engine.publish(lvol_id).await
    }

    async fn unpublish_volume(&self, lvol_id: &str) -> Result<()> {
        self.require_bdev(lvol_id).await?;
        if !self.engine.unpublish(lvol_id).await? {
            return Err(CsiError::NotPublished(lvol_id.to_string()));
        }
        Ok(())
    }

    async fn is_published(&self, lvol_id: &str) -> Result<bool> {
        self.engine.is_published(lvol_id).await
    }

    async fn create_snapshot(&self, lvol_id: &str, snapshot_name: &str) -> Result<String> {
        let snapshot_id: String = call_typed(
            self.rpc.as_ref(),
            "bdev_lvol_snapshot",
            json!({ "lvol_name": lvol_id, "snapshot_name": snapshot_name }),
        )
        .await?;
        info!(lvol_id, snapshot_name, snapshot_id = %snapshot_id, "Created snapshot");
        Ok(snapshot_id)
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.delete_lvol(snapshot_id).await?;
        info!(snapshot_id, "Deleted snapshot");
        Ok(())
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        let bdevs: Vec<Bdev> =
            call_typed(self.rpc.as_ref(), "bdev_get_bdevs", json!(null)).await?;
        let lvs_names = self.lvstore_names().await?;

        // Snapshot clones are listed by lvol name; map them back to IDs.
        let ids_by_alias: HashMap<&str, &str> = bdevs
            .iter()
            .flat_map(|b| b.aliases.iter().map(move |a| (a.as_str(), b.uuid.as_str())))
            .collect();

        let mut snapshots = Vec::new();
        for bdev in &bdevs {
            let Some(lvol) = bdev.lvol() else { continue };
            if !lvol.snapshot {
                continue;
            }
            let lvs_name = lvs_names
                .get(&lvol.lvol_store_uuid)
                .cloned()
                .unwrap_or_default();
            let source_uuid = lvol
                .clones
                .first()
                .and_then(|clone| ids_by_alias.get(format!("{}/{}", lvs_name, clone).as_str()))
                .map(|id| id.to_string())
                .unwrap_or_default();
            snapshots.push(SnapshotInfo {
                uuid: bdev.uuid.clone(),
                name: bdev.lvol_name().to_string(),
                lvs_name,
                source_uuid,
                size_bytes: bdev.size_bytes(),
                created_at: None,
            });
        }
        debug!(count = snapshots.len(), "Listed snapshots");
        Ok(snapshots)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! SPDK lvol store on top of the in-memory target fake.

    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use crate::backend::RpcCaller;
    use crate::backend::client::classify;
    use crate::error::Result;
    use crate::target::testing::FakeSpdk;

    pub const LVS_UUID: &str = "lvs-uuid-0";
    const CLUSTER: u64 = 4 * 1024 * 1024;

    #[derive(Clone)]
    pub struct FakeLvol {
        pub name: String,
        pub size_mib: u64,
        pub snapshot: bool,
        pub clones: Vec<String>,
    }

    pub struct FakeLvolStore {
        pub target: FakeSpdk,
        pub lvols: Mutex<BTreeMap<String, FakeLvol>>,
        pub total_clusters: u64,
        next: Mutex<u32>,
    }

    impl FakeLvolStore {
        pub fn new(total_mib: u64) -> Self {
            Self {
                target: FakeSpdk::default(),
                lvols: Mutex::new(BTreeMap::new()),
                total_clusters: total_mib * 1024 * 1024 / CLUSTER,
                next: Mutex::new(0),
            }
        }

        fn bdev_json(uuid: &str, lvol: &FakeLvol) -> Value {
            json!({
                "name": uuid,
                "uuid": uuid,
                "block_size": 512,
                "num_blocks": lvol.size_mib * 2048,
                "aliases": [format!("lvs0/{}", lvol.name)],
                "driver_specific": { "lvol": {
                    "lvol_store_uuid": LVS_UUID,
                    "snapshot": lvol.snapshot,
                    "clones": lvol.clones,
                }},
            })
        }

        fn new_id(&self) -> String {
            let mut next = self.next.lock().unwrap();
            *next += 1;
            format!("lvol-{:04}", *next)
        }

        fn lookup(lvols: &BTreeMap<String, FakeLvol>, name: &str) -> Option<String> {
            if lvols.contains_key(name) {
                return Some(name.to_string());
            }
            let bare = name.strip_prefix("lvs0/")?;
            lvols
                .iter()
                .find(|(_, l)| l.name == bare)
                .map(|(id, _)| id.clone())
        }
    }

    #[async_trait]
    impl RpcCaller for FakeLvolStore {
        async fn call(&self, method: &str, params: Value) -> Result<Value> {
            let str_param = |key: &str| params[key].as_str().unwrap_or_default().to_string();
            match method {
                "bdev_lvol_get_lvstores" => {
                    let lvols = self.lvols.lock().unwrap();
                    let used: u64 = lvols.values().map(|l| l.size_mib * 1024 * 1024 / CLUSTER).sum();
                    Ok(json!([{
                        "name": "lvs0",
                        "uuid": LVS_UUID,
                        "cluster_size": CLUSTER,
                        "total_data_clusters": self.total_clusters,
                        "free_clusters": self.total_clusters.saturating_sub(used),
                    }]))
                }
                "bdev_get_bdevs" => {
                    let lvols = self.lvols.lock().unwrap();
                    if params.is_null() {
                        return Ok(Value::Array(
                            lvols.iter().map(|(id, l)| Self::bdev_json(id, l)).collect(),
                        ));
                    }
                    match Self::lookup(&lvols, &str_param("name")) {
                        Some(id) => Ok(json!([Self::bdev_json(&id, &lvols[&id])])),
                        None => Err(classify("No such device")),
                    }
                }
                "bdev_lvol_create" => {
                    let id = self.new_id();
                    let lvol = FakeLvol {
                        name: str_param("lvol_name"),
                        size_mib: params["size_in_mib"].as_u64().unwrap_or_default(),
                        snapshot: false,
                        clones: Vec::new(),
                    };
                    self.lvols.lock().unwrap().insert(id.clone(), lvol);
                    Ok(json!(id))
                }
                "bdev_lvol_snapshot" => {
                    let mut lvols = self.lvols.lock().unwrap();
                    let Some(source) = Self::lookup(&lvols, &str_param("lvol_name")) else {
                        return Err(classify("No such device"));
                    };
                    let id = self.new_id();
                    let snapshot = FakeLvol {
                        name: str_param("snapshot_name"),
                        size_mib: lvols[&source].size_mib,
                        snapshot: true,
                        clones: vec![lvols[&source].name.clone()],
                    };
                    lvols.insert(id.clone(), snapshot);
                    Ok(json!(id))
                }
                "bdev_lvol_clone" => {
                    let mut lvols = self.lvols.lock().unwrap();
                    let Some(snapshot) = Self::lookup(&lvols, &str_param("snapshot_name")) else {
                        return Err(classify("No such device"));
                    };
                    let id = self.new_id();
                    let clone = FakeLvol {
                        name: str_param("clone_name"),
                        size_mib: lvols[&snapshot].size_mib,
                        snapshot: false,
                        clones: Vec::new(),
                    };
                    lvols.insert(id.clone(), clone);
                    Ok(json!(id))
                }
                "bdev_lvol_resize" => {
                    let mut lvols = self.lvols.lock().unwrap();
                    match lvols.get_mut(&str_param("name")) {
                        Some(lvol) => {
                            lvol.size_mib = params["size_in_mib"].as_u64().unwrap_or_default();
                            Ok(Value::Bool(true))
                        }
                        None => Err(classify("No such device")),
                    }
                }
                "bdev_lvol_delete" => match self.lvols.lock().unwrap().remove(&str_param("name")) {
                    Some(_) => Ok(Value::Bool(true)),
                    None => Err(classify("No such device")),
                },
                _ => self.target.call(method, params).await,
            }
        }
    }
}
