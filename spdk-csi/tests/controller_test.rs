//! Integration tests for the controller service
//!
//! These tests run ControllerService against in-memory backends that model
//! lvstores with finite space, so placement, idempotency and concurrency
//! can be checked without a storage endpoint.
//! Tests focus on:
//! - Idempotent CreateVolume/DeleteVolume
//! - Concurrent creates, identical and distinct
//! - First-fit placement and rescheduling on full lvstores
//! - Snapshots and clones

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tonic::Request;

use spdk_csi::backend::{Backend, LvStore, SnapshotInfo, VolumeInfo};
use spdk_csi::config::Secrets;
use spdk_csi::context::ContextMap;
use spdk_csi::csi;
use spdk_csi::csi::controller_server::Controller;
use spdk_csi::csi::volume_capability::{AccessMode, AccessType, MountVolume, access_mode::Mode};
use spdk_csi::{BackendProvider, ControllerService, CsiError, Result};

const GIB: i64 = 1024 * 1024 * 1024;

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Debug, Clone)]
struct Lvol {
    lvs: String,
    name: String,
    size_mib: u64,
    snapshot_of: Option<String>,
}

#[derive(Default)]
struct Store {
    /// lvs name -> (total MiB, used MiB)
    pools: Vec<(String, u64, u64)>,
    lvols: HashMap<String, Lvol>,
    published: Vec<String>,
    next_id: usize,
}

impl Store {
    fn allocate(&mut self, lvs: &str, size_mib: u64) -> Result<()> {
        let pool = self
            .pools
            .iter_mut()
            .find(|(name, _, _)| name == lvs)
            .ok_or_else(|| CsiError::NotFound(lvs.to_string()))?;
        if pool.1 - pool.2 < size_mib {
            return Err(CsiError::NoSpace(format!("{} is full", lvs)));
        }
        pool.2 += size_mib;
        Ok(())
    }

    fn insert(&mut self, lvol: Lvol) -> String {
        self.next_id += 1;
        let id = format!("lvol-{}", self.next_id);
        self.lvols.insert(id.clone(), lvol);
        id
    }
}

struct FakeBackend {
    url: String,
    store: Mutex<Store>,
    creates: AtomicUsize,
    /// Report free space but refuse the next create
    refuse_next_create: AtomicBool,
}

impl FakeBackend {
    fn new(url: &str, pools: &[(&str, u64)]) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_string(),
            store: Mutex::new(Store {
                pools: pools.iter().map(|(n, total)| (n.to_string(), *total, 0)).collect(),
                ..Default::default()
            }),
            creates: AtomicUsize::new(0),
            refuse_next_create: AtomicBool::new(false),
        })
    }

    fn free_mib(&self) -> u64 {
        self.store
            .lock()
            .unwrap()
            .pools
            .iter()
            .map(|(_, total, used)| total - used)
            .sum()
    }

    fn volume_count(&self) -> usize {
        self.store
            .lock()
            .unwrap()
            .lvols
            .values()
            .filter(|l| l.snapshot_of.is_none())
            .count()
    }

    fn published(&self) -> Vec<String> {
        self.store.lock().unwrap().published.clone()
    }

    fn lvol(&self, id: &str) -> Result<Lvol> {
        self.store
            .lock()
            .unwrap()
            .lvols
            .get(id)
            .cloned()
            .ok_or_else(|| CsiError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn info(&self) -> &str {
        &self.url
    }

    async fn lvstores(&self) -> Result<Vec<LvStore>> {
        tokio::task::yield_now().await;
        Ok(self
            .store
            .lock()
            .unwrap()
            .pools
            .iter()
            .map(|(name, total, used)| LvStore {
                name: name.clone(),
                uuid: format!("{}-uuid", name),
                total_size_mib: *total,
                free_size_mib: total - used,
            })
            .collect())
    }

    async fn find_volume(&self, lvs_name: &str, lvol_name: &str) -> Result<Option<String>> {
        Ok(self
            .store
            .lock()
            .unwrap()
            .lvols
            .iter()
            .find(|(_, l)| l.lvs == lvs_name && l.name == lvol_name && l.snapshot_of.is_none())
            .map(|(id, _)| id.clone()))
    }

    async fn create_volume(&self, lvs_name: &str, lvol_name: &str, size_mib: u64) -> Result<String> {
        // Give concurrent requests a chance to interleave
        tokio::task::yield_now().await;
        if self.refuse_next_create.swap(false, Ordering::SeqCst) {
            return Err(CsiError::NoSpace(format!("{} is full", lvs_name)));
        }
        let mut store = self.store.lock().unwrap();
        store.allocate(lvs_name, size_mib)?;
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(store.insert(Lvol {
            lvs: lvs_name.to_string(),
            name: lvol_name.to_string(),
            size_mib,
            snapshot_of: None,
        }))
    }

    async fn clone_snapshot(&self, snapshot_id: &str, clone_name: &str) -> Result<String> {
        let snapshot = self.lvol(snapshot_id)?;
        let mut store = self.store.lock().unwrap();
        Ok(store.insert(Lvol {
            lvs: snapshot.lvs,
            name: clone_name.to_string(),
            size_mib: snapshot.size_mib,
            snapshot_of: None,
        }))
    }

    async fn resize_volume(&self, lvol_id: &str, size_mib: u64) -> Result<()> {
        let lvol = self.lvol(lvol_id)?;
        let mut store = self.store.lock().unwrap();
        store.allocate(&lvol.lvs, size_mib.saturating_sub(lvol.size_mib))?;
        if let Some(l) = store.lvols.get_mut(lvol_id) {
            l.size_mib = size_mib;
        }
        Ok(())
    }

    async fn volume_info(&self, lvol_id: &str) -> Result<VolumeInfo> {
        let lvol = self.lvol(lvol_id)?;
        let mut connection = ContextMap::new();
        connection.insert("targetType".into(), "tcp".into());
        connection.insert("targetAddr".into(), "10.0.0.1".into());
        connection.insert("targetPort".into(), "4420".into());
        connection.insert("nqn".into(), format!("nqn.2020-04.io.spdk.csi:uuid:{}", lvol_id));
        Ok(VolumeInfo {
            uuid: lvol_id.to_string(),
            name: lvol.name,
            lvs_name: lvol.lvs,
            size_bytes: lvol.size_mib * 1024 * 1024,
            connection,
        })
    }

    async fn delete_volume(&self, lvol_id: &str) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        let lvol = store
            .lvols
            .remove(lvol_id)
            .ok_or_else(|| CsiError::NotFound(lvol_id.to_string()))?;
        if let Some(pool) = store.pools.iter_mut().find(|(n, _, _)| *n == lvol.lvs) {
            pool.2 -= lvol.size_mib;
        }
        Ok(())
    }

    async fn publish_volume(&self, lvol_id: &str) -> Result<()> {
        self.lvol(lvol_id)?;
        let mut store = self.store.lock().unwrap();
        if !store.published.iter().any(|p| p == lvol_id) {
            store.published.push(lvol_id.to_string());
        }
        Ok(())
    }

    async fn unpublish_volume(&self, lvol_id: &str) -> Result<()> {
        self.lvol(lvol_id)?;
        let mut store = self.store.lock().unwrap();
        match store.published.iter().position(|p| p == lvol_id) {
            Some(index) => {
                store.published.remove(index);
                Ok(())
            }
            None => Err(CsiError::NotPublished(lvol_id.to_string())),
        }
    }

    async fn is_published(&self, lvol_id: &str) -> Result<bool> {
        Ok(self.published().iter().any(|p| p == lvol_id))
    }

    async fn create_snapshot(&self, lvol_id: &str, snapshot_name: &str) -> Result<String> {
        let source = self.lvol(lvol_id)?;
        let mut store = self.store.lock().unwrap();
        Ok(store.insert(Lvol {
            lvs: source.lvs,
            name: snapshot_name.to_string(),
            size_mib: source.size_mib,
            snapshot_of: Some(lvol_id.to_string()),
        }))
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.store
            .lock()
            .unwrap()
            .lvols
            .remove(snapshot_id)
            .map(|_| ())
            .ok_or_else(|| CsiError::NotFound(snapshot_id.to_string()))
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        Ok(self
            .store
            .lock()
            .unwrap()
            .lvols
            .iter()
            .filter_map(|(id, l)| {
                l.snapshot_of.as_ref().map(|source| SnapshotInfo {
                    uuid: id.clone(),
                    name: l.name.clone(),
                    lvs_name: l.lvs.clone(),
                    source_uuid: source.clone(),
                    size_bytes: l.size_mib * 1024 * 1024,
                    created_at: None,
                })
            })
            .collect())
    }
}

/// Endpoints in configured order.
struct Endpoints(Vec<(String, Arc<FakeBackend>)>);

impl BackendProvider for Endpoints {
    fn endpoints(&self) -> Vec<String> {
        self.0.iter().map(|(name, _)| name.clone()).collect()
    }

    fn backend(&self, endpoint: &str, _secrets: Option<&Secrets>) -> Result<Arc<dyn Backend>> {
        self.0
            .iter()
            .find(|(name, _)| name == endpoint)
            .map(|(_, backend)| backend.clone() as Arc<dyn Backend>)
            .ok_or_else(|| CsiError::Internal(format!("unknown storage endpoint '{}'", endpoint)))
    }
}

fn service(endpoints: &[(&str, &Arc<FakeBackend>)]) -> Arc<ControllerService> {
    let endpoints = endpoints
        .iter()
        .map(|(name, backend)| (name.to_string(), Arc::clone(backend)))
        .collect();
    Arc::new(ControllerService::new(Arc::new(Endpoints(endpoints))))
}

fn create_request(name: &str, bytes: i64) -> csi::CreateVolumeRequest {
    csi::CreateVolumeRequest {
        name: name.to_string(),
        capacity_range: Some(csi::CapacityRange {
            required_bytes: bytes,
            limit_bytes: 0,
        }),
        volume_capabilities: vec![csi::VolumeCapability {
            access_type: Some(AccessType::Mount(MountVolume::default())),
            access_mode: Some(AccessMode {
                mode: Mode::SingleNodeWriter as i32,
            }),
        }],
        ..Default::default()
    }
}

async fn create(service: &ControllerService, name: &str, bytes: i64) -> csi::Volume {
    service
        .create_volume(Request::new(create_request(name, bytes)))
        .await
        .unwrap()
        .into_inner()
        .volume
        .unwrap()
}

async fn delete(service: &ControllerService, volume_id: &str) -> std::result::Result<(), tonic::Status> {
    service
        .delete_volume(Request::new(csi::DeleteVolumeRequest {
            volume_id: volume_id.to_string(),
            secrets: HashMap::new(),
        }))
        .await
        .map(|_| ())
}

// ============================================================================
// Volume lifecycle
// ============================================================================

/// Creating the same name twice returns the same volume
#[tokio::test]
async fn test_create_volume_is_idempotent() {
    let backend = FakeBackend::new("http://a", &[("lvs0", 10_240)]);
    let service = service(&[("node-a", &backend)]);

    let first = create(&service, "pvc-1", GIB).await;
    let second = create(&service, "pvc-1", GIB).await;

    assert_eq!(first.volume_id, second.volume_id);
    assert!(first.volume_id.starts_with("node-a:"));
    assert_eq!(first.capacity_bytes, GIB);
    assert_eq!(backend.creates.load(Ordering::SeqCst), 1);
    assert_eq!(backend.published().len(), 1);

    let context = &first.volume_context;
    assert_eq!(context["targetType"], "tcp");
    assert_eq!(context["name"], "pvc-1");
    assert_eq!(context["model"], first.volume_id.split_once(':').unwrap().1);
}

/// Capacity is rounded up to whole MiB
#[tokio::test]
async fn test_create_volume_rounds_capacity() {
    let backend = FakeBackend::new("http://a", &[("lvs0", 10_240)]);
    let service = service(&[("node-a", &backend)]);

    let volume = create(&service, "pvc-odd", 1024 * 1024 + 1).await;
    assert_eq!(volume.capacity_bytes, 2 * 1024 * 1024);
}

/// Deleting twice, or deleting an unknown volume, succeeds
#[tokio::test]
async fn test_delete_volume_is_idempotent() {
    let backend = FakeBackend::new("http://a", &[("lvs0", 10_240)]);
    let service = service(&[("node-a", &backend)]);

    let volume = create(&service, "pvc-1", GIB).await;
    delete(&service, &volume.volume_id).await.unwrap();
    assert_eq!(backend.volume_count(), 0);
    assert!(backend.published().is_empty());
    assert_eq!(backend.free_mib(), 10_240);

    delete(&service, &volume.volume_id).await.unwrap();
    delete(&service, "node-a:never-existed").await.unwrap();
}

/// A volume whose export is already gone is deleted without an unpublish
#[tokio::test]
async fn test_delete_unpublished_volume() {
    let backend = FakeBackend::new("http://a", &[("lvs0", 10_240)]);
    let service = service(&[("node-a", &backend)]);

    let volume = create(&service, "pvc-1", GIB).await;
    let (_, lvol_id) = volume.volume_id.split_once(':').unwrap();
    backend.unpublish_volume(lvol_id).await.unwrap();

    delete(&service, &volume.volume_id).await.unwrap();
    assert_eq!(backend.volume_count(), 0);
    assert_eq!(backend.free_mib(), 10_240);
}

/// IDs this service never minted are internal errors
#[tokio::test]
async fn test_delete_volume_rejects_foreign_ids() {
    let backend = FakeBackend::new("http://a", &[("lvs0", 10_240)]);
    let service = service(&[("node-a", &backend)]);

    let err = delete(&service, "no-separator").await.unwrap_err();
    assert_eq!(err.code(), tonic::Code::Internal);

    let err = delete(&service, "node-z:lvol-1").await.unwrap_err();
    assert_eq!(err.code(), tonic::Code::Internal);
}

/// Concurrent creates of one name collapse into a single volume
#[tokio::test]
async fn test_concurrent_identical_creates() {
    let backend = FakeBackend::new("http://a", &[("lvs0", 102_400)]);
    let service = service(&[("node-a", &backend)]);

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { create(&service, "pvc-shared", GIB).await })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().volume_id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(backend.creates.load(Ordering::SeqCst), 1);
    assert_eq!(backend.volume_count(), 1);
}

/// Concurrent creates of distinct names each get their own volume
#[tokio::test]
async fn test_concurrent_distinct_creates() {
    let backend = FakeBackend::new("http://a", &[("lvs0", 102_400)]);
    let service = service(&[("node-a", &backend)]);
    let before = backend.free_mib();

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let service = service.clone();
            tokio::spawn(async move { create(&service, &format!("pvc-{}", i), GIB).await })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().volume_id);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 20);
    assert_eq!(before - backend.free_mib(), 20 * 1024);
}

// ============================================================================
// Placement
// ============================================================================

/// The first lvstore with more free space than requested wins
#[tokio::test]
async fn test_first_fit_placement() {
    let small = FakeBackend::new("http://a", &[("lvs0", 512)]);
    let large = FakeBackend::new("http://b", &[("lvs0", 1024), ("lvs1", 4096)]);
    let service = service(&[("node-a", &small), ("node-b", &large)]);

    let volume = create(&service, "pvc-1", GIB).await;
    assert!(volume.volume_id.starts_with("node-b:"));
    assert_eq!(volume.volume_context["pool_id"], "lvs1");
    assert_eq!(small.volume_count(), 0);
}

/// A create refused for lack of space is retried on another lvstore
#[tokio::test]
async fn test_full_lvstore_is_rescheduled() {
    let a = FakeBackend::new("http://a", &[("lvs0", 4096)]);
    let b = FakeBackend::new("http://b", &[("lvs0", 4096)]);
    a.refuse_next_create.store(true, Ordering::SeqCst);
    let service = service(&[("node-a", &a), ("node-b", &b)]);

    let volume = create(&service, "pvc-1", GIB).await;
    assert!(volume.volume_id.starts_with("node-b:"));
}

/// No lvstore can hold the volume
#[tokio::test]
async fn test_no_capacity_is_resource_exhausted() {
    let backend = FakeBackend::new("http://a", &[("lvs0", 512)]);
    let service = service(&[("node-a", &backend)]);

    let err = service
        .create_volume(Request::new(create_request("pvc-big", GIB)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::ResourceExhausted);
}

/// GetCapacity sums free space over all endpoints
#[tokio::test]
async fn test_get_capacity() {
    let a = FakeBackend::new("http://a", &[("lvs0", 1024)]);
    let b = FakeBackend::new("http://b", &[("lvs0", 2048), ("lvs1", 1024)]);
    let service = service(&[("node-a", &a), ("node-b", &b)]);

    let capacity = service
        .get_capacity(Request::new(csi::GetCapacityRequest::default()))
        .await
        .unwrap()
        .into_inner()
        .available_capacity;
    assert_eq!(capacity, 4 * GIB);
}

// ============================================================================
// Snapshots
// ============================================================================

/// Snapshot, list, then clone into a larger volume on the same endpoint
#[tokio::test]
async fn test_snapshot_and_clone() {
    let a = FakeBackend::new("http://a", &[("lvs0", 10_240)]);
    let b = FakeBackend::new("http://b", &[("lvs0", 10_240)]);
    let service = service(&[("node-a", &a), ("node-b", &b)]);
    let source = create(&service, "pvc-src", GIB).await;

    let snapshot_request = csi::CreateSnapshotRequest {
        source_volume_id: source.volume_id.clone(),
        name: "snap-1".into(),
        ..Default::default()
    };
    let snapshot = service
        .create_snapshot(Request::new(snapshot_request.clone()))
        .await
        .unwrap()
        .into_inner()
        .snapshot
        .unwrap();
    assert!(snapshot.snapshot_id.starts_with("node-a:"));
    assert_eq!(snapshot.source_volume_id, source.volume_id);
    assert!(snapshot.ready_to_use);

    let again = service
        .create_snapshot(Request::new(snapshot_request))
        .await
        .unwrap()
        .into_inner()
        .snapshot
        .unwrap();
    assert_eq!(again.snapshot_id, snapshot.snapshot_id);

    let listed = service
        .list_snapshots(Request::new(csi::ListSnapshotsRequest {
            source_volume_id: source.volume_id.clone(),
            ..Default::default()
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(listed.entries.len(), 1);
    assert_eq!(
        listed.entries[0].snapshot.as_ref().unwrap().snapshot_id,
        snapshot.snapshot_id
    );

    let mut clone = create_request("pvc-clone", 2 * GIB);
    clone.volume_content_source = Some(csi::VolumeContentSource {
        r#type: Some(csi::volume_content_source::Type::Snapshot(
            csi::volume_content_source::SnapshotSource {
                snapshot_id: snapshot.snapshot_id.clone(),
            },
        )),
    });
    let cloned = service
        .create_volume(Request::new(clone))
        .await
        .unwrap()
        .into_inner()
        .volume
        .unwrap();
    assert!(cloned.volume_id.starts_with("node-a:"));
    assert_eq!(cloned.capacity_bytes, 2 * GIB);
    assert!(cloned.content_source.is_some());
    assert_eq!(b.volume_count(), 0);

    service
        .delete_snapshot(Request::new(csi::DeleteSnapshotRequest {
            snapshot_id: snapshot.snapshot_id.clone(),
            secrets: HashMap::new(),
        }))
        .await
        .unwrap();
    service
        .delete_snapshot(Request::new(csi::DeleteSnapshotRequest {
            snapshot_id: snapshot.snapshot_id,
            secrets: HashMap::new(),
        }))
        .await
        .unwrap();
}

fn clone_request(name: &str, bytes: i64, snapshot_id: &str) -> csi::CreateVolumeRequest {
    let mut request = create_request(name, bytes);
    request.volume_content_source = Some(csi::VolumeContentSource {
        r#type: Some(csi::volume_content_source::Type::Snapshot(
            csi::volume_content_source::SnapshotSource {
                snapshot_id: snapshot_id.to_string(),
            },
        )),
    });
    request
}

/// A clone that cannot be grown is deleted, and a retry does not hand
/// back an undersized volume
#[tokio::test]
async fn test_clone_that_cannot_grow_is_removed() {
    let backend = FakeBackend::new("http://a", &[("lvs0", 1100)]);
    let service = service(&[("node-a", &backend)]);
    let source = create(&service, "pvc-src", GIB).await;
    let snapshot = service
        .create_snapshot(Request::new(csi::CreateSnapshotRequest {
            source_volume_id: source.volume_id.clone(),
            name: "snap-1".into(),
            ..Default::default()
        }))
        .await
        .unwrap()
        .into_inner()
        .snapshot
        .unwrap();

    let err = service
        .create_volume(Request::new(clone_request("pvc-clone", 2 * GIB, &snapshot.snapshot_id)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::ResourceExhausted);
    assert_eq!(backend.volume_count(), 1);
    assert_eq!(backend.published(), vec![source.volume_id.split_once(':').unwrap().1.to_string()]);

    let err = service
        .create_volume(Request::new(clone_request("pvc-clone", 2 * GIB, &snapshot.snapshot_id)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::ResourceExhausted);
    assert_eq!(backend.volume_count(), 1);
}

/// An existing volume smaller than the request is grown before it is
/// returned
#[tokio::test]
async fn test_existing_short_volume_is_grown() {
    let backend = FakeBackend::new("http://a", &[("lvs0", 10_240)]);
    let service = service(&[("node-a", &backend)]);

    let first = create(&service, "pvc-1", GIB).await;
    let second = create(&service, "pvc-1", 2 * GIB).await;
    assert_eq!(first.volume_id, second.volume_id);
    assert_eq!(second.capacity_bytes, 2 * GIB);
    assert_eq!(backend.creates.load(Ordering::SeqCst), 1);
    assert_eq!(backend.free_mib(), 10_240 - 2 * 1024);
}

/// Expansion grows the volume and asks the node to grow the filesystem
#[tokio::test]
async fn test_expand_volume() {
    let backend = FakeBackend::new("http://a", &[("lvs0", 10_240)]);
    let service = service(&[("node-a", &backend)]);
    let volume = create(&service, "pvc-1", GIB).await;

    let response = service
        .controller_expand_volume(Request::new(csi::ControllerExpandVolumeRequest {
            volume_id: volume.volume_id.clone(),
            capacity_range: Some(csi::CapacityRange {
                required_bytes: 3 * GIB,
                limit_bytes: 0,
            }),
            ..Default::default()
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.capacity_bytes, 3 * GIB);
    assert!(response.node_expansion_required);
    assert_eq!(backend.free_mib(), 10_240 - 3 * 1024);
}
