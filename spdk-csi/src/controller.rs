//! CSI Controller Service Implementation
//!
//! Creates, publishes and deletes volumes and snapshots on the configured
//! storage endpoints. Volume and snapshot IDs have the form
//! `{endpoint}:{lvol id}` so that every later call can find the owning
//! endpoint from the ID alone.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use prost_types::Timestamp;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, MIB, SnapshotInfo};
use crate::config::Secrets;
use crate::csi;
use crate::endpoints::BackendProvider;
use crate::error::{CsiError, Result};
use crate::locks::VolumeLocks;
use crate::metrics::OperationTimer;
use crate::retry::with_retry;
use crate::scheduler;

/// Default volume size: 1GiB
const DEFAULT_VOLUME_SIZE: i64 = 1024 * 1024 * 1024;

/// Placement attempts when a chosen lvstore turns out to be full
const MAX_PLACEMENT_ATTEMPTS: usize = 3;

/// Resize `lvol_id` up to `size_mib` unless it is already that large.
async fn grow_to(backend: &dyn Backend, lvol_id: &str, size_mib: u64) -> Result<()> {
    let info = with_retry("volume_info", || backend.volume_info(lvol_id)).await?;
    if info.size_bytes < size_mib * MIB {
        debug!(lvol_id, from_bytes = info.size_bytes, size_mib, "Growing volume");
        backend.resize_volume(lvol_id, size_mib).await?;
    }
    Ok(())
}

pub fn volume_id(endpoint: &str, lvol_id: &str) -> String {
    format!("{}:{}", endpoint, lvol_id)
}

/// Split a volume or snapshot ID into endpoint name and lvol ID.
///
/// IDs are only ever minted by this service, so a malformed one is an
/// internal error rather than bad input.
pub fn parse_volume_id(id: &str) -> Result<(&str, &str)> {
    match id.split_once(':') {
        Some((endpoint, lvol_id)) if !endpoint.is_empty() && !lvol_id.is_empty() => {
            Ok((endpoint, lvol_id))
        }
        _ => Err(CsiError::Internal(format!("malformed volume ID '{}'", id))),
    }
}

/// Requested size rounded up to whole MiB.
pub fn requested_size_mib(range: Option<&csi::CapacityRange>) -> u64 {
    let bytes = range
        .map(|r| {
            if r.required_bytes > 0 {
                r.required_bytes
            } else {
                r.limit_bytes
            }
        })
        .filter(|bytes| *bytes > 0)
        .unwrap_or(DEFAULT_VOLUME_SIZE);
    (bytes as u64).div_ceil(MIB)
}

/// Why `cap` cannot be served, if it cannot.
///
/// Only filesystem volumes are supported; multi-node writers are refused
/// because a local filesystem cannot be shared between writers.
pub fn unsupported_capability(cap: &csi::VolumeCapability) -> Option<String> {
    use csi::volume_capability::AccessType;
    use csi::volume_capability::access_mode::Mode;

    match &cap.access_type {
        Some(AccessType::Mount(_)) => {}
        Some(AccessType::Block(_)) => return Some("block access is not supported".to_string()),
        None => return Some("volume capability must specify an access type".to_string()),
    }

    let Some(access_mode) = &cap.access_mode else {
        return Some("volume capability must specify an access mode".to_string());
    };
    match Mode::try_from(access_mode.mode) {
        Ok(Mode::MultiNodeMultiWriter) => {
            Some("MULTI_NODE_MULTI_WRITER is not supported".to_string())
        }
        Ok(Mode::Unknown) | Err(_) => Some(format!("unknown access mode {}", access_mode.mode)),
        Ok(_) => None,
    }
}

fn now() -> Timestamp {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Timestamp {
        seconds: elapsed.as_secs() as i64,
        nanos: 0,
    }
}

/// A volume as placed on an endpoint.
struct Located {
    endpoint: String,
    backend: Arc<dyn Backend>,
    lvol_id: String,
}

impl Located {
    fn volume_id(&self) -> String {
        volume_id(&self.endpoint, &self.lvol_id)
    }
}

/// CSI Controller Service
///
/// `volume_locks` serializes work on one volume or snapshot ID;
/// `name_locks` collapses concurrent creates of the same name.
pub struct ControllerService {
    endpoints: Arc<dyn BackendProvider>,
    volume_locks: VolumeLocks,
    name_locks: VolumeLocks,
}

impl ControllerService {
    pub fn new(endpoints: Arc<dyn BackendProvider>) -> Self {
        Self {
            endpoints,
            volume_locks: VolumeLocks::new(),
            name_locks: VolumeLocks::new(),
        }
    }

    fn backend_for(&self, endpoint: &str, secrets: Option<&Secrets>) -> Result<Arc<dyn Backend>> {
        self.endpoints.backend(endpoint, secrets)
    }

    /// Backends of every endpoint, in configured order.
    fn candidates(&self, secrets: Option<&Secrets>) -> Vec<(String, Arc<dyn Backend>)> {
        self.endpoints
            .endpoints()
            .into_iter()
            .filter_map(|endpoint| match self.backend_for(&endpoint, secrets) {
                Ok(backend) => Some((endpoint, backend)),
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Skipping storage endpoint");
                    None
                }
            })
            .collect()
    }

    /// Volume named `name` on any endpoint. An endpoint that cannot be
    /// queried fails the lookup: creating anyway could duplicate the volume.
    async fn find_by_name(&self, name: &str, secrets: Option<&Secrets>) -> Result<Option<Located>> {
        for (endpoint, backend) in self.candidates(secrets) {
            let lvstores = with_retry("lvstores", || backend.lvstores()).await?;
            for lvs in lvstores {
                if let Some(lvol_id) = backend.find_volume(&lvs.name, name).await? {
                    return Ok(Some(Located {
                        endpoint,
                        backend,
                        lvol_id,
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Schedule and create, moving on to another lvstore when the chosen
    /// one reports it is full.
    async fn place_and_create(
        &self,
        name: &str,
        size_mib: u64,
        secrets: Option<&Secrets>,
    ) -> Result<Located> {
        let candidates = self.candidates(secrets);
        let mut excluded = Vec::new();
        for attempt in 1..=MAX_PLACEMENT_ATTEMPTS {
            let placement = scheduler::schedule(&candidates, size_mib, &excluded).await?;
            match placement
                .backend
                .create_volume(&placement.lvs_name, name, size_mib)
                .await
            {
                Ok(lvol_id) => {
                    return Ok(Located {
                        endpoint: placement.endpoint,
                        backend: placement.backend,
                        lvol_id,
                    });
                }
                Err(CsiError::NoSpace(msg)) => {
                    warn!(
                        endpoint = %placement.endpoint,
                        lvs_name = %placement.lvs_name,
                        attempt,
                        error = %msg,
                        "Lvstore full, rescheduling"
                    );
                    excluded.push((placement.endpoint, placement.lvs_name));
                }
                Err(e) => return Err(e),
            }
        }
        Err(CsiError::ResourceExhausted(format!(
            "no lvstore could hold {} MiB after {} attempts",
            size_mib, MAX_PLACEMENT_ATTEMPTS
        )))
    }

    /// Clone a snapshot on the snapshot's own endpoint, growing the clone
    /// when more space was requested.
    async fn clone_from_snapshot(
        &self,
        snapshot_id: &str,
        name: &str,
        size_mib: u64,
        secrets: Option<&Secrets>,
    ) -> Result<Located> {
        let (endpoint, snapshot_lvol) = parse_volume_id(snapshot_id)?;
        let backend = self.backend_for(endpoint, secrets)?;
        let lvol_id = backend.clone_snapshot(snapshot_lvol, name).await?;
        info!(snapshot_id, lvol_id = %lvol_id, "Cloned volume from snapshot");

        if let Err(e) = grow_to(backend.as_ref(), &lvol_id, size_mib).await {
            error!(lvol_id = %lvol_id, error = %e, "Failed to size clone, deleting it");
            if let Err(cleanup) = backend.delete_volume(&lvol_id).await {
                warn!(lvol_id = %lvol_id, error = %cleanup, "Failed to delete clone");
            }
            return Err(e);
        }
        Ok(Located {
            endpoint: endpoint.to_string(),
            backend,
            lvol_id,
        })
    }

    /// Publish under the volume's ID lock and build the CSI volume.
    async fn publish(&self, located: &Located) -> Result<csi::Volume> {
        let volume_id = located.volume_id();
        let _guard = self.volume_locks.lock(&volume_id).await;
        let backend = &located.backend;
        let lvol_id = located.lvol_id.as_str();

        with_retry("publish_volume", || backend.publish_volume(lvol_id)).await?;
        let info = with_retry("volume_info", || backend.volume_info(lvol_id)).await?;

        Ok(csi::Volume {
            capacity_bytes: info.size_bytes as i64,
            volume_id,
            volume_context: info.to_context(),
            content_source: None,
            accessible_topology: vec![],
        })
    }

    async fn create_volume_inner(&self, req: csi::CreateVolumeRequest) -> Result<csi::Volume> {
        let name = req.name.as_str();
        if name.is_empty() {
            return Err(CsiError::InvalidArgument("volume name is required".into()));
        }
        if let Some(reason) = req.volume_capabilities.iter().find_map(unsupported_capability) {
            return Err(CsiError::InvalidArgument(reason));
        }
        let size_mib = requested_size_mib(req.capacity_range.as_ref());
        let secrets = Secrets::from_request(&req.secrets)?;
        let secrets = secrets.as_ref();

        let _name_guard = self.name_locks.lock(name).await;

        if let Some(existing) = self.find_by_name(name, secrets).await? {
            info!(name, volume_id = %existing.volume_id(), "Volume already exists");
            // A create interrupted before sizing left the volume short
            grow_to(existing.backend.as_ref(), &existing.lvol_id, size_mib).await?;
            let mut volume = self.publish(&existing).await?;
            volume.content_source = req.volume_content_source;
            return Ok(volume);
        }

        use csi::volume_content_source::Type as SourceType;
        let located = match req.volume_content_source.as_ref().and_then(|s| s.r#type.as_ref()) {
            Some(SourceType::Snapshot(snapshot)) => {
                self.clone_from_snapshot(&snapshot.snapshot_id, name, size_mib, secrets)
                    .await?
            }
            Some(SourceType::Volume(_)) => {
                return Err(CsiError::InvalidArgument(
                    "volume content source is not supported".into(),
                ));
            }
            None => self.place_and_create(name, size_mib, secrets).await?,
        };

        debug!(name, volume_id = %located.volume_id(), size_mib, "Volume created, publishing");

        match self.publish(&located).await {
            Ok(mut volume) => {
                volume.content_source = req.volume_content_source;
                Ok(volume)
            }
            Err(e) => {
                error!(volume_id = %located.volume_id(), error = %e, "Publish failed, deleting volume");
                if let Err(cleanup) = located.backend.delete_volume(&located.lvol_id).await {
                    warn!(
                        volume_id = %located.volume_id(),
                        error = %cleanup,
                        "Failed to delete unpublished volume"
                    );
                }
                Err(e)
            }
        }
    }

    async fn delete_volume_inner(&self, req: csi::DeleteVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(CsiError::InvalidArgument("volume ID is required".into()));
        }
        let (endpoint, lvol_id) = parse_volume_id(&req.volume_id)?;
        let secrets = Secrets::from_request(&req.secrets)?;
        let backend = self.backend_for(endpoint, secrets.as_ref())?;

        let _guard = self.volume_locks.lock(&req.volume_id).await;

        let published = match with_retry("is_published", || backend.is_published(lvol_id)).await {
            Ok(published) => published,
            Err(e) if e.is_not_found() => {
                warn!(volume_id = %req.volume_id, "Volume not found, treating as already deleted");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if published {
            match with_retry("unpublish_volume", || backend.unpublish_volume(lvol_id)).await {
                Ok(()) => {}
                Err(CsiError::NotPublished(_)) => {
                    warn!(volume_id = %req.volume_id, "Volume was unpublished concurrently");
                }
                Err(e) if e.is_not_found() => {
                    warn!(volume_id = %req.volume_id, "Volume not found, treating as already deleted");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        } else {
            debug!(volume_id = %req.volume_id, "Volume not published, skipping unpublish");
        }

        match with_retry("delete_volume", || backend.delete_volume(lvol_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                warn!(volume_id = %req.volume_id, "Volume vanished during delete");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn validate_inner(
        &self,
        req: csi::ValidateVolumeCapabilitiesRequest,
    ) -> Result<csi::ValidateVolumeCapabilitiesResponse> {
        if req.volume_id.is_empty() {
            return Err(CsiError::InvalidArgument("volume ID is required".into()));
        }
        if req.volume_capabilities.is_empty() {
            return Err(CsiError::InvalidArgument("volume capabilities are required".into()));
        }
        let (endpoint, lvol_id) = parse_volume_id(&req.volume_id)?;
        let secrets = Secrets::from_request(&req.secrets)?;
        let backend = self.backend_for(endpoint, secrets.as_ref())?;
        backend.volume_info(lvol_id).await?;

        let reasons: Vec<String> = req
            .volume_capabilities
            .iter()
            .filter_map(unsupported_capability)
            .collect();
        if !reasons.is_empty() {
            let message = reasons.join("; ");
            warn!(volume_id = %req.volume_id, message = %message, "Volume capabilities not supported");
            return Ok(csi::ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message,
            });
        }

        Ok(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: req.volume_capabilities,
                parameters: req.parameters,
                mutable_parameters: req.mutable_parameters,
            }),
            message: String::new(),
        })
    }

    async fn expand_volume_inner(
        &self,
        req: csi::ControllerExpandVolumeRequest,
    ) -> Result<csi::ControllerExpandVolumeResponse> {
        if req.volume_id.is_empty() {
            return Err(CsiError::InvalidArgument("volume ID is required".into()));
        }
        if req.capacity_range.is_none() {
            return Err(CsiError::InvalidArgument(
                "capacity range is required for volume expansion".into(),
            ));
        }
        let size_mib = requested_size_mib(req.capacity_range.as_ref());
        let (endpoint, lvol_id) = parse_volume_id(&req.volume_id)?;
        let secrets = Secrets::from_request(&req.secrets)?;
        let backend = self.backend_for(endpoint, secrets.as_ref())?;

        let _guard = self.volume_locks.lock(&req.volume_id).await;
        let info = backend.volume_info(lvol_id).await?;
        if info.size_bytes < size_mib * MIB {
            with_retry("resize_volume", || backend.resize_volume(lvol_id, size_mib)).await?;
            info!(volume_id = %req.volume_id, size_mib, "Volume expanded");
        }

        Ok(csi::ControllerExpandVolumeResponse {
            capacity_bytes: (size_mib * MIB).max(info.size_bytes) as i64,
            // The filesystem on top still has to grow on the node
            node_expansion_required: true,
        })
    }

    fn snapshot_to_csi(endpoint: &str, snapshot: &SnapshotInfo) -> csi::Snapshot {
        csi::Snapshot {
            size_bytes: snapshot.size_bytes as i64,
            snapshot_id: volume_id(endpoint, &snapshot.uuid),
            source_volume_id: if snapshot.source_uuid.is_empty() {
                String::new()
            } else {
                volume_id(endpoint, &snapshot.source_uuid)
            },
            creation_time: snapshot.created_at.map(|seconds| Timestamp { seconds, nanos: 0 }),
            ready_to_use: true,
            group_snapshot_id: String::new(),
        }
    }

    async fn create_snapshot_inner(&self, req: csi::CreateSnapshotRequest) -> Result<csi::Snapshot> {
        if req.source_volume_id.is_empty() {
            return Err(CsiError::InvalidArgument("source volume ID is required".into()));
        }
        if req.name.is_empty() {
            return Err(CsiError::InvalidArgument("snapshot name is required".into()));
        }
        let (endpoint, lvol_id) = parse_volume_id(&req.source_volume_id)?;
        let secrets = Secrets::from_request(&req.secrets)?;
        let backend = self.backend_for(endpoint, secrets.as_ref())?;

        let _guard = self.volume_locks.lock(&req.source_volume_id).await;
        let source = backend.volume_info(lvol_id).await?;

        if let Some(existing) = backend.find_snapshot(&source.lvs_name, &req.name).await? {
            if !existing.source_uuid.is_empty() && existing.source_uuid != lvol_id {
                return Err(CsiError::AlreadyExists(format!(
                    "snapshot '{}' exists for another volume",
                    req.name
                )));
            }
            info!(name = %req.name, snapshot_id = %existing.uuid, "Snapshot already exists");
            let mut snapshot = Self::snapshot_to_csi(endpoint, &existing);
            snapshot.source_volume_id = req.source_volume_id.clone();
            snapshot.creation_time.get_or_insert_with(now);
            return Ok(snapshot);
        }

        let snapshot_lvol = backend.create_snapshot(lvol_id, &req.name).await?;
        Ok(csi::Snapshot {
            size_bytes: source.size_bytes as i64,
            snapshot_id: volume_id(endpoint, &snapshot_lvol),
            source_volume_id: req.source_volume_id.clone(),
            creation_time: Some(now()),
            ready_to_use: true,
            group_snapshot_id: String::new(),
        })
    }

    async fn delete_snapshot_inner(&self, req: csi::DeleteSnapshotRequest) -> Result<()> {
        if req.snapshot_id.is_empty() {
            return Err(CsiError::InvalidArgument("snapshot ID is required".into()));
        }
        let (endpoint, lvol_id) = parse_volume_id(&req.snapshot_id)?;
        let secrets = Secrets::from_request(&req.secrets)?;
        let backend = self.backend_for(endpoint, secrets.as_ref())?;

        let _guard = self.volume_locks.lock(&req.snapshot_id).await;
        match with_retry("delete_snapshot", || backend.delete_snapshot(lvol_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                warn!(snapshot_id = %req.snapshot_id, "Snapshot not found, treating as already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_snapshots_inner(
        &self,
        req: csi::ListSnapshotsRequest,
    ) -> Result<csi::ListSnapshotsResponse> {
        if req.max_entries < 0 {
            return Err(CsiError::InvalidArgument("max_entries must not be negative".into()));
        }
        let secrets = Secrets::from_request(&req.secrets)?;
        let secrets = secrets.as_ref();

        // A filter narrows the search to one endpoint; an ID that does not
        // parse cannot match anything.
        let filter_id = if !req.snapshot_id.is_empty() {
            Some(&req.snapshot_id)
        } else if !req.source_volume_id.is_empty() {
            Some(&req.source_volume_id)
        } else {
            None
        };
        let candidates = match filter_id {
            Some(id) => match parse_volume_id(id) {
                Ok((endpoint, _)) => vec![(endpoint.to_string(), self.backend_for(endpoint, secrets)?)],
                Err(_) => Vec::new(),
            },
            None => self.candidates(secrets),
        };

        let mut snapshots = Vec::new();
        for (endpoint, backend) in &candidates {
            for snapshot in backend.list_snapshots().await? {
                snapshots.push(Self::snapshot_to_csi(endpoint, &snapshot));
            }
        }
        snapshots.retain(|s| {
            (req.snapshot_id.is_empty() || s.snapshot_id == req.snapshot_id)
                && (req.source_volume_id.is_empty() || s.source_volume_id == req.source_volume_id)
        });
        snapshots.sort_by(|a, b| a.snapshot_id.cmp(&b.snapshot_id));

        let start = if req.starting_token.is_empty() {
            0
        } else {
            match req.starting_token.parse::<usize>() {
                Ok(start) if start <= snapshots.len() => start,
                _ => {
                    return Err(CsiError::Rpc(Status::aborted(format!(
                        "invalid starting token '{}'",
                        req.starting_token
                    ))));
                }
            }
        };
        let end = match req.max_entries {
            0 => snapshots.len(),
            max => (start + max as usize).min(snapshots.len()),
        };
        let next_token = if end < snapshots.len() {
            end.to_string()
        } else {
            String::new()
        };

        Ok(csi::ListSnapshotsResponse {
            entries: snapshots
                .drain(start..end)
                .map(|snapshot| csi::list_snapshots_response::Entry {
                    snapshot: Some(snapshot),
                })
                .collect(),
            next_token,
        })
    }

    /// Free space summed over every reachable endpoint.
    async fn available_capacity(&self) -> i64 {
        let mut free_mib = 0;
        for (endpoint, backend) in self.candidates(None) {
            match backend.lvstores().await {
                Ok(lvstores) => free_mib += lvstores.iter().map(|l| l.free_size_mib).sum::<u64>(),
                Err(e) => warn!(endpoint = %endpoint, error = %e, "Failed to query capacity"),
            }
        }
        (free_mib * MIB) as i64
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let timer = OperationTimer::new("create_volume");
        let req = request.into_inner();
        info!(name = %req.name, "CreateVolume request");

        let result = self
            .create_volume_inner(req)
            .await
            .map(|volume| {
                info!(
                    volume_id = %volume.volume_id,
                    capacity_bytes = volume.capacity_bytes,
                    "Volume created successfully"
                );
                Response::new(csi::CreateVolumeResponse {
                    volume: Some(volume),
                })
            })
            .map_err(Status::from);
        timer.finish(&result);
        result
    }

    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let timer = OperationTimer::new("delete_volume");
        let req = request.into_inner();
        let volume_id = req.volume_id.clone();
        info!(volume_id = %volume_id, "DeleteVolume request");

        let result = self
            .delete_volume_inner(req)
            .await
            .map(|()| {
                info!(volume_id = %volume_id, "Volume deleted successfully");
                Response::new(csi::DeleteVolumeResponse {})
            })
            .map_err(Status::from);
        timer.finish(&result);
        result
    }

    /// Attachment happens on the node; there is no attacher step.
    async fn controller_publish_volume(
        &self,
        _request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerPublishVolume is not supported"))
    }

    async fn controller_unpublish_volume(
        &self,
        _request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerUnpublishVolume is not supported"))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let timer = OperationTimer::new("validate_volume_capabilities");
        let req = request.into_inner();
        info!(volume_id = %req.volume_id, "ValidateVolumeCapabilities request");

        let result = self
            .validate_inner(req)
            .await
            .map(Response::new)
            .map_err(Status::from);
        timer.finish(&result);
        result
    }

    async fn get_capacity(
        &self,
        _request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        let available_capacity = self.available_capacity().await;
        debug!(available_capacity, "GetCapacity");
        Ok(Response::new(csi::GetCapacityResponse {
            available_capacity,
            maximum_volume_size: None,
            minimum_volume_size: None,
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use csi::controller_service_capability::rpc::Type;

        let capabilities = [
            Type::CreateDeleteVolume,
            Type::CreateDeleteSnapshot,
            Type::ListSnapshots,
            Type::ExpandVolume,
            Type::GetCapacity,
        ]
        .into_iter()
        .map(|rpc_type| csi::ControllerServiceCapability {
            r#type: Some(csi::controller_service_capability::Type::Rpc(
                csi::controller_service_capability::Rpc {
                    r#type: rpc_type as i32,
                },
            )),
        })
        .collect();

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn create_snapshot(
        &self,
        request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        let timer = OperationTimer::new("create_snapshot");
        let req = request.into_inner();
        info!(
            source_volume_id = %req.source_volume_id,
            name = %req.name,
            "CreateSnapshot request"
        );

        let result = self
            .create_snapshot_inner(req)
            .await
            .map(|snapshot| {
                info!(snapshot_id = %snapshot.snapshot_id, "Snapshot created successfully");
                Response::new(csi::CreateSnapshotResponse {
                    snapshot: Some(snapshot),
                })
            })
            .map_err(Status::from);
        timer.finish(&result);
        result
    }

    async fn delete_snapshot(
        &self,
        request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        let timer = OperationTimer::new("delete_snapshot");
        let req = request.into_inner();
        let snapshot_id = req.snapshot_id.clone();
        info!(snapshot_id = %snapshot_id, "DeleteSnapshot request");

        let result = self
            .delete_snapshot_inner(req)
            .await
            .map(|()| {
                info!(snapshot_id = %snapshot_id, "Snapshot deleted successfully");
                Response::new(csi::DeleteSnapshotResponse {})
            })
            .map_err(Status::from);
        timer.finish(&result);
        result
    }

    async fn list_snapshots(
        &self,
        request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        let timer = OperationTimer::new("list_snapshots");
        let req = request.into_inner();
        debug!(
            snapshot_id = %req.snapshot_id,
            source_volume_id = %req.source_volume_id,
            max_entries = req.max_entries,
            "ListSnapshots request"
        );

        let result = self
            .list_snapshots_inner(req)
            .await
            .map(Response::new)
            .map_err(Status::from);
        timer.finish(&result);
        result
    }

    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        let timer = OperationTimer::new("expand_volume");
        let req = request.into_inner();
        info!(volume_id = %req.volume_id, "ControllerExpandVolume request");

        let result = self
            .expand_volume_inner(req)
            .await
            .map(Response::new)
            .map_err(Status::from);
        timer.finish(&result);
        result
    }
}
