//! CSI Node Service Implementation
//!
//! Stages volumes by connecting an initiator, formatting the block device
//! if needed and mounting it at `{staging_target_path}/{volume_id}`, then
//! publishes them into pods with bind mounts.
//!
//! The volume context used for staging is persisted next to the staging
//! directory, so unstage can find the connection again after the plugin
//! restarts.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::context::{self, ContextMap, VOLUME_CONTEXT_FILE};
use crate::controller::unsupported_capability;
use crate::csi;
use crate::error::{CsiError, Result};
use crate::initiator::{self, Initiator, NodeEnv};
use crate::locks::VolumeLocks;
use crate::metrics::OperationTimer;
use crate::platform::{DEFAULT_FS_TYPE, Mounter, run_checked};

/// Context key holding the directory the persisted state lives in
pub const STAGING_PARENT_KEY: &str = "stagingParentPath";

/// CSI Node Service
pub struct NodeService {
    node_id: String,
    env: NodeEnv,
    mounter: Arc<dyn Mounter>,
    locks: VolumeLocks,
}

/// Validate that a path is safe to hand to mount tools.
fn validate_path(path: &str, what: &str) -> Result<()> {
    if path.is_empty() {
        return Err(CsiError::InvalidArgument(format!("{} is required", what)));
    }
    if !path.starts_with('/') {
        return Err(CsiError::InvalidArgument(format!("{} must be absolute", what)));
    }
    if path.split('/').any(|part| part == "..") {
        return Err(CsiError::InvalidArgument(format!(
            "{} cannot contain '..'",
            what
        )));
    }
    if path.contains(['\n', '\r', '\0']) {
        return Err(CsiError::InvalidArgument(format!(
            "{} contains control characters",
            what
        )));
    }
    Ok(())
}

fn require_volume_id(volume_id: &str) -> Result<()> {
    if volume_id.is_empty() {
        return Err(CsiError::InvalidArgument("volume ID is required".into()));
    }
    if volume_id.contains('/') {
        return Err(CsiError::InvalidArgument(format!(
            "invalid volume ID '{}'",
            volume_id
        )));
    }
    Ok(())
}

/// Mount point of a staged volume.
pub fn staging_path(staging_target_path: &str, volume_id: &str) -> PathBuf {
    Path::new(staging_target_path).join(volume_id)
}

fn failed_precondition(message: String) -> CsiError {
    CsiError::Rpc(Status::failed_precondition(message))
}

/// Filesystem type and mount options for a mount capability.
fn mount_settings(cap: &csi::VolumeCapability) -> Result<(String, Vec<String>)> {
    use csi::volume_capability::AccessType;
    use csi::volume_capability::access_mode::Mode;

    if let Some(reason) = unsupported_capability(cap) {
        return Err(CsiError::InvalidArgument(reason));
    }
    let Some(AccessType::Mount(mount)) = &cap.access_type else {
        return Err(CsiError::InvalidArgument("mount access type required".into()));
    };

    let fs_type = if mount.fs_type.is_empty() {
        DEFAULT_FS_TYPE.to_string()
    } else {
        mount.fs_type.clone()
    };
    let mut options = mount.mount_flags.clone();
    let read_only = cap.access_mode.as_ref().is_some_and(|m| {
        matches!(
            Mode::try_from(m.mode),
            Ok(Mode::SingleNodeReaderOnly | Mode::MultiNodeReaderOnly)
        )
    });
    if read_only && !options.iter().any(|o| o == "ro") {
        options.push("ro".to_string());
    }
    Ok((fs_type, options))
}

fn remove_dir_if_present(path: &Path) -> Result<()> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl NodeService {
    pub fn new(node_id: impl Into<String>, env: NodeEnv, mounter: Arc<dyn Mounter>) -> Self {
        Self {
            node_id: node_id.into(),
            env,
            mounter,
            locks: VolumeLocks::new(),
        }
    }

    async fn stage_inner(&self, req: csi::NodeStageVolumeRequest) -> Result<()> {
        require_volume_id(&req.volume_id)?;
        validate_path(&req.staging_target_path, "staging target path")?;
        let cap = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| CsiError::InvalidArgument("volume capability is required".into()))?;
        let (fs_type, options) = mount_settings(cap)?;

        let mut volume_context: ContextMap = req.volume_context.clone();
        volume_context.insert(STAGING_PARENT_KEY.to_string(), req.staging_target_path.clone());
        let state_dir = Path::new(&req.staging_target_path);

        let _guard = self.locks.lock(&req.volume_id).await;
        let staging = staging_path(&req.staging_target_path, &req.volume_id);
        if self.mounter.is_mounted(&staging).await? {
            // Unstage can only disconnect what the stashed context names
            if context::lookup_context(state_dir, VOLUME_CONTEXT_FILE)?.is_none() {
                warn!(volume_id = %req.volume_id, "Staged volume has no context, rewriting it");
                context::stash_context(state_dir, VOLUME_CONTEXT_FILE, &volume_context)?;
            }
            info!(volume_id = %req.volume_id, staging = %staging.display(), "Volume already staged");
            return Ok(());
        }

        // Stashed before connecting so a crash mid-stage still leaves unstage
        // something to tear down
        let mut initiator = initiator::initiator_for(&self.env, &volume_context)?;
        context::stash_context(state_dir, VOLUME_CONTEXT_FILE, &volume_context)?;
        let device = match initiator.connect().await {
            Ok(device) => device,
            Err(e) => {
                self.abandon_stage(&req.volume_id, state_dir, None).await;
                return Err(e);
            }
        };
        debug!(volume_id = %req.volume_id, device = %device, "Initiator connected");

        let mounted = self
            .mounter
            .format_and_mount(&device, &staging, &fs_type, &options)
            .await;
        if let Err(e) = mounted {
            self.abandon_stage(&req.volume_id, state_dir, Some(initiator.as_mut())).await;
            return Err(e);
        }

        info!(
            volume_id = %req.volume_id,
            staging = %staging.display(),
            device = %device,
            fs_type = %fs_type,
            "Volume staged successfully"
        );
        Ok(())
    }

    /// Undo a failed stage. The stashed context is dropped only once the
    /// initiator is disconnected, so a later unstage can still finish the job.
    async fn abandon_stage(
        &self,
        volume_id: &str,
        state_dir: &Path,
        initiator: Option<&mut dyn Initiator>,
    ) {
        if let Some(initiator) = initiator {
            if let Err(e) = initiator.disconnect().await {
                warn!(volume_id, error = %e, "Failed to disconnect after stage failure");
                return;
            }
        }
        if let Err(e) = context::cleanup_context(state_dir, VOLUME_CONTEXT_FILE) {
            warn!(volume_id, error = %e, "Failed to remove volume context");
        }
    }

    async fn unstage_inner(&self, req: csi::NodeUnstageVolumeRequest) -> Result<()> {
        require_volume_id(&req.volume_id)?;
        validate_path(&req.staging_target_path, "staging target path")?;

        let _guard = self.locks.lock(&req.volume_id).await;
        let staging = staging_path(&req.staging_target_path, &req.volume_id);
        self.mounter.unmount(&staging).await?;
        remove_dir_if_present(&staging)?;

        let state_dir = Path::new(&req.staging_target_path);
        let Some(volume_context) = context::lookup_context(state_dir, VOLUME_CONTEXT_FILE)? else {
            info!(volume_id = %req.volume_id, "No staged context found, volume already unstaged");
            return Ok(());
        };

        let mut initiator = initiator::initiator_for(&self.env, &volume_context)?;
        initiator.disconnect().await?;
        context::cleanup_context(state_dir, VOLUME_CONTEXT_FILE)?;
        Ok(())
    }

    async fn publish_inner(&self, req: csi::NodePublishVolumeRequest) -> Result<()> {
        require_volume_id(&req.volume_id)?;
        validate_path(&req.target_path, "target path")?;
        validate_path(&req.staging_target_path, "staging target path")?;
        let cap = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| CsiError::InvalidArgument("volume capability is required".into()))?;
        let (_, options) = mount_settings(cap)?;
        let readonly = req.readonly || options.iter().any(|o| o == "ro");

        let _guard = self.locks.lock(&req.volume_id).await;
        let staging = staging_path(&req.staging_target_path, &req.volume_id);
        if !self.mounter.is_mounted(&staging).await? {
            return Err(failed_precondition(format!(
                "volume {} is not staged at {}",
                req.volume_id,
                staging.display()
            )));
        }

        let target = Path::new(&req.target_path);
        if self.mounter.is_mounted(target).await? {
            info!(target_path = %req.target_path, "Volume already published");
            return Ok(());
        }
        self.mounter.bind_mount(&staging, target, readonly).await
    }

    async fn unpublish_inner(&self, req: csi::NodeUnpublishVolumeRequest) -> Result<()> {
        require_volume_id(&req.volume_id)?;
        validate_path(&req.target_path, "target path")?;

        let _guard = self.locks.lock(&req.volume_id).await;
        let target = Path::new(&req.target_path);
        self.mounter.unmount(target).await?;
        remove_dir_if_present(target)
    }

    async fn expand_inner(&self, req: csi::NodeExpandVolumeRequest) -> Result<i64> {
        require_volume_id(&req.volume_id)?;
        validate_path(&req.volume_path, "volume path")?;

        let _guard = self.locks.lock(&req.volume_id).await;
        let volume_path = Path::new(&req.volume_path);
        let device = self
            .mounter
            .device_of(volume_path)
            .await?
            .ok_or_else(|| CsiError::NotFound(req.volume_path.clone()))?;

        self.mounter.resize_fs(&device, volume_path).await?;

        let size = run_checked(self.env.runner.as_ref(), "blockdev", &["--getsize64", &device]).await?;
        size.trim()
            .parse::<i64>()
            .map_err(|_| CsiError::Internal(format!("unexpected size of {}: '{}'", device, size.trim())))
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_stage_volume");
        let req = request.into_inner();
        info!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            "NodeStageVolume request"
        );

        let result = self
            .stage_inner(req)
            .await
            .map(|()| Response::new(csi::NodeStageVolumeResponse {}))
            .map_err(Status::from);
        timer.finish(&result);
        result
    }

    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_unstage_volume");
        let req = request.into_inner();
        let volume_id = req.volume_id.clone();
        info!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            "NodeUnstageVolume request"
        );

        let result = self
            .unstage_inner(req)
            .await
            .map(|()| {
                info!(volume_id = %volume_id, "Volume unstaged successfully");
                Response::new(csi::NodeUnstageVolumeResponse {})
            })
            .map_err(Status::from);
        timer.finish(&result);
        result
    }

    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_publish_volume");
        let req = request.into_inner();
        let volume_id = req.volume_id.clone();
        let target_path = req.target_path.clone();
        info!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            target_path = %req.target_path,
            readonly = req.readonly,
            "NodePublishVolume request"
        );

        let result = self
            .publish_inner(req)
            .await
            .map(|()| {
                info!(volume_id = %volume_id, target_path = %target_path, "Volume published successfully");
                Response::new(csi::NodePublishVolumeResponse {})
            })
            .map_err(Status::from);
        timer.finish(&result);
        result
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_unpublish_volume");
        let req = request.into_inner();
        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            "NodeUnpublishVolume request"
        );

        let result = self
            .unpublish_inner(req)
            .await
            .map(|()| Response::new(csi::NodeUnpublishVolumeResponse {}))
            .map_err(Status::from);
        timer.finish(&result);
        result
    }

    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        debug!(node_id = %self.node_id, "NodeGetInfo request");

        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0,
            accessible_topology: None,
        }))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        use csi::node_service_capability::rpc::Type;

        let capabilities = [Type::StageUnstageVolume, Type::ExpandVolume]
            .into_iter()
            .map(|rpc| csi::NodeServiceCapability {
                r#type: Some(csi::node_service_capability::Type::Rpc(
                    csi::node_service_capability::Rpc { r#type: rpc as i32 },
                )),
            })
            .collect();

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Grows the filesystem to the size of its (already expanded) device.
    async fn node_expand_volume(
        &self,
        request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_expand_volume");
        let req = request.into_inner();
        let volume_id = req.volume_id.clone();
        info!(
            volume_id = %req.volume_id,
            volume_path = %req.volume_path,
            "NodeExpandVolume request"
        );

        let result = self
            .expand_inner(req)
            .await
            .map(|capacity_bytes| {
                info!(volume_id = %volume_id, capacity_bytes, "Volume expansion completed");
                Response::new(csi::NodeExpandVolumeResponse { capacity_bytes })
            })
            .map_err(Status::from);
        timer.finish(&result);
        result
    }
}
