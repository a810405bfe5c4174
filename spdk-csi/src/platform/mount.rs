//! Filesystem and mount operations.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::exec::{CommandRunner, run_checked};
use crate::error::{CsiError, Result};

/// Default filesystem when the volume capability names none
pub const DEFAULT_FS_TYPE: &str = "ext4";

const PROC_MOUNTS: &str = "/proc/mounts";

/// Validate filesystem type; empty means the default.
pub fn validate_fs_type(fs_type: &str) -> Result<&'static str> {
    match fs_type.to_lowercase().as_str() {
        "ext4" | "" => Ok("ext4"),
        "xfs" => Ok("xfs"),
        _ => Err(CsiError::InvalidArgument(format!(
            "unsupported filesystem: {}. Supported: ext4, xfs",
            fs_type
        ))),
    }
}

#[async_trait]
pub trait Mounter: Send + Sync {
    async fn is_mounted(&self, target: &Path) -> Result<bool>;

    /// Mount `device` on `target`, creating a filesystem first when the
    /// device has none.
    async fn format_and_mount(
        &self,
        device: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()>;

    async fn bind_mount(&self, source: &Path, target: &Path, readonly: bool) -> Result<()>;

    /// Unmount `target`; not mounted is success.
    async fn unmount(&self, target: &Path) -> Result<()>;

    /// Device mounted at `target`, if any.
    async fn device_of(&self, target: &Path) -> Result<Option<String>>;

    /// Grow the filesystem on `device` (mounted at `mount_path`) to the
    /// device size.
    async fn resize_fs(&self, device: &str, mount_path: &Path) -> Result<()>;
}

/// Mounter backed by the host's mount tools and `/proc/mounts`.
pub struct SystemMounter {
    runner: Arc<dyn CommandRunner>,
    mounts_file: PathBuf,
}

impl SystemMounter {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_mounts_file(runner, PROC_MOUNTS)
    }

    pub fn with_mounts_file(runner: Arc<dyn CommandRunner>, mounts_file: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            mounts_file: mounts_file.into(),
        }
    }

    /// `(device, mount point)` pairs from the mount table.
    fn mounts(&self) -> Result<Vec<(String, String)>> {
        let table = fs::read_to_string(&self.mounts_file)?;
        Ok(table
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let device = fields.next()?;
                let target = fields.next()?;
                // Spaces in mount points are octal-escaped
                Some((device.to_string(), target.replace("\\040", " ")))
            })
            .collect())
    }

    /// Filesystem type found on `device`, if any.
    async fn probe_fs(&self, device: &str) -> Result<Option<String>> {
        let output = self
            .runner
            .run("blkid", &["-p", "-s", "TYPE", "-o", "value", device])
            .await?;
        match output.code {
            Some(0) => {
                let fs_type = output.stdout.trim();
                Ok((!fs_type.is_empty()).then(|| fs_type.to_string()))
            }
            // blkid exits 2 when the device carries no recognizable signature
            Some(2) => Ok(None),
            _ => Err(CsiError::CommandFailed {
                command: format!("blkid -p {}", device),
                output: output.stderr.trim().to_string(),
            }),
        }
    }
}

#[async_trait]
impl Mounter for SystemMounter {
    async fn is_mounted(&self, target: &Path) -> Result<bool> {
        let target = target.to_string_lossy();
        Ok(self.mounts()?.iter().any(|(_, t)| *t == target))
    }

    async fn format_and_mount(
        &self,
        device: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        let fs_type = validate_fs_type(fs_type)?;
        match self.probe_fs(device).await? {
            Some(existing) => {
                debug!(device, existing = %existing, "Device already formatted");
            }
            None => {
                info!(device, fs_type, "Formatting device");
                let force = if fs_type == "xfs" { "-f" } else { "-F" };
                run_checked(
                    self.runner.as_ref(),
                    &format!("mkfs.{}", fs_type),
                    &[force, device],
                )
                .await?;
            }
        }

        fs::create_dir_all(target)?;
        let target = target.to_string_lossy();
        let joined = options.join(",");
        let mut args = vec!["-t", fs_type];
        if !joined.is_empty() {
            args.extend(["-o", joined.as_str()]);
        }
        args.extend([device, &*target]);

        info!(device, target = %target, fs_type, options = %joined, "Mounting device");
        run_checked(self.runner.as_ref(), "mount", &args).await?;
        Ok(())
    }

    async fn bind_mount(&self, source: &Path, target: &Path, readonly: bool) -> Result<()> {
        fs::create_dir_all(target)?;
        let source = source.to_string_lossy();
        let target = target.to_string_lossy();

        info!(source = %source, target = %target, readonly, "Creating bind mount");
        run_checked(self.runner.as_ref(), "mount", &["--bind", &source, &target]).await?;
        if readonly {
            // A bind mount only becomes read-only on remount
            run_checked(
                self.runner.as_ref(),
                "mount",
                &["-o", "remount,bind,ro", &target],
            )
            .await?;
        }
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        if !self.is_mounted(target).await? {
            debug!(target = %target.display(), "Path is not mounted, skipping unmount");
            return Ok(());
        }

        let target_str = target.to_string_lossy();
        info!(target = %target_str, "Unmounting");
        let output = self.runner.run("umount", &[&target_str]).await?;
        if !output.success() {
            if output.stderr.contains("not mounted") || output.stderr.contains("no mount point") {
                warn!(target = %target_str, "Path was not mounted");
                return Ok(());
            }
            return Err(CsiError::CommandFailed {
                command: format!("umount {}", target_str),
                output: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn device_of(&self, target: &Path) -> Result<Option<String>> {
        let target = target.to_string_lossy();
        Ok(self
            .mounts()?
            .into_iter()
            .find(|(_, t)| *t == target)
            .map(|(device, _)| device))
    }

    async fn resize_fs(&self, device: &str, mount_path: &Path) -> Result<()> {
        let fs_type = self.probe_fs(device).await?.unwrap_or_default();
        info!(device, fs_type = %fs_type, "Resizing filesystem");
        match fs_type.as_str() {
            "ext4" | "ext3" | "ext2" => {
                run_checked(self.runner.as_ref(), "resize2fs", &[device]).await?;
            }
            "xfs" => {
                let mount_path = mount_path.to_string_lossy();
                run_checked(self.runner.as_ref(), "xfs_growfs", &[&mount_path]).await?;
            }
            other => {
                return Err(CsiError::InvalidArgument(format!(
                    "cannot resize filesystem '{}' on {}",
                    other, device
                )));
            }
        }
        Ok(())
    }
}
