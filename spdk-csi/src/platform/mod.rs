//! Host operations for the node service
//!
//! External commands run through a [`CommandRunner`] and mounts go through
//! a [`Mounter`], so the node logic can be exercised against fakes. Device
//! discovery walks sysfs and devfs below [`HostPaths`], which tests point
//! at a temporary directory.

mod exec;
mod mount;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::{CsiError, Result};

pub use exec::{COMMAND_TIMEOUT, CommandOutput, CommandRunner, SystemRunner, run_checked};
pub use mount::{DEFAULT_FS_TYPE, Mounter, SystemMounter, validate_fs_type};

#[cfg(test)]
pub(crate) use exec::testing;

/// Roots of the sysfs and devfs trees.
#[derive(Debug, Clone)]
pub struct HostPaths {
    pub sys: PathBuf,
    pub dev: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            sys: PathBuf::from("/sys"),
            dev: PathBuf::from("/dev"),
        }
    }
}

impl HostPaths {
    /// `{root}/sys` and `{root}/dev`.
    pub fn rooted(root: &Path) -> Self {
        Self {
            sys: root.join("sys"),
            dev: root.join("dev"),
        }
    }

    pub fn pci_devices(&self) -> PathBuf {
        self.sys.join("bus/pci/devices")
    }

    pub fn disk_by_id(&self) -> PathBuf {
        self.dev.join("disk/by-id")
    }

    pub fn disk_by_path(&self) -> PathBuf {
        self.dev.join("disk/by-path")
    }
}

/// Bounded polling: `ticks` checks, `interval` apart.
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub ticks: u32,
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            ticks: 20,
            interval: Duration::from_secs(1),
        }
    }
}

impl PollConfig {
    /// Call `check` until it yields a value; `Timeout` after the last tick.
    pub async fn until<T, F>(&self, what: &str, mut check: F) -> Result<T>
    where
        F: FnMut() -> Option<T>,
    {
        for tick in 0..=self.ticks {
            if let Some(value) = check() {
                return Ok(value);
            }
            if tick < self.ticks {
                tokio::time::sleep(self.interval).await;
            }
        }
        debug!(what, ticks = self.ticks, "Polling gave up");
        Err(CsiError::Timeout(format!("timed out waiting for {}", what)))
    }
}

/// First entry of `dir` whose file name contains `needle`.
pub fn find_entry_containing(dir: &Path, needle: &str) -> Option<PathBuf> {
    let mut matches: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().contains(needle))
        .map(|entry| entry.path())
        .collect();
    matches.sort();
    matches.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> PollConfig {
        PollConfig {
            ticks: 3,
            interval: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_poll_returns_first_hit() {
        let calls = AtomicU32::new(0);
        let value = fast()
            .until("device", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                (n == 2).then_some("/dev/nvme0n1")
            })
            .await
            .unwrap();
        assert_eq!(value, "/dev/nvme0n1");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_times_out() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast()
            .until("device", || {
                calls.fetch_add(1, Ordering::SeqCst);
                None
            })
            .await;
        assert!(matches!(result, Err(CsiError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_find_entry_containing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("nvme-SPDK_u-1_1"), "").unwrap();
        std::fs::write(dir.path().join("nvme-SPDK_u-1"), "").unwrap();
        std::fs::write(dir.path().join("nvme-SPDK_u-2"), "").unwrap();

        assert_eq!(
            find_entry_containing(dir.path(), "u-1"),
            Some(dir.path().join("nvme-SPDK_u-1"))
        );
        assert_eq!(find_entry_containing(dir.path(), "u-3"), None);
        assert_eq!(find_entry_containing(&dir.path().join("missing"), "u-1"), None);
    }

    #[test]
    fn test_rooted_paths() {
        let paths = HostPaths::rooted(Path::new("/tmp/host"));
        assert_eq!(paths.pci_devices(), Path::new("/tmp/host/sys/bus/pci/devices"));
        assert_eq!(paths.disk_by_id(), Path::new("/tmp/host/dev/disk/by-id"));
    }
}
