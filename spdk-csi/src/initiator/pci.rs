//! PCI function allocation and device discovery in sysfs.
//!
//! Accelerator functions appear behind KVM PCI bridges: bridge `n` is bus
//! `n`, each with up to 32 slots. A slot is free when sysfs lists no device
//! for it.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::error::{CsiError, Result};
use crate::platform::{HostPaths, PollConfig};

/// Slots per PCI bridge
pub const FUNCTIONS_PER_BRIDGE: u32 = 32;

static NVME_SYSFS_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"nvme(\d+)n(\d+)|nvme(\d+)c(\d+)n(\d+)").expect("Invalid regex pattern")
});
static NVME_CONTROLLER_PART: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"c(\d+)").expect("Invalid regex pattern"));

/// A claimed function: `pf` is the zero-based bridge index, `vf` the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciFunction {
    pub pf: u32,
    pub vf: u32,
}

impl PciFunction {
    /// Flat function number the accelerator expects.
    pub fn physical_id(&self) -> u32 {
        self.pf * FUNCTIONS_PER_BRIDGE + self.vf
    }

    /// Address the function shows up at on the host.
    pub fn bdf(&self) -> String {
        format!("0000:{:02x}:{:02x}.0", self.pf + 1, self.vf)
    }
}

fn dir_names(dir: &Path) -> Result<Vec<String>> {
    match fs::read_dir(dir) {
        Ok(entries) => {
            let mut names: Vec<String> = entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            Ok(names)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// First slot with no device, scanning bridges `1..=bridges` in order.
pub fn free_function(paths: &HostPaths, bridges: u32) -> Result<PciFunction> {
    let present = dir_names(&paths.pci_devices())?;
    for bus in 1..=bridges {
        for slot in 0..FUNCTIONS_PER_BRIDGE {
            let prefix = format!("0000:{:02x}:{:02x}.", bus, slot);
            if !present.iter().any(|name| name.starts_with(&prefix)) {
                debug!(bus, slot, "Found free PCI function");
                return Ok(PciFunction { pf: bus - 1, vf: slot });
            }
        }
    }
    Err(CsiError::ResourceExhausted(format!(
        "no free PCI function on {} bridge(s)",
        bridges
    )))
}

/// Block device name for a namespace sysfs path, without the controller
/// part: `.../nvme0/nvme0c1n1/uuid` gives `nvme0n1`.
fn nvme_device_name(uuid_path: &Path) -> Option<String> {
    let namespace = uuid_path.parent()?.file_name()?.to_string_lossy();
    let found = NVME_SYSFS_NAME.find(&namespace)?;
    Some(NVME_CONTROLLER_PART.replace_all(found.as_str(), "").into_owned())
}

/// `*/nvme/nvme*/nvme*n*/uuid` files below one PCI device.
fn namespace_uuid_files(device_dir: &Path) -> Result<Vec<PathBuf>> {
    let nvme_dir = device_dir.join("nvme");
    let mut files = Vec::new();
    for controller in dir_names(&nvme_dir)? {
        if !controller.starts_with("nvme") {
            continue;
        }
        let controller_dir = nvme_dir.join(&controller);
        for namespace in dir_names(&controller_dir)? {
            if namespace.starts_with("nvme") && NVME_SYSFS_NAME.is_match(&namespace) {
                let uuid = controller_dir.join(namespace).join("uuid");
                if uuid.is_file() {
                    files.push(uuid);
                }
            }
        }
    }
    Ok(files)
}

/// NVMe namespace whose sysfs `uuid` equals `model`, searched below `bdf`
/// or below every PCI device.
pub fn find_nvme_device(paths: &HostPaths, model: &str, bdf: Option<&str>) -> Result<Option<String>> {
    let devices = match bdf {
        Some(bdf) => vec![bdf.to_string()],
        None => dir_names(&paths.pci_devices())?,
    };
    for device in devices {
        for uuid_file in namespace_uuid_files(&paths.pci_devices().join(&device))? {
            // The namespace may vanish between listing and reading
            let Ok(content) = fs::read_to_string(&uuid_file) else {
                continue;
            };
            if content.trim() == model {
                return Ok(nvme_device_name(&uuid_file));
            }
        }
    }
    Ok(None)
}

/// Block device below a virtio PCI function: the single entry of
/// `{bdf}/virtio*/block`.
pub fn find_virtio_device(paths: &HostPaths, bdf: &str) -> Result<Option<String>> {
    let device_dir = paths.pci_devices().join(bdf);
    for entry in dir_names(&device_dir)? {
        if !entry.starts_with("virtio") {
            continue;
        }
        let block = dir_names(&device_dir.join(entry).join("block"))?;
        match block.as_slice() {
            [] => continue,
            [name] => return Ok(Some(name.clone())),
            _ => {
                return Err(CsiError::Internal(format!(
                    "unexpected block devices below {}: {:?}",
                    bdf, block
                )));
            }
        }
    }
    Ok(None)
}

async fn wait_dev_node(paths: &HostPaths, poll: &PollConfig, name: &str) -> Result<String> {
    let node = paths.dev.join(name);
    poll.until(&node.display().to_string(), || node.exists().then_some(()))
        .await?;
    Ok(node.to_string_lossy().into_owned())
}

/// Wait for the namespace of `model` to appear (below `bdf` when given)
/// and return its `/dev` path.
pub async fn wait_nvme_device(
    paths: &HostPaths,
    poll: &PollConfig,
    model: &str,
    bdf: Option<&str>,
) -> Result<String> {
    let name = poll
        .until(&format!("nvme namespace {}", model), || {
            find_nvme_device(paths, model, bdf).ok().flatten()
        })
        .await?;
    wait_dev_node(paths, poll, &name).await
}

/// Wait for the virtio-blk device behind `bdf` and return its `/dev` path.
pub async fn wait_virtio_device(paths: &HostPaths, poll: &PollConfig, bdf: &str) -> Result<String> {
    let mut failure = None;
    let name = poll
        .until(&format!("virtio-blk device at {}", bdf), || {
            match find_virtio_device(paths, bdf) {
                Ok(found) => found,
                Err(e) => {
                    failure = Some(e);
                    None
                }
            }
        })
        .await;
    let name = match name {
        Ok(name) => name,
        Err(timeout) => return Err(failure.unwrap_or(timeout)),
    };
    wait_dev_node(paths, poll, &name).await
}

/// Wait until `device` no longer exists.
pub async fn wait_device_gone(poll: &PollConfig, device: &str) -> Result<()> {
    let path = Path::new(device);
    poll.until(&format!("{} to go away", device), || (!path.exists()).then_some(()))
        .await
}
