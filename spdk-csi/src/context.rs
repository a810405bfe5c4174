//! Node-local persisted connection state.
//!
//! Stage writes the volume context (and, on the offload path, the
//! accelerator handles) next to the staging directory so that unstage can
//! tear the connection down after a plugin restart.

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{CsiError, Result};

pub const VOLUME_CONTEXT_FILE: &str = "volume-context.json";
pub const XPU_CONTEXT_FILE: &str = "xpu-context.json";

pub type ContextMap = HashMap<String, String>;

/// Write `context` to `dir/file_name`, replacing any previous copy.
pub fn stash_context(dir: &Path, file_name: &str, context: &ContextMap) -> Result<()> {
    if dir.as_os_str().is_empty() {
        return Err(CsiError::InvalidArgument(format!(
            "no directory given for {}",
            file_name
        )));
    }
    fs::create_dir_all(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o755))?;

    let encoded = serde_json::to_vec(context)?;

    // Write atomically via unique temp file in the same directory
    let mut temp_file = NamedTempFile::new_in(dir)?;
    temp_file.write_all(&encoded)?;
    temp_file
        .as_file()
        .set_permissions(fs::Permissions::from_mode(0o600))?;
    temp_file
        .persist(dir.join(file_name))
        .map_err(|e| CsiError::Io(e.error))?;

    debug!(path = %dir.join(file_name).display(), "Stashed context");
    Ok(())
}

/// Read a stashed context. `Ok(None)` when the file does not exist.
pub fn lookup_context(dir: &Path, file_name: &str) -> Result<Option<ContextMap>> {
    let path = dir.join(file_name);
    match fs::read(&path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Remove a stashed context; a missing file is not an error.
pub fn cleanup_context(dir: &Path, file_name: &str) -> Result<()> {
    match fs::remove_file(dir.join(file_name)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
