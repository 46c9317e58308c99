//! Atomic file operations
//!
//! Every durable write goes through [`write_atomic`]: contents land in a
//! sibling `.tmp` file which is then renamed over the target, so a crash
//! mid-write leaves either the old file or the new one, never a torn mix.

use crate::Result;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Sibling temp path used during an atomic write (`state.json` -> `state.json.tmp`)
pub fn temp_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    target.with_file_name(name)
}

/// Write `contents` to `target` atomically (temp file + fsync + rename)
///
/// Parent directories are created if missing.
pub fn write_atomic(target: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let temp = temp_path_for(target);
    {
        let mut file = fs::File::create(&temp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&temp, target) {
        let _ = fs::remove_file(&temp);
        return Err(e.into());
    }
    Ok(())
}

/// Restrict a file to owner read/write (0600). No-op off Unix.
#[cfg(unix)]
pub fn set_owner_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
pub fn set_owner_only(_path: &Path) -> Result<()> {
    Ok(())
}
