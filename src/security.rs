#![forbid(unsafe_code)]

//! Privilege checks performed before the server touches the staging area.

use std::path::Path;

use anyhow::{Context, Result, bail};
use nix::unistd::Uid;

/// Refuses to run as root. The server executes an external downloader on
/// arbitrary user-supplied URLs and writes wherever its output template
/// points, so it must run under an unprivileged account.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::effective(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not be run as root; start it under a dedicated service account");
    }
    Ok(())
}

/// Rejects a world-writable media root. Staged files are streamed back and
/// then deleted, so other local users must not be able to plant or swap them.
pub fn ensure_private_staging(media_root: &Path) -> Result<()> {
    let metadata = std::fs::metadata(media_root)
        .with_context(|| format!("inspecting media root {}", media_root.display()))?;
    if !metadata.is_dir() {
        bail!("media root {} is not a directory", media_root.display());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o002 != 0 {
            bail!(
                "media root {} is world-writable; restrict it to the service account",
                media_root.display()
            );
        }
    }
    Ok(())
}
