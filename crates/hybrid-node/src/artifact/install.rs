use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Component, Source};
use crate::error::{Error, Result};
use crate::tracker::Tracker;

/// Writes `source` to `dest` with permission `mode`.
///
/// The bytes land in a temporary file next to `dest` which is renamed into
/// place only once fully written and synced, so a crash never leaves a
/// partially written executable behind. Verification is left to the caller
/// (see [`install_verified`]).
pub async fn install_file<P: AsRef<Path>>(dest: P, source: &mut Source, mode: u32) -> Result<()> {
    let dest = dest.as_ref();
    debug!(source = source.name(), ?dest, "Installing artifact");
    write_atomic(dest, source, mode).await
}

/// Writes `contents` to `dest` atomically with permission `mode`.
pub async fn write_file<P, C>(dest: P, contents: C, mode: u32) -> Result<()>
where
    P: AsRef<Path>,
    C: AsRef<[u8]>,
{
    let mut reader = contents.as_ref();
    write_atomic(dest.as_ref(), &mut reader, mode).await
}

/// Installs `source` to `dest` and verifies its checksum.
///
/// The checksum is checked against the written temporary file, which only
/// replaces `dest` once it matches. A mismatching or interrupted write is
/// deleted with its temporary file and never appears at `dest`.
pub async fn install_verified<P: AsRef<Path>>(
    dest: P,
    source: &mut Source,
    mode: u32,
) -> Result<()> {
    let dest = dest.as_ref();
    debug!(source = source.name(), ?dest, "Installing artifact");
    let staged = stage(dest, source, mode).await?;
    if !source.verify_checksum() {
        let mismatch = source.checksum_error();
        warn!(?dest, error = %mismatch, "Discarding artifact that failed verification");
        return Err(mismatch);
    }
    persist(staged, dest)
}

/// Installs the artifact of `component` and records it in `tracker`.
///
/// The component is tracked only after the write and the checksum check both
/// succeeded. If tracking then fails the artifact stays on disk and
/// [`Error::Untracked`] is returned; nothing retries or rolls back the write.
pub async fn install_component<P: AsRef<Path>>(
    cancel: &CancellationToken,
    tracker: &Tracker,
    component: Component,
    dest: P,
    source: &mut Source,
    mode: u32,
) -> Result<()> {
    let dest = dest.as_ref();
    tokio::select! {
        installed = install_verified(dest, source, mode) => installed?,
        _ = cancel.cancelled() => {
            return Err(Error::Canceled {
                operation: format!("installing {}", component),
            });
        }
    }
    if let Err(e) = tracker.add(component).await {
        error!(%component, ?dest, error = %e, "Artifact installed but not tracked");
        return Err(Error::Untracked {
            component,
            path: dest.to_path_buf(),
            source: Box::new(e),
        });
    }
    info!(%component, ?dest, "Installed component");
    Ok(())
}

/// Removes a file or directory tree. A path that is already gone is success.
pub async fn remove_path<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io("inspecting path to remove", path, e)),
    };
    let removed = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match removed {
        Ok(()) => {
            debug!(?path, "Removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io("removing path", path, e)),
    }
}

async fn write_atomic<R>(dest: &Path, reader: &mut R, mode: u32) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let staged = stage(dest, reader, mode).await?;
    persist(staged, dest)
}

/// Writes `reader` to a synced temporary file next to `dest`. Dropping the
/// returned file deletes it.
async fn stage<R>(dest: &Path, reader: &mut R, mode: u32) -> Result<NamedTempFile>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let parent = dest
        .parent()
        .ok_or_else(|| Error::Configuration(format!("{:?} has no parent directory", dest)))?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| Error::io("creating parent directory", parent, e))?;

    let temp = tempfile::Builder::new()
        .prefix(".nodeadm-")
        .tempfile_in(parent)
        .map_err(|e| Error::io("creating temporary file", parent, e))?;
    let handle = temp
        .reopen()
        .map_err(|e| Error::io("opening temporary file", temp.path(), e))?;
    let mut file = tokio::fs::File::from_std(handle);

    tokio::io::copy(reader, &mut file)
        .await
        .map_err(|e| Error::io("writing artifact", dest, e))?;
    file.flush()
        .await
        .map_err(|e| Error::io("flushing artifact", dest, e))?;
    file.sync_all()
        .await
        .map_err(|e| Error::io("syncing artifact", dest, e))?;
    drop(file);

    tokio::fs::set_permissions(temp.path(), std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| Error::io("setting artifact mode", dest, e))?;
    Ok(temp)
}

fn persist(staged: NamedTempFile, dest: &Path) -> Result<()> {
    staged
        .persist(dest)
        .map_err(|e| Error::io("moving artifact into place", dest, e.error))?;
    Ok(())
}
