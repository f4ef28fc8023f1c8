// File deployment helpers
//
// - Executables land via `<dest>.partial` + rename; a failed write leaves nothing behind.
// - Asset copies retry sharing/lock violations (AV scanners and indexers on Windows).

use anyhow::{Context, Result};
use log::{debug, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, Duration};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

const COPY_TIMEOUT: Duration = Duration::from_secs(60);

fn is_lock_error(e: &io::Error) -> bool {
    // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION; EBUSY / ETXTBSY.
    let locked: &[i32] = if cfg!(windows) { &[32, 33] } else { &[16, 26] };
    e.raw_os_error().is_some_and(|code| locked.contains(&code))
}

async fn copy_file(src: &Path, dst: &Path, label: &str) -> Result<u64> {
    let strategy = ExponentialBackoff::from_millis(200)
        .factor(2)
        .max_delay(Duration::from_secs(2))
        .take(2)
        .map(jitter);

    RetryIf::start(
        strategy,
        || async {
            match timeout(COPY_TIMEOUT, tokio::fs::copy(src, dst)).await {
                Ok(res) => res,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "copy timed out")),
            }
        },
        |e: &io::Error| {
            let retry = is_lock_error(e);
            if retry {
                warn!(
                    "[PHASE: installation] [STEP: files] file locked, retrying copy (label={}, src={:?}, err={})",
                    label, src, e
                );
            }
            retry
        },
    )
    .await
    .with_context(|| format!("Failed to copy {:?} to {:?}", src, dst))
}

/// Copy every file under `src` into `dst`, overwriting existing files. Returns files copied.
pub async fn copy_dir_recursive(src: &Path, dst: &Path, label: &str) -> Result<usize> {
    let started = Instant::now();
    let mut copied = 0usize;
    let mut pending: Vec<PathBuf> = vec![PathBuf::new()];

    while let Some(rel_dir) = pending.pop() {
        let target_dir = dst.join(&rel_dir);
        tokio::fs::create_dir_all(&target_dir)
            .await
            .with_context(|| format!("Failed to create {:?}", target_dir))?;

        let source_dir = src.join(&rel_dir);
        let mut rd = tokio::fs::read_dir(&source_dir)
            .await
            .with_context(|| format!("read_dir failed: {:?}", source_dir))?;
        while let Some(ent) = rd.next_entry().await? {
            let rel = rel_dir.join(ent.file_name());
            let kind = ent.file_type().await?;
            if kind.is_dir() {
                pending.push(rel);
            } else if kind.is_file() {
                copy_file(&src.join(&rel), &dst.join(&rel), label).await?;
                copied += 1;
            }
        }
    }

    debug!(
        "[PHASE: installation] [STEP: files] copied tree (label={}, files={}, duration_ms={})",
        label,
        copied,
        started.elapsed().as_millis()
    );
    Ok(copied)
}

pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    dest.with_file_name(name)
}

/// Remove a file if present; missing files are not an error.
pub async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::Error::new(e)).with_context(|| format!("Failed to remove {:?}", path)),
    }
}

/// Write `bytes` to `<dest>.partial`, then rename over `dest`.
pub async fn write_atomic(dest: &Path, bytes: &[u8], executable: bool) -> Result<()> {
    let partial = partial_path(dest);
    let res = write_partial(&partial, bytes, executable).await;
    if let Err(e) = res {
        let _ = remove_file_if_exists(&partial).await;
        return Err(e);
    }
    promote_partial(&partial, dest).await
}

pub async fn write_partial(partial: &Path, bytes: &[u8], executable: bool) -> Result<()> {
    if let Some(parent) = partial.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let mut f = tokio::fs::File::create(partial)
        .await
        .with_context(|| format!("Failed to create {:?}", partial))?;
    f.write_all(bytes)
        .await
        .with_context(|| format!("Failed to write {:?}", partial))?;
    f.flush().await?;
    f.sync_all().await?;
    drop(f);
    if executable {
        set_executable(partial).await?;
    }
    Ok(())
}

/// Rename a finished `.partial` file into place.
pub async fn promote_partial(partial: &Path, dest: &Path) -> Result<()> {
    // Windows rename does not replace an existing file.
    #[cfg(windows)]
    remove_file_if_exists(dest).await?;

    if let Err(e) = tokio::fs::rename(partial, dest).await {
        let _ = remove_file_if_exists(partial).await;
        return Err(anyhow::Error::new(e))
            .with_context(|| format!("Failed to move {:?} into place at {:?}", partial, dest));
    }
    Ok(())
}

/// Move a finished `.partial` file to `dest` only if `dest` does not exist yet.
///
/// Returns `false` (and drops the partial) when `dest` is already there.
pub async fn publish_no_clobber(partial: &Path, dest: &Path) -> Result<bool> {
    let linked = match tokio::fs::hard_link(partial, dest).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        // No hard links on this filesystem.
        Err(e) => match tokio::fs::try_exists(dest).await {
            Ok(true) => Ok(false),
            Ok(false) => tokio::fs::rename(partial, dest)
                .await
                .map(|()| true)
                .map_err(|re| {
                    anyhow::Error::new(re).context(format!(
                        "Failed to move {:?} into place at {:?} (hard link failed: {})",
                        partial, dest, e
                    ))
                }),
            Err(xe) => Err(anyhow::Error::new(xe).context(format!("Failed to stat {:?}", dest))),
        },
    };
    if let Err(e) = remove_file_if_exists(partial).await {
        warn!(
            "[PHASE: installation] [STEP: files] leftover partial file (path={:?}): {:#}",
            partial, e
        );
    }
    linked
}

#[cfg(unix)]
pub async fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .with_context(|| format!("Failed to mark {:?} executable", path))
}

#[cfg(not(unix))]
pub async fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}
