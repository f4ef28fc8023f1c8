// Source bundle acquisition
//
// <temp>/<work dir name>/ is wiped, the archive is extracted into it, and one level of
// nesting (`pkg-main/...`) is flattened so `installer/install.toml` sits at the root.
//
// Entries whose names escape the destination (`../`, absolute paths) are skipped.

use anyhow::{Context, Result};
use log::{info, warn};
use serde::Deserialize;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tokio::fs;

pub const MANIFEST_RELATIVE_PATH: &str = "installer/install.toml";

/// `installer/install.toml`: where the bundle keeps what the pipeline consumes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BundleManifest {
    pub schema_dir: String,
    pub updater_source_dir: String,
}

impl Default for BundleManifest {
    fn default() -> Self {
        Self {
            schema_dir: "schema".to_string(),
            updater_source_dir: "updater".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedBundle {
    pub root: PathBuf,
    pub manifest: BundleManifest,
}

impl LocatedBundle {
    pub fn schema_source(&self) -> PathBuf {
        self.root.join(&self.manifest.schema_dir)
    }

    pub fn updater_source(&self) -> PathBuf {
        self.root.join(&self.manifest.updater_source_dir)
    }
}

/// Removes the work dir when dropped, on every exit path.
#[derive(Debug)]
pub struct WorkDirGuard {
    path: PathBuf,
    keep: bool,
}

impl WorkDirGuard {
    pub fn new(path: impl Into<PathBuf>, keep: bool) -> Self {
        Self {
            path: path.into(),
            keep,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkDirGuard {
    fn drop(&mut self) {
        if self.keep {
            info!(
                "[PHASE: bootstrap] [STEP: cleanup] keeping work dir (path={:?})",
                self.path
            );
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => info!(
                "[PHASE: bootstrap] [STEP: cleanup] removed work dir (path={:?})",
                self.path
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "[PHASE: bootstrap] [STEP: cleanup] failed to remove work dir (path={:?}): {}",
                self.path, e
            ),
        }
    }
}

/// Remove a stale copy and recreate the directory empty.
pub async fn prepare_work_dir(path: &Path) -> Result<()> {
    if fs::metadata(path).await.is_ok() {
        info!(
            "[PHASE: bootstrap] [STEP: bundle] removing stale work dir (path={:?})",
            path
        );
        fs::remove_dir_all(path)
            .await
            .with_context(|| format!("Failed to remove stale work dir {:?}", path))?;
    }
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create work dir {:?}", path))?;
    Ok(())
}

/// Extract a zip archive into `dest`. Returns the number of files written.
pub fn extract_archive(data: &[u8], dest: &Path) -> Result<usize> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create extract directory: {}", dest.display()))?;

    let mut archive =
        zip::ZipArchive::new(Cursor::new(data)).context("Failed to read bundle as zip archive")?;

    let mut written = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .with_context(|| format!("Failed to read zip entry {}", i))?;

        let outpath = match entry.enclosed_name() {
            Some(path) => dest.join(path),
            None => {
                warn!(
                    "[PHASE: bootstrap] [STEP: extract] skipping unsafe entry (name={})",
                    entry.name()
                );
                continue;
            }
        };

        if entry.is_dir() {
            std::fs::create_dir_all(&outpath)
                .with_context(|| format!("Failed to create directory: {}", outpath.display()))?;
            continue;
        }

        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create parent directory: {}", parent.display())
            })?;
        }

        let mut buffer = Vec::new();
        entry
            .read_to_end(&mut buffer)
            .with_context(|| format!("Failed to read zip entry: {}", entry.name()))?;
        let mut outfile = std::fs::File::create(&outpath)
            .with_context(|| format!("Failed to create file: {}", outpath.display()))?;
        outfile
            .write_all(&buffer)
            .with_context(|| format!("Failed to write file: {}", outpath.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                std::fs::set_permissions(&outpath, std::fs::Permissions::from_mode(mode & 0o777))
                    .with_context(|| format!("Failed to set permissions: {}", outpath.display()))?;
            }
        }
        written += 1;
    }
    Ok(written)
}

/// If `dir` holds exactly one entry and it is a directory, move its contents up one level.
///
/// The child is renamed aside first so a grandchild with the same name cannot collide.
pub async fn flatten_single_nesting(dir: &Path) -> Result<bool> {
    let mut entries = Vec::new();
    let mut rd = fs::read_dir(dir)
        .await
        .with_context(|| format!("read_dir failed: {:?}", dir))?;
    while let Some(ent) = rd.next_entry().await? {
        entries.push(ent);
    }
    if entries.len() != 1 || !entries[0].file_type().await?.is_dir() {
        return Ok(false);
    }

    let nested = entries[0].path();
    let aside = dir.join(format!(".flatten-{}", uuid::Uuid::new_v4()));
    fs::rename(&nested, &aside)
        .await
        .with_context(|| format!("Failed to move {:?} aside", nested))?;

    let mut moved = 0usize;
    let mut rd = fs::read_dir(&aside)
        .await
        .with_context(|| format!("read_dir failed: {:?}", aside))?;
    while let Some(ent) = rd.next_entry().await? {
        let target = dir.join(ent.file_name());
        fs::rename(ent.path(), &target)
            .await
            .with_context(|| format!("Failed to move {:?} to {:?}", ent.path(), target))?;
        moved += 1;
    }
    fs::remove_dir(&aside)
        .await
        .with_context(|| format!("Failed to remove emptied directory {:?}", aside))?;

    info!(
        "[PHASE: bootstrap] [STEP: flatten] flattened nested directory (nested={:?}, entries={})",
        nested, moved
    );
    Ok(true)
}

/// Find and parse `installer/install.toml` under `root`.
pub async fn locate_manifest(root: &Path) -> Result<LocatedBundle> {
    let path = root.join(MANIFEST_RELATIVE_PATH);
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("Bundle install descriptor not found at {:?}", path))?;
    let manifest: BundleManifest = toml::from_str(&text)
        .with_context(|| format!("Invalid bundle install descriptor {:?}", path))?;
    Ok(LocatedBundle {
        root: root.to_path_buf(),
        manifest,
    })
}
