use anyhow::Result;
use std::path::{Path, PathBuf};

pub const LOG_DIR_ENV: &str = "SENTINEL_PROVISIONER_LOG_DIR";

/// Resolve the provisioner's own log folder (absolute path).
///
/// Never inside the install root: a run that fails before staging must not create
/// anything there.
pub fn resolve_log_folder() -> Result<PathBuf> {
    let dir = log_folder_candidate(
        std::env::var_os(LOG_DIR_ENV).map(PathBuf::from),
        dirs::data_local_dir(),
    );
    std::fs::create_dir_all(&dir)
        .map_err(|e| anyhow::anyhow!("Failed to create log folder {:?}: {}", dir, e))?;
    Ok(dir)
}

fn log_folder_candidate(override_dir: Option<PathBuf>, data_local: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = override_dir.filter(|d| !d.as_os_str().is_empty()) {
        return dir;
    }
    data_local
        .unwrap_or_else(std::env::temp_dir)
        .join("sentinel-provisioner")
        .join("logs")
}

/// Default install root for the current platform.
pub fn default_install_root() -> PathBuf {
    if cfg!(windows) {
        let base = std::env::var_os("ProgramFiles")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\Program Files"));
        base.join("Sentinel Agent")
    } else {
        PathBuf::from("/opt/sentinel-agent")
    }
}

/// Make a user-supplied path absolute against the current directory.
pub fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
