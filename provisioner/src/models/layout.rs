// On-disk install layout
//
// The layout is created once by the stager and never removed by the provisioner;
// uninstall is an operator action.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub const ENV_FILE_NAME: &str = ".env";
pub const VERSION_RECORD_FILE_NAME: &str = "version.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    root: PathBuf,
}

impl InstallLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn updates_dir(&self) -> PathBuf {
        self.root.join("updates")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    /// Schema + migrations copied from the release bundle.
    pub fn schema_dir(&self) -> PathBuf {
        self.root.join("schema")
    }

    pub fn migrations_dir(&self) -> PathBuf {
        self.schema_dir().join("migrations")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.root.join("tools")
    }

    pub fn env_file(&self) -> PathBuf {
        self.root.join(ENV_FILE_NAME)
    }

    pub fn version_record(&self) -> PathBuf {
        self.root.join(VERSION_RECORD_FILE_NAME)
    }

    pub fn executable(&self, executable_name: &str) -> PathBuf {
        self.root.join(executable_name)
    }

    pub fn updater_executable(&self, executable_name: &str) -> PathBuf {
        self.updates_dir().join(executable_name)
    }

    /// Wrapper utilities are versioned by path: `tools/<name>-<version>/<exe>`.
    pub fn wrapper_executable(&self, name: &str, version: &str, executable_name: &str) -> PathBuf {
        self.tools_dir()
            .join(format!("{}-{}", name, version))
            .join(executable_name)
    }

    pub fn database_file(&self, file_name: &str) -> PathBuf {
        self.data_dir().join(file_name)
    }

    /// `file:` URL for the data file. Always forward slashes, whatever the host OS.
    pub fn database_url(&self, file_name: &str) -> String {
        format!(
            "file:{}",
            forward_slashes(&self.database_file(file_name).to_string_lossy())
        )
    }

    pub fn all_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.root.clone(),
            self.data_dir(),
            self.logs_dir(),
            self.updates_dir(),
            self.backups_dir(),
            self.schema_dir(),
            self.tools_dir(),
        ]
    }

    /// Create-if-absent for the whole tree.
    pub async fn ensure(&self) -> Result<()> {
        for dir in self.all_dirs() {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create directory {:?}", dir))?;
        }
        Ok(())
    }
}

pub fn forward_slashes(path: &str) -> String {
    path.replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_url_uses_forward_slashes() {
        let layout = InstallLayout::new(r"C:\Program Files\Sentinel");
        assert_eq!(
            layout.database_url("sentinel.db"),
            "file:C:/Program Files/Sentinel/data/sentinel.db"
        );
    }

    #[test]
    fn wrapper_path_is_versioned() {
        let layout = InstallLayout::new("/opt/sentinel");
        let p = layout.wrapper_executable("nssm", "2.24", "nssm.exe");
        assert_eq!(p, PathBuf::from("/opt/sentinel/tools/nssm-2.24/nssm.exe"));
    }

    #[tokio::test]
    async fn ensure_creates_every_subdirectory_and_is_repeatable() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(tmp.path().join("install"));
        layout.ensure().await.unwrap();
        layout.ensure().await.unwrap();
        for dir in layout.all_dirs() {
            assert!(dir.is_dir(), "{:?} should exist", dir);
        }
    }
}
