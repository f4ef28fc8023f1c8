// Artifact stager
//
// Places executables into the install layout:
// - main service executable: downloaded per resolved version
// - service wrapper utility: downloaded once, cached by versioned path
// - companion updater: built locally from source (deps -> compile -> packager -> package)
//
// Invariant: if staging an artifact fails, neither `<dest>.partial` nor `<dest>` remains.

use anyhow::{Context, Result};
use log::{info, warn};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::time::Duration;
use url::Url;

use crate::config::{UpdaterConfig, WrapperConfig};
use crate::error::ProvisionError;
use crate::installation::fetch::{render_url_template, Fetcher};
use crate::installation::files::{
    partial_path, promote_partial, remove_file_if_exists, set_executable, write_atomic,
};
use crate::installation::{resolve_program, run_checked, CommandRunner, CommandSpec};
use crate::models::layout::InstallLayout;
use crate::models::manifest::{InstallationManifest, VersionRecord};
use crate::models::report::StagedArtifacts;

/// Where to get the wrapper utility and where it lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperPlan {
    pub name: String,
    pub version: String,
    pub url: Url,
    pub zip_entry: String,
    pub executable_name: String,
}

impl WrapperPlan {
    pub fn from_config(cfg: &WrapperConfig, version: &str) -> Result<Self> {
        let url = render_url_template(&cfg.url_template, &[("version", version)])?;
        Ok(Self {
            name: cfg.name.clone(),
            version: version.to_string(),
            url,
            zip_entry: cfg.zip_entry_template.replace("{version}", version),
            executable_name: cfg.executable_name.clone(),
        })
    }

    pub fn destination(&self, layout: &InstallLayout) -> PathBuf {
        layout.wrapper_executable(&self.name, &self.version, &self.executable_name)
    }
}

/// Local build of the updater.
#[derive(Debug, Clone)]
pub struct UpdaterPlan {
    pub source_dir: PathBuf,
    pub build: UpdaterConfig,
    /// Directory holding the managed runtime's tools, when the bootstrapper located it.
    pub runtime_bin_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct StageRequest<'a> {
    pub manifest: &'a InstallationManifest,
    pub layout: &'a InstallLayout,
    pub executable_name: &'a str,
    pub updater_executable_name: &'a str,
    pub wrapper: Option<WrapperPlan>,
    /// `None` when the build is skipped.
    pub updater: Option<UpdaterPlan>,
}

pub struct Stager<'a> {
    fetcher: &'a dyn Fetcher,
    runner: &'a dyn CommandRunner,
}

impl<'a> Stager<'a> {
    pub fn new(fetcher: &'a dyn Fetcher, runner: &'a dyn CommandRunner) -> Self {
        Self { fetcher, runner }
    }

    pub async fn stage(&self, req: &StageRequest<'_>) -> Result<StagedArtifacts, ProvisionError> {
        let started = Instant::now();
        info!(
            "[PHASE: install] [STEP: stage] stage entered (version={}, root={:?}, wrapper={}, updater_build={})",
            req.manifest.version,
            req.layout.root(),
            req.wrapper.is_some(),
            req.updater.is_some()
        );

        req.layout
            .ensure()
            .await
            .map_err(|e| ProvisionError::staging("install layout", e))?;

        let executable = self
            .stage_executable(req)
            .await
            .map_err(|e| ProvisionError::staging(req.executable_name, e))?;

        let (wrapper, wrapper_cached) = match &req.wrapper {
            Some(plan) => {
                let (path, cached) = self
                    .stage_wrapper(plan, req.layout)
                    .await
                    .map_err(|e| ProvisionError::staging(format!("{} {}", plan.name, plan.version), e))?;
                (Some(path), cached)
            }
            None => (None, false),
        };

        let updater = match &req.updater {
            Some(plan) => {
                let dest = req.layout.updater_executable(req.updater_executable_name);
                Some(self.build_updater(plan, &dest).await?)
            }
            None => {
                info!("[PHASE: install] [STEP: stage] updater build skipped");
                None
            }
        };

        let version_record = req.layout.version_record();
        write_version_record(&version_record, &req.manifest.version)
            .await
            .map_err(|e| ProvisionError::staging("version record", e))?;

        info!(
            "[PHASE: install] [STEP: stage] stage exit ok (executable={:?}, wrapper={:?}, wrapper_cached={}, updater={:?}, duration_ms={})",
            executable,
            wrapper,
            wrapper_cached,
            updater,
            started.elapsed().as_millis()
        );

        Ok(StagedArtifacts {
            executable,
            wrapper,
            updater,
            version_record,
            wrapper_cached,
        })
    }

    async fn stage_executable(&self, req: &StageRequest<'_>) -> Result<PathBuf> {
        let url = req
            .manifest
            .artifact_url(req.executable_name)
            .ok_or_else(|| anyhow::anyhow!("No download URL for {}", req.executable_name))?;
        let dest = req.layout.executable(req.executable_name);
        self.download_to(url, &dest).await?;
        Ok(dest)
    }

    /// Download into place. On any failure the destination is removed too, so a stale or
    /// half-written executable can never be registered.
    async fn download_to(&self, url: &Url, dest: &Path) -> Result<()> {
        let res = async {
            let bytes = self.fetcher.get_bytes(url).await?;
            if bytes.is_empty() {
                anyhow::bail!("Downloaded artifact is empty ({})", url);
            }
            write_atomic(dest, &bytes, true).await
        }
        .await;

        if let Err(e) = res {
            discard_artifact(dest).await;
            return Err(e);
        }
        Ok(())
    }

    async fn stage_wrapper(&self, plan: &WrapperPlan, layout: &InstallLayout) -> Result<(PathBuf, bool)> {
        let dest = plan.destination(layout);
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            info!(
                "[PHASE: install] [STEP: stage] wrapper already present, skipping download (path={:?})",
                dest
            );
            return Ok((dest, true));
        }

        let res = async {
            let archive = self.fetcher.get_bytes(&plan.url).await?;
            let exe = extract_zip_entry(&archive, &plan.zip_entry)?;
            write_atomic(&dest, &exe, true).await
        }
        .await;

        if let Err(e) = res {
            discard_artifact(&dest).await;
            return Err(e);
        }
        Ok((dest, false))
    }

    async fn build_updater(&self, plan: &UpdaterPlan, dest: &Path) -> Result<PathBuf, ProvisionError> {
        let started = Instant::now();
        let partial = partial_path(dest);
        let output = partial.to_string_lossy().to_string();

        info!(
            "[PHASE: install] [STEP: updater_build] build_updater entered (source_dir={:?}, dest={:?})",
            plan.source_dir, dest
        );

        if !plan.source_dir.is_dir() {
            return Err(ProvisionError::staging(
                "updater",
                anyhow::anyhow!("Updater source directory not found: {:?}", plan.source_dir),
            ));
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {:?}", parent))
                .map_err(|e| ProvisionError::staging("updater", e))?;
        }

        let steps: [(&str, &[String]); 4] = [
            ("install_deps", &plan.build.install_deps),
            ("compile", &plan.build.compile),
            ("acquire_packager", &plan.build.acquire_packager),
            ("package", &plan.build.package),
        ];

        for (label, argv) in steps {
            let res = self.run_build_step(plan, label, argv, &output).await;
            if let Err(e) = res {
                discard_artifact(dest).await;
                return Err(ProvisionError::staging(format!("updater ({})", label), e));
            }
        }

        let finish = async {
            let meta = tokio::fs::metadata(&partial)
                .await
                .with_context(|| format!("Packager produced no output at {:?}", partial))?;
            if meta.len() == 0 {
                anyhow::bail!("Packager produced an empty file at {:?}", partial);
            }
            set_executable(&partial).await?;
            promote_partial(&partial, dest).await
        }
        .await;

        if let Err(e) = finish {
            discard_artifact(dest).await;
            return Err(ProvisionError::staging("updater (package)", e));
        }

        info!(
            "[PHASE: install] [STEP: updater_build] build_updater exit ok (dest={:?}, duration_ms={})",
            dest,
            started.elapsed().as_millis()
        );
        Ok(dest.to_path_buf())
    }

    async fn run_build_step(
        &self,
        plan: &UpdaterPlan,
        label: &str,
        argv: &[String],
        output: &str,
    ) -> Result<()> {
        let argv: Vec<String> = argv.iter().map(|a| a.replace("{output}", output)).collect();
        let mut spec = CommandSpec::from_argv(&argv)
            .with_context(|| format!("Updater build step '{}' is not configured", label))?
            .operation(format!("updater_{}", label))
            .timeout(Duration::from_secs(plan.build.step_timeout_secs))
            .cwd(&plan.source_dir);
        spec.program = resolve_program(&spec.program, plan.runtime_bin_dir.as_deref());

        info!(
            "[PHASE: install] [STEP: updater_build] {} ({})",
            label,
            spec.display()
        );
        run_checked(self.runner, &spec).await?;
        Ok(())
    }
}

async fn discard_artifact(dest: &Path) {
    for p in [partial_path(dest), dest.to_path_buf()] {
        if let Err(e) = remove_file_if_exists(&p).await {
            warn!(
                "[PHASE: install] [STEP: stage] Failed to remove incomplete artifact {:?}: {:#}",
                p, e
            );
        }
    }
}

/// Pull one file out of an in-memory zip archive.
pub fn extract_zip_entry(archive: &[u8], entry: &str) -> Result<Vec<u8>> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive)).context("Downloaded file is not a zip archive")?;
    let mut file = zip
        .by_name(entry)
        .with_context(|| format!("Archive has no entry '{}'", entry))?;
    // The declared size comes from the archive header and is not trusted.
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .with_context(|| format!("Failed to read archive entry '{}'", entry))?;
    if buf.is_empty() {
        anyhow::bail!("Archive entry '{}' is empty", entry);
    }
    Ok(buf)
}

/// Rewritten on every successful staging.
pub async fn write_version_record(path: &Path, version: &str) -> Result<()> {
    let record = VersionRecord::now(version);
    let bytes = serde_json::to_vec_pretty(&record).context("Failed to serialize version record")?;
    write_atomic(path, &bytes, false).await
}
