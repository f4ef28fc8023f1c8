// Bootstrap wrapper
//
// runtime check/install -> bundle fetch/extract/flatten -> install pipeline (in-process)
//
// The pipeline's failure is returned as-is. The work dir guard removes the work dir on
// every exit path after the runtime step.

pub mod bundle;
pub mod runtime;

use anyhow::Context;
use log::{error, info};
use std::path::{Path, PathBuf};
use std::time::Instant;
use url::Url;

use crate::config::ProvisionerConfig;
use crate::error::{ProvisionError, Stage, StageFailure, StageResultExt};
use crate::installation::pipeline::{HostServices, InstallPipeline, InstallRequest};
use crate::models::report::PipelineReport;
use crate::utils::logging::mask_url;
use bundle::{
    extract_archive, flatten_single_nesting, locate_manifest, prepare_work_dir, LocatedBundle,
    WorkDirGuard,
};
use runtime::{RuntimeProvisioner, RuntimeStatus};

#[derive(Debug, Clone)]
pub struct BootstrapRequest {
    pub install: InstallRequest,
    pub bundle_url: String,
    pub keep_work_dir: bool,
}

#[derive(Debug, Clone)]
pub struct BootstrapReport {
    pub runtime: RuntimeStatus,
    pub bundle_root: PathBuf,
    pub pipeline: PipelineReport,
}

pub struct Bootstrapper {
    config: ProvisionerConfig,
    host: HostServices,
    work_parent: PathBuf,
}

impl Bootstrapper {
    pub fn new(config: ProvisionerConfig, host: HostServices) -> Self {
        Self {
            config,
            host,
            work_parent: std::env::temp_dir(),
        }
    }

    /// Parent of the work dir (defaults to the OS temp dir).
    pub fn with_work_parent(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_parent = dir.into();
        self
    }

    pub fn work_dir(&self) -> PathBuf {
        self.work_parent.join(&self.config.bootstrap.work_dir_name)
    }

    pub async fn run(&self, req: &BootstrapRequest) -> Result<BootstrapReport, StageFailure> {
        let started = Instant::now();
        info!(
            "[PHASE: bootstrap] [STEP: start] bootstrap entered (bundle_url={}, work_dir={:?}, keep_work_dir={})",
            mask_url(&req.bundle_url),
            self.work_dir(),
            req.keep_work_dir
        );

        let result = self.run_steps(req).await;
        match &result {
            Ok(report) => info!(
                "[PHASE: bootstrap] [STEP: done] bootstrap exit (converged={}, duration_ms={})",
                report.pipeline.convergence.is_converged(),
                started.elapsed().as_millis()
            ),
            Err(failure) => error!(
                "[PHASE: bootstrap] [STEP: done] bootstrap aborted (stage={}, duration_ms={}): {}",
                failure.stage,
                started.elapsed().as_millis(),
                failure
            ),
        }
        result
    }

    async fn run_steps(&self, req: &BootstrapRequest) -> Result<BootstrapReport, StageFailure> {
        let runtime = RuntimeProvisioner::new(self.host.runner.as_ref(), &self.config.runtime)
            .ensure()
            .await
            .at_stage(Stage::Runtime)?;

        let guard = WorkDirGuard::new(self.work_dir(), req.keep_work_dir);
        let bundle = self
            .fetch_bundle(&req.bundle_url, guard.path())
            .await
            .map_err(|e| ProvisionError::bootstrap("bundle", e).at(Stage::Bundle))?;
        info!(
            "[PHASE: bootstrap] [STEP: bundle] bundle ready (root={:?}, schema_dir={}, updater_source_dir={})",
            bundle.root, bundle.manifest.schema_dir, bundle.manifest.updater_source_dir
        );

        let mut install = req.install.clone();
        install.schema_source = Some(bundle.schema_source());
        install.updater_source = Some(bundle.updater_source());
        install.runtime_bin_dir = runtime.bin_dir();

        let pipeline = InstallPipeline::new(self.config.clone(), self.host.clone())
            .run(&install)
            .await?;

        Ok(BootstrapReport {
            runtime,
            bundle_root: bundle.root,
            pipeline,
        })
    }

    async fn fetch_bundle(&self, bundle_url: &str, work_dir: &Path) -> anyhow::Result<LocatedBundle> {
        prepare_work_dir(work_dir).await?;
        let url = Url::parse(bundle_url).with_context(|| format!("Invalid bundle URL: {}", bundle_url))?;
        let data = self.host.fetcher.get_bytes(&url).await?;

        let dest = work_dir.to_path_buf();
        let written = tokio::task::spawn_blocking(move || extract_archive(&data, &dest))
            .await
            .context("Bundle extraction task failed")??;
        info!(
            "[PHASE: bootstrap] [STEP: extract] extracted bundle (files={}, work_dir={:?})",
            written, work_dir
        );

        flatten_single_nesting(work_dir).await?;
        locate_manifest(work_dir).await
    }
}
