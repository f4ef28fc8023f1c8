// Install pipeline
//
// preflight -> resolve -> stage -> environment -> database -> register -> firewall -> verify
//
// A strict fold: each stage returns its value or a StageFailure, and the first failure ends
// the run. From registration on, sub-step problems are collected as warnings instead.

use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::Duration;

use crate::config::ProvisionerConfig;
use crate::database::migrations;
use crate::error::{ProvisionError, Stage, StageFailure, StageResultExt};
use crate::installation::environment::{materialize, MaterializeRequest, SecretProvider};
use crate::installation::fetch::Fetcher;
use crate::installation::firewall::{configure_rules, required_rules, FirewallManager};
use crate::installation::resolver::resolve;
use crate::installation::service::{check_no_conflict, register_service, ServiceDefinition, ServiceManager};
use crate::installation::stager::{StageRequest, Stager, UpdaterPlan, WrapperPlan};
use crate::installation::verifier::{health_url, verify};
use crate::installation::CommandRunner;
use crate::models::layout::InstallLayout;
use crate::models::report::{
    ConfigurationWarning, DatabaseOutcome, FirewallOutcome, InstallSummary, PipelineReport,
};
use crate::utils::validation::{validate_ports, validate_service_name};

/// Operator-facing parameters for one run (CLI flags over config defaults).
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub service_name: String,
    pub display_name: String,
    pub description: String,
    pub install_root: PathBuf,
    pub port: u16,
    pub secondary_port: u16,
    pub skip_build: bool,
    pub wrapper_version: String,
    /// Schema + migrations shipped with the release bundle.
    pub schema_source: Option<PathBuf>,
    /// Updater sources; required unless `skip_build`.
    pub updater_source: Option<PathBuf>,
    /// Managed runtime tools located by the bootstrapper.
    pub runtime_bin_dir: Option<PathBuf>,
}

impl InstallRequest {
    pub fn layout(&self) -> InstallLayout {
        InstallLayout::new(self.install_root.clone())
    }
}

/// Every external collaborator the pipeline talks to.
#[derive(Clone)]
pub struct HostServices {
    pub fetcher: Arc<dyn Fetcher>,
    pub runner: Arc<dyn CommandRunner>,
    pub services: Arc<dyn ServiceManager>,
    pub firewall: Arc<dyn FirewallManager>,
    pub secrets: Arc<dyn SecretProvider>,
}

pub struct InstallPipeline {
    config: ProvisionerConfig,
    host: HostServices,
}

/// 0 for Converged and Diverged, 1 for any stage failure.
pub fn exit_code(result: &Result<PipelineReport, StageFailure>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

impl InstallPipeline {
    pub fn new(config: ProvisionerConfig, host: HostServices) -> Self {
        Self { config, host }
    }

    pub async fn run(&self, req: &InstallRequest) -> Result<PipelineReport, StageFailure> {
        let started = Instant::now();
        let correlation_id = uuid::Uuid::new_v4().to_string();
        info!(
            "[PHASE: install] [STEP: start] pipeline entered (correlation_id={}, service_name={}, install_root={:?}, port={}, skip_build={})",
            correlation_id, req.service_name, req.install_root, req.port, req.skip_build
        );

        let result = self.run_stages(req, &correlation_id).await;
        match &result {
            Ok(report) => info!(
                "[PHASE: install] [STEP: done] pipeline exit (correlation_id={}, converged={}, warnings={}, duration_ms={})",
                correlation_id,
                report.convergence.is_converged(),
                report.warnings.len(),
                started.elapsed().as_millis()
            ),
            Err(failure) => error!(
                "[PHASE: install] [STEP: done] pipeline aborted (correlation_id={}, stage={}, duration_ms={}): {}",
                correlation_id,
                failure.stage,
                started.elapsed().as_millis(),
                failure
            ),
        }
        result
    }

    async fn run_stages(
        &self,
        req: &InstallRequest,
        correlation_id: &str,
    ) -> Result<PipelineReport, StageFailure> {
        let cfg = &self.config;
        let layout = req.layout();
        let mut warnings: Vec<ConfigurationWarning> = Vec::new();

        // Preflight: nothing may be created or downloaded if the name is taken.
        validate_service_name(&req.service_name).at_stage(Stage::Preflight)?;
        validate_ports(req.port, req.secondary_port).at_stage(Stage::Preflight)?;
        check_no_conflict(self.host.services.as_ref(), &req.service_name)
            .await
            .at_stage(Stage::Preflight)?;

        let manifest = resolve(self.host.fetcher.as_ref(), &cfg.release)
            .await
            .at_stage(Stage::Resolve)?;

        let wrapper = if cfg.wrapper.enabled {
            Some(WrapperPlan::from_config(&cfg.wrapper, &req.wrapper_version).at_stage(Stage::Stage)?)
        } else {
            None
        };
        let updater = if req.skip_build {
            None
        } else {
            let source_dir = req.updater_source.clone().ok_or_else(|| {
                ProvisionError::staging(
                    "updater",
                    anyhow::anyhow!("no updater source directory (pass --source-dir or --skip-build)"),
                )
                .at(Stage::Stage)
            })?;
            Some(UpdaterPlan {
                source_dir,
                build: cfg.updater.clone(),
                runtime_bin_dir: req.runtime_bin_dir.clone(),
            })
        };
        let staged = Stager::new(self.host.fetcher.as_ref(), self.host.runner.as_ref())
            .stage(&StageRequest {
                manifest: &manifest,
                layout: &layout,
                executable_name: &cfg.release.executable_name,
                updater_executable_name: &cfg.release.updater_executable_name,
                wrapper,
                updater,
            })
            .await
            .at_stage(Stage::Stage)?;

        let env = materialize(
            &MaterializeRequest {
                layout: &layout,
                port: req.port,
                secondary_port: req.secondary_port,
                defaults: &cfg.environment,
                schema_source: req.schema_source.clone(),
            },
            self.host.secrets.as_ref(),
        )
        .await
        .at_stage(Stage::Environment)?;
        warnings.extend(env.warnings);
        let env = env.config;

        // An existing env file owns the ports.
        let port = env.port().unwrap_or(req.port);
        let secondary_port = env.secondary_port().unwrap_or(req.secondary_port);
        let database_url = env
            .database_url()
            .map(str::to_string)
            .unwrap_or_else(|| layout.database_url(&cfg.environment.database_file));

        let database = migrations::initialize(&layout, &database_url).await;
        if let DatabaseOutcome::Deferred { reason } = &database {
            warnings.push(ConfigurationWarning::new(
                Stage::Database,
                format!("migrations deferred to first service start: {}", reason),
            ));
        }

        let definition = ServiceDefinition {
            name: req.service_name.clone(),
            display_name: req.display_name.clone(),
            description: req.description.clone(),
            executable: staged.executable.clone(),
            working_dir: layout.root().to_path_buf(),
            stdout_log: layout.logs_dir().join(&cfg.service.stdout_log),
            stderr_log: layout.logs_dir().join(&cfg.service.stderr_log),
            restart_delay: Duration::from_millis(cfg.service.restart_delay_ms),
        };
        let registration = register_service(self.host.services.as_ref(), &definition)
            .await
            .at_stage(Stage::Register)?;
        warnings.extend(
            registration
                .warnings
                .iter()
                .map(|w| ConfigurationWarning::new(Stage::Register, w.clone())),
        );

        let firewall = configure_rules(
            self.host.firewall.as_ref(),
            &required_rules(&req.display_name, port, secondary_port),
        )
        .await;
        if let FirewallOutcome::Warned { failures, .. } = &firewall {
            warnings.extend(
                failures
                    .iter()
                    .map(|f| ConfigurationWarning::new(Stage::Firewall, f.clone())),
            );
        }

        let summary = InstallSummary {
            service_name: req.service_name.clone(),
            version: manifest.version.clone(),
            install_root: layout.root().to_path_buf(),
            env_file: env.path.clone(),
            logs_dir: layout.logs_dir(),
            health_url: health_url(port),
        };
        let convergence = verify(
            self.host.services.as_ref(),
            summary,
            Duration::from_millis(cfg.service.settle_delay_ms),
        )
        .await;

        for w in &warnings {
            warn!(
                "[PHASE: install] [STEP: summary] warning (stage={}): {}",
                w.stage, w.message
            );
        }

        Ok(PipelineReport {
            correlation_id: correlation_id.to_string(),
            version: manifest.version,
            staged,
            env_file: env.path.clone(),
            env_created: env.created,
            database,
            registration,
            firewall,
            convergence,
            warnings,
        })
    }
}
