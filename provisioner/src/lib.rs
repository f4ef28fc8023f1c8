// Sentinel Agent provisioner
// Main library entry point

pub mod bootstrap;
pub mod config;
pub mod database;
pub mod error;
pub mod installation;
pub mod models;
pub mod security;
pub mod utils;

#[cfg(test)]
mod test_support;

use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bootstrap::bundle::{locate_manifest, BundleManifest, LocatedBundle, MANIFEST_RELATIVE_PATH};
use crate::bootstrap::{BootstrapRequest, Bootstrapper};
use crate::config::ProvisionerConfig;
use crate::error::ProvisionError;
use crate::installation::environment::{
    FixedSecretProvider, GeneratedSecretProvider, PromptSecretProvider, SecretProvider,
};
use crate::installation::fetch::HttpFetcher;
use crate::installation::firewall::FirewallManager;
use crate::installation::linux::{SystemdServiceManager, UfwFirewall, DEFAULT_UNIT_DIR};
use crate::installation::pipeline::{exit_code, HostServices, InstallPipeline, InstallRequest};
use crate::installation::service::ServiceManager;
use crate::installation::stager::WrapperPlan;
use crate::installation::windows::{NetshFirewall, NssmServiceManager};
use crate::installation::{CommandRunner, SystemCommandRunner};
use crate::utils::logging::LogRecord;
use crate::utils::path_resolver::{absolutize, default_install_root};

/// Options shared by `install` and `bootstrap` (CLI flags, before config defaults apply).
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    pub service_name: String,
    pub install_path: Option<PathBuf>,
    pub display_name: String,
    pub description: String,
    pub port: u16,
    pub secondary_port: u16,
    pub skip_build: bool,
    pub wrapper_version: Option<String>,
    pub source_dir: Option<PathBuf>,
    pub api_key: Option<String>,
    pub non_interactive: bool,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct BootstrapOptions {
    pub install: InstallOptions,
    pub bundle_url: Option<String>,
    pub keep_work_dir: bool,
}

/// Initialize logging system with dual format (JSON + human-readable)
pub fn init_logging(with_stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let log_dir = utils::path_resolver::resolve_log_folder()?;

    let timestamp = chrono::Utc::now().format("%Y-%m-%d-%H%M%S");

    // JSON log file for structured parsing
    let json_log_file = log_dir.join(format!("provisioner-{}.log", timestamp));

    // Human-readable log file (.txt)
    let txt_log_file = log_dir.join(format!("provisioner-{}.txt", timestamp));

    // - JSON format to .log file
    // - Human-readable format to .txt file
    // - Human-readable to stdout at info and above (debug stays in the files)
    let mut dispatch = fern::Dispatch::new().level(log::LevelFilter::Debug);

    if with_stdout {
        dispatch = dispatch.chain(
            fern::Dispatch::new()
                .level(log::LevelFilter::Info)
                .format(|out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let line = LogRecord::parse(&message.to_string()).to_text(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                    );
                    out.finish(format_args!("{}", line));
                })
                .chain(std::io::stdout()),
        );
    }

    dispatch = dispatch
        .chain(
            fern::Dispatch::new()
                .format(|out, message, record| {
                    let line = LogRecord::parse(&message.to_string()).to_json(
                        &chrono::Utc::now().to_rfc3339(),
                        record.level(),
                        record.target(),
                    );
                    out.finish(format_args!("{}\n", line));
                })
                .chain(fern::log_file(json_log_file)?),
        )
        .chain(
            fern::Dispatch::new()
                .format(|out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let line = LogRecord::parse(&message.to_string()).to_text(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                    );
                    out.finish(format_args!("{}\n", line));
                })
                .chain(fern::log_file(txt_log_file)?),
        );

    dispatch.apply()?;

    log::info!(
        "[PHASE: initialization] Logging initialized, log directory: {:?}",
        log_dir
    );
    Ok(())
}

fn secret_provider(opts: &InstallOptions) -> Arc<dyn SecretProvider> {
    match &opts.api_key {
        Some(key) => Arc::new(FixedSecretProvider(key.clone())),
        None if opts.non_interactive => Arc::new(GeneratedSecretProvider),
        None => Arc::new(PromptSecretProvider),
    }
}

/// Platform backends: NSSM + netsh on Windows, systemd + ufw elsewhere.
fn host_services(
    cfg: &ProvisionerConfig,
    req: &InstallRequest,
    secrets: Arc<dyn SecretProvider>,
) -> anyhow::Result<HostServices> {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);
    let (services, firewall): (Arc<dyn ServiceManager>, Arc<dyn FirewallManager>) =
        if cfg!(windows) {
            let nssm = if cfg.wrapper.enabled {
                WrapperPlan::from_config(&cfg.wrapper, &req.wrapper_version)?
                    .destination(&req.layout())
            } else {
                PathBuf::from(&cfg.wrapper.executable_name)
            };
            (
                Arc::new(NssmServiceManager::new(runner.clone(), nssm)),
                Arc::new(NetshFirewall::new(runner.clone())),
            )
        } else {
            (
                Arc::new(SystemdServiceManager::new(runner.clone(), DEFAULT_UNIT_DIR)),
                Arc::new(UfwFirewall::new(runner.clone())),
            )
        };

    Ok(HostServices {
        fetcher: Arc::new(HttpFetcher::new()?),
        runner,
        services,
        firewall,
        secrets,
    })
}

/// `<dir>/installer/install.toml` if present, else the default relative locations.
async fn source_bundle(dir: &Path) -> LocatedBundle {
    match locate_manifest(dir).await {
        Ok(bundle) => bundle,
        Err(e) => {
            warn!(
                "[PHASE: install] [STEP: source] no {} under {:?}, using default locations: {:#}",
                MANIFEST_RELATIVE_PATH, dir, e
            );
            LocatedBundle {
                root: dir.to_path_buf(),
                manifest: BundleManifest::default(),
            }
        }
    }
}

async fn build_request(cfg: &ProvisionerConfig, opts: &InstallOptions) -> InstallRequest {
    let install_root = opts
        .install_path
        .as_deref()
        .map(absolutize)
        .unwrap_or_else(default_install_root);

    // Without --source-dir, the working directory counts only if it looks like a bundle.
    let source_dir = opts.source_dir.as_deref().map(absolutize).or_else(|| {
        std::env::current_dir()
            .ok()
            .filter(|cwd| cwd.join(MANIFEST_RELATIVE_PATH).is_file())
    });
    let (schema_source, updater_source) = match source_dir {
        Some(dir) => {
            let bundle = source_bundle(&dir).await;
            (Some(bundle.schema_source()), Some(bundle.updater_source()))
        }
        None => (None, None),
    };

    InstallRequest {
        service_name: opts.service_name.clone(),
        display_name: opts.display_name.clone(),
        description: opts.description.clone(),
        install_root,
        port: opts.port,
        secondary_port: opts.secondary_port,
        skip_build: opts.skip_build,
        wrapper_version: opts
            .wrapper_version
            .clone()
            .unwrap_or_else(|| cfg.wrapper.version.clone()),
        schema_source,
        updater_source,
        runtime_bin_dir: None,
    }
}

fn load_config(opts: &InstallOptions) -> Option<ProvisionerConfig> {
    match ProvisionerConfig::load(opts.config.as_deref()) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!("[PHASE: initialization] [STEP: config] {:#}", e);
            eprintln!("Error: {:#}", e);
            None
        }
    }
}

fn require_elevation() -> bool {
    if utils::privilege::is_elevated() {
        return true;
    }
    let err = ProvisionError::NotElevated;
    error!("[PHASE: preflight] [STEP: privilege] {}", err);
    eprintln!("Error: {}", err);
    false
}

/// `sentinel-provisioner install`. Returns the process exit code.
pub async fn run_install(opts: InstallOptions) -> i32 {
    if !require_elevation() {
        return 1;
    }
    let Some(cfg) = load_config(&opts) else {
        return 1;
    };

    let req = build_request(&cfg, &opts).await;
    let host = match host_services(&cfg, &req, secret_provider(&opts)) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return 1;
        }
    };

    let result = InstallPipeline::new(cfg, host).run(&req).await;
    match &result {
        Ok(report) => println!("{}", report.render()),
        Err(failure) => eprintln!("Error: {}", failure),
    }
    exit_code(&result)
}

/// `sentinel-provisioner bootstrap`. Returns the process exit code.
pub async fn run_bootstrap(opts: BootstrapOptions) -> i32 {
    if !require_elevation() {
        return 1;
    }
    let Some(cfg) = load_config(&opts.install) else {
        return 1;
    };

    let install = build_request(&cfg, &opts.install).await;
    let host = match host_services(&cfg, &install, secret_provider(&opts.install)) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return 1;
        }
    };
    let req = BootstrapRequest {
        install,
        bundle_url: opts
            .bundle_url
            .clone()
            .unwrap_or_else(|| cfg.bootstrap.bundle_url.clone()),
        keep_work_dir: opts.keep_work_dir,
    };

    match Bootstrapper::new(cfg, host).run(&req).await {
        Ok(report) => {
            info!(
                "[PHASE: bootstrap] [STEP: summary] runtime {:?} major {} ({:?})",
                report.runtime.program, report.runtime.major, report.runtime.action
            );
            println!("{}", report.pipeline.render());
            0
        }
        Err(failure) => {
            eprintln!("Error: {}", failure);
            1
        }
    }
}
