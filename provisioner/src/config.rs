// Provisioner configuration
//
// Layering (lowest to highest precedence):
//   1. Built-in defaults (`ProvisionerConfig::default()`, platform-aware)
//   2. Optional TOML file passed with `--config`
//   3. Environment variables `SENTINEL_PROVISIONER__<SECTION>__<KEY>`
//
// CLI flags are applied on top of the resolved config by `InstallRequest`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const ENV_PREFIX: &str = "SENTINEL_PROVISIONER";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    pub release: ReleaseConfig,
    pub wrapper: WrapperConfig,
    pub updater: UpdaterConfig,
    pub environment: EnvironmentDefaults,
    pub service: ServiceConfig,
    pub runtime: RuntimeConfig,
    pub bootstrap: BootstrapConfig,
}

impl ProvisionerConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&ProvisionerConfig::default())
            .context("Failed to serialize built-in configuration defaults")?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(p) = path {
            builder = builder.add_source(
                config::File::from(p)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("environment.monitored_services"),
        );

        let cfg = builder
            .build()
            .context("Failed to build provisioner configuration")?;
        cfg.try_deserialize::<ProvisionerConfig>()
            .context("Invalid provisioner configuration")
    }
}

/// Where releases come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    /// Per-environment manifest endpoint returning `{ "version": "..." }`.
    pub manifest_url: String,
    /// `{version}` and `{artifact}` are substituted.
    pub artifact_url_template: String,
    pub executable_name: String,
    pub updater_executable_name: String,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            manifest_url: "https://releases.sentinel-agent.dev/stable/version.json".to_string(),
            artifact_url_template:
                "https://releases.sentinel-agent.dev/stable/v{version}/{artifact}".to_string(),
            executable_name: platform_exe("sentinel-agent"),
            updater_executable_name: platform_exe("sentinel-updater"),
        }
    }
}

/// Third-party service wrapper utility (NSSM on Windows).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WrapperConfig {
    pub enabled: bool,
    pub name: String,
    pub version: String,
    /// `{version}` is substituted.
    pub url_template: String,
    /// Path of the executable inside the downloaded zip; `{version}` is substituted.
    pub zip_entry_template: String,
    pub executable_name: String,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            enabled: cfg!(windows),
            name: "nssm".to_string(),
            version: "2.24".to_string(),
            url_template: "https://nssm.cc/release/nssm-{version}.zip".to_string(),
            zip_entry_template: "nssm-{version}/win64/nssm.exe".to_string(),
            executable_name: "nssm.exe".to_string(),
        }
    }
}

/// Four-stage local build of the companion updater.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    pub install_deps: Vec<String>,
    pub compile: Vec<String>,
    pub acquire_packager: Vec<String>,
    /// `{output}` is substituted with the (temporary) output path.
    pub package: Vec<String>,
    pub step_timeout_secs: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        let target = if cfg!(windows) {
            "node18-win-x64"
        } else {
            "node18-linux-x64"
        };
        Self {
            install_deps: strings(&["npm", "install", "--no-audit", "--no-fund"]),
            compile: strings(&["npm", "run", "build"]),
            acquire_packager: strings(&["npm", "install", "--no-save", "pkg"]),
            package: vec![
                "npx".to_string(),
                "pkg".to_string(),
                ".".to_string(),
                "--targets".to_string(),
                target.to_string(),
                "--output".to_string(),
                "{output}".to_string(),
            ],
            step_timeout_secs: 600,
        }
    }
}

/// Values written into a freshly created env file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentDefaults {
    pub mode: String,
    pub database_file: String,
    pub monitor_interval_ms: u64,
    pub max_restart_attempts: u32,
    pub restart_delay_ms: u64,
    pub log_max_size: String,
    pub log_max_files: u32,
    pub allowed_ips: String,
    pub monitored_services: Vec<String>,
    pub auto_update_enabled: bool,
    pub update_check_interval_hours: u32,
    pub auto_install_updates: bool,
    pub update_bucket: String,
    pub update_region: String,
}

impl Default for EnvironmentDefaults {
    fn default() -> Self {
        Self {
            mode: "production".to_string(),
            database_file: "sentinel.db".to_string(),
            monitor_interval_ms: 30_000,
            max_restart_attempts: 3,
            restart_delay_ms: 5_000,
            log_max_size: "10m".to_string(),
            log_max_files: 14,
            allowed_ips: "*".to_string(),
            monitored_services: Vec::new(),
            auto_update_enabled: true,
            update_check_interval_hours: 6,
            auto_install_updates: false,
            update_bucket: "sentinel-agent-releases".to_string(),
            update_region: "us-east-1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub restart_delay_ms: u64,
    pub settle_delay_ms: u64,
    pub stdout_log: String,
    pub stderr_log: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: 5_000,
            settle_delay_ms: 5_000,
            stdout_log: "service.out.log".to_string(),
            stderr_log: "service.err.log".to_string(),
        }
    }
}

/// Managed runtime required by the bundle's build steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub program: String,
    pub min_major: u32,
    pub install_command: Vec<String>,
    pub upgrade_command: Vec<String>,
    pub search_dirs: Vec<String>,
    pub command_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        if cfg!(windows) {
            Self {
                program: "node".to_string(),
                min_major: 18,
                install_command: strings(&[
                    "winget",
                    "install",
                    "--id",
                    "OpenJS.NodeJS.LTS",
                    "-e",
                    "--silent",
                    "--accept-source-agreements",
                    "--accept-package-agreements",
                ]),
                upgrade_command: strings(&[
                    "winget",
                    "upgrade",
                    "--id",
                    "OpenJS.NodeJS.LTS",
                    "-e",
                    "--silent",
                    "--accept-source-agreements",
                    "--accept-package-agreements",
                ]),
                search_dirs: strings(&[r"C:\Program Files\nodejs"]),
                command_timeout_secs: 900,
            }
        } else {
            let script = "curl -fsSL https://deb.nodesource.com/setup_20.x | bash - && apt-get install -y nodejs";
            Self {
                program: "node".to_string(),
                min_major: 18,
                install_command: strings(&["sh", "-c", script]),
                upgrade_command: strings(&["sh", "-c", script]),
                search_dirs: strings(&["/usr/local/bin", "/usr/bin"]),
                command_timeout_secs: 900,
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub bundle_url: String,
    /// Directory name under the OS temp dir.
    pub work_dir_name: String,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            bundle_url: "https://github.com/sentinel-agent/sentinel-agent/archive/refs/heads/main.zip"
                .to_string(),
            work_dir_name: "sentinel-bootstrap".to_string(),
        }
    }
}

fn platform_exe(stem: &str) -> String {
    if cfg!(windows) {
        format!("{}.exe", stem)
    } else {
        stem.to_string()
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_without_file_uses_defaults() {
        let cfg = ProvisionerConfig::load(None).expect("defaults should load");
        assert_eq!(cfg.service.settle_delay_ms, 5_000);
        assert_eq!(cfg.service.restart_delay_ms, 5_000);
        assert_eq!(cfg.environment.allowed_ips, "*");
        assert!(cfg.release.artifact_url_template.contains("{version}"));
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provisioner.toml");
        std::fs::write(
            &path,
            r#"
[release]
manifest_url = "http://127.0.0.1:9/version.json"

[service]
settle_delay_ms = 250

[environment]
monitored_services = ["redis", "postgres"]
"#,
        )
        .unwrap();

        let cfg = ProvisionerConfig::load(Some(&path)).expect("file config should load");
        assert_eq!(cfg.release.manifest_url, "http://127.0.0.1:9/version.json");
        assert_eq!(cfg.service.settle_delay_ms, 250);
        assert_eq!(cfg.environment.monitored_services, vec!["redis", "postgres"]);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.service.restart_delay_ms, 5_000);
        assert_eq!(cfg.runtime.program, "node");
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let res = ProvisionerConfig::load(Some(&dir.path().join("absent.toml")));
        assert!(res.is_err());
    }
}
