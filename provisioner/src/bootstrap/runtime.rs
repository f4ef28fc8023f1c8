// Managed runtime prerequisite
//
// detect -> (absent: install | below minimum: upgrade) -> re-locate -> re-verify
//
// After install/upgrade the runtime is looked up again over PATH plus the configured
// search dirs, since this process's PATH predates the install.

use anyhow::{Context, Result};
use log::{info, warn};
use regex::Regex;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Instant;
use tokio::time::Duration;

use crate::config::RuntimeConfig;
use crate::error::ProvisionError;
use crate::installation::{run_checked, CommandRunner, CommandSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeAction {
    AlreadySatisfied,
    Installed,
    Upgraded { from_major: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeStatus {
    pub program: PathBuf,
    pub major: u32,
    pub action: RuntimeAction,
}

impl RuntimeStatus {
    pub fn bin_dir(&self) -> Option<PathBuf> {
        self.program.parent().map(|p| p.to_path_buf())
    }
}

/// `v20.11.0` / `20.11.0` -> 20.
pub fn parse_major_version(output: &str) -> Option<u32> {
    let re = Regex::new(r"^v?(\d+)\.").ok()?;
    let first = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    re.captures(first)?.get(1)?.as_str().parse().ok()
}

pub struct RuntimeProvisioner<'a> {
    runner: &'a dyn CommandRunner,
    cfg: &'a RuntimeConfig,
}

impl<'a> RuntimeProvisioner<'a> {
    pub fn new(runner: &'a dyn CommandRunner, cfg: &'a RuntimeConfig) -> Self {
        Self { runner, cfg }
    }

    /// Configured search dirs first, then the current PATH.
    fn search_path(&self) -> Option<OsString> {
        let mut dirs: Vec<PathBuf> = self.cfg.search_dirs.iter().map(PathBuf::from).collect();
        if let Some(path) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&path));
        }
        std::env::join_paths(dirs).ok()
    }

    pub fn locate(&self) -> Option<PathBuf> {
        let cwd = std::env::current_dir().ok()?;
        which::which_in(&self.cfg.program, self.search_path(), cwd).ok()
    }

    /// Installed program + major version, or `None` when it is not on this host.
    pub async fn detect(&self) -> Result<Option<(PathBuf, u32)>> {
        let Some(program) = self.locate() else {
            return Ok(None);
        };
        let spec = CommandSpec::new(program.to_string_lossy().to_string(), &["--version"])
            .operation("runtime_version")
            .timeout(Duration::from_secs(15));
        let out = run_checked(self.runner, &spec).await?;
        let major = parse_major_version(&out.stdout).with_context(|| {
            format!(
                "Could not parse a version from `{} --version`: {}",
                program.display(),
                out.stdout.trim()
            )
        })?;
        Ok(Some((program, major)))
    }

    async fn run_configured(&self, argv: &[String], operation: &str) -> Result<()> {
        let spec = CommandSpec::from_argv(argv)
            .with_context(|| format!("No {} command configured", operation))?
            .operation(operation)
            .timeout(Duration::from_secs(self.cfg.command_timeout_secs))
            .no_retry();
        run_checked(self.runner, &spec).await?;
        Ok(())
    }

    pub async fn ensure(&self) -> Result<RuntimeStatus, ProvisionError> {
        let started = Instant::now();
        let min = self.cfg.min_major;
        info!(
            "[PHASE: bootstrap] [STEP: runtime] ensure entered (program={}, min_major={})",
            self.cfg.program, min
        );

        let detected = self
            .detect()
            .await
            .map_err(|e| ProvisionError::bootstrap("runtime", e))?;

        let action = match detected {
            Some((program, major)) if major >= min => {
                info!(
                    "[PHASE: bootstrap] [STEP: runtime] ensure exit ok (program={:?}, major={}, duration_ms={})",
                    program,
                    major,
                    started.elapsed().as_millis()
                );
                return Ok(RuntimeStatus {
                    program,
                    major,
                    action: RuntimeAction::AlreadySatisfied,
                });
            }
            Some((program, major)) => {
                warn!(
                    "[PHASE: bootstrap] [STEP: runtime] runtime too old, upgrading (program={:?}, major={}, min_major={})",
                    program, major, min
                );
                self.run_configured(&self.cfg.upgrade_command, "runtime_upgrade")
                    .await
                    .map_err(|e| ProvisionError::bootstrap("runtime", e))?;
                RuntimeAction::Upgraded { from_major: major }
            }
            None => {
                warn!(
                    "[PHASE: bootstrap] [STEP: runtime] runtime not found, installing (program={})",
                    self.cfg.program
                );
                self.run_configured(&self.cfg.install_command, "runtime_install")
                    .await
                    .map_err(|e| ProvisionError::bootstrap("runtime", e))?;
                RuntimeAction::Installed
            }
        };

        let (program, major) = self
            .detect()
            .await
            .and_then(|d| d.with_context(|| format!("{} still not found after install", self.cfg.program)))
            .map_err(|e| ProvisionError::bootstrap("runtime", e))?;
        if major < min {
            return Err(ProvisionError::bootstrap(
                "runtime",
                anyhow::anyhow!(
                    "{} is version {} after {:?}; {} or newer is required",
                    self.cfg.program,
                    major,
                    action,
                    min
                ),
            ));
        }

        info!(
            "[PHASE: bootstrap] [STEP: runtime] ensure exit ok (program={:?}, major={}, action={:?}, duration_ms={})",
            program,
            major,
            action,
            started.elapsed().as_millis()
        );
        Ok(RuntimeStatus {
            program,
            major,
            action,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{output, FakeRunner};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn parses_major_versions() {
        assert_eq!(parse_major_version("v20.11.0\n"), Some(20));
        assert_eq!(parse_major_version("18.19.1"), Some(18));
        assert_eq!(parse_major_version("\n  v9.0.0"), Some(9));
        assert_eq!(parse_major_version("node: command not found"), None);
        assert_eq!(parse_major_version(""), None);
    }

    fn config(search_dir: PathBuf, program: &str) -> RuntimeConfig {
        RuntimeConfig {
            program: program.to_string(),
            min_major: 18,
            install_command: vec!["install-runtime".to_string()],
            upgrade_command: vec!["upgrade-runtime".to_string()],
            search_dirs: vec![search_dir.to_string_lossy().to_string()],
            command_timeout_secs: 30,
        }
    }

    #[cfg(unix)]
    fn fake_program(dir: &std::path::Path, name: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let p = dir.join(name);
        std::fs::write(&p, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&p, std::fs::Permissions::from_mode(0o755)).unwrap();
        p
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn recent_runtime_is_left_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let program = fake_program(tmp.path(), "sentinel-test-node");
        let cfg = config(tmp.path().to_path_buf(), "sentinel-test-node");
        let runner = FakeRunner::new().stdout_when("--version", "v20.11.0\n");

        let status = RuntimeProvisioner::new(&runner, &cfg).ensure().await.unwrap();
        assert_eq!(status.action, RuntimeAction::AlreadySatisfied);
        assert_eq!(status.major, 20);
        assert_eq!(status.program, program);
        assert_eq!(status.bin_dir().unwrap(), tmp.path());
        assert_eq!(runner.calls().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn old_runtime_is_upgraded_and_reverified() {
        let tmp = tempfile::tempdir().unwrap();
        fake_program(tmp.path(), "sentinel-test-node");
        let cfg = config(tmp.path().to_path_buf(), "sentinel-test-node");
        let upgraded = Arc::new(AtomicBool::new(false));
        let flag = upgraded.clone();
        let flag2 = upgraded.clone();
        let runner = FakeRunner::new()
            .on(
                |s| s.program == "upgrade-runtime",
                move |_| {
                    flag.store(true, Ordering::SeqCst);
                    Ok(output(0, "", ""))
                },
            )
            .on(
                |s| s.args == vec!["--version".to_string()],
                move |_| {
                    let v = if flag2.load(Ordering::SeqCst) { "v20.1.0" } else { "v16.20.2" };
                    Ok(output(0, v, ""))
                },
            );

        let status = RuntimeProvisioner::new(&runner, &cfg).ensure().await.unwrap();
        assert_eq!(status.action, RuntimeAction::Upgraded { from_major: 16 });
        assert_eq!(status.major, 20);
        assert!(upgraded.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn missing_runtime_that_stays_missing_is_a_bootstrap_error() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(tmp.path().to_path_buf(), "sentinel-program-that-does-not-exist");
        let runner = FakeRunner::new();

        let err = RuntimeProvisioner::new(&runner, &cfg).ensure().await.unwrap_err();
        assert!(matches!(err, ProvisionError::Bootstrap { step: "runtime", .. }));
        assert_eq!(runner.call_lines(), vec!["install-runtime"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_upgrade_command_aborts() {
        let tmp = tempfile::tempdir().unwrap();
        fake_program(tmp.path(), "sentinel-test-node");
        let cfg = config(tmp.path().to_path_buf(), "sentinel-test-node");
        let runner = FakeRunner::new()
            .stdout_when("--version", "v14.0.0")
            .exit_code_when("upgrade-runtime", 1);

        let err = RuntimeProvisioner::new(&runner, &cfg).ensure().await.unwrap_err();
        assert!(err.to_string().contains("runtime"));
    }
}
