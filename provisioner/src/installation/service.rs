// Service registrar
//
// State machine over one named OS service:
//   Absent -> Registering -> Configured   (Running/Stopped is owned by the OS)
//
// - A pre-existing registration is a hard stop (ConflictError); it is never reconfigured
//   or removed here.
// - Settings are applied one by one in a fixed order. A failed setting is a warning and
//   does not undo the ones before it.

use anyhow::Result;
use async_trait::async_trait;
use log::{error, info, warn};
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;
use tokio::time::Duration;

use crate::error::ProvisionError;
use crate::models::report::{Registration, RegistrationState};

/// Observed runtime state of a registered service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Starting,
    Stopped,
    Paused,
    Failed,
    NotInstalled,
    Other(String),
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Running => f.write_str("running"),
            ServiceState::Starting => f.write_str("starting"),
            ServiceState::Stopped => f.write_str("stopped"),
            ServiceState::Paused => f.write_str("paused"),
            ServiceState::Failed => f.write_str("failed"),
            ServiceState::NotInstalled => f.write_str("not installed"),
            ServiceState::Other(s) => write!(f, "{}", s),
        }
    }
}

/// One independently applied piece of service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceSetting {
    DisplayName(String),
    Description(String),
    /// Start automatically at boot.
    StartAutomatic,
    WorkingDirectory(PathBuf),
    LogRedirection { stdout: PathBuf, stderr: PathBuf },
    /// Exit code 0 is an intentional stop and is not restarted; any other exit restarts
    /// after `delay`.
    RestartPolicy { delay: Duration },
}

impl ServiceSetting {
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceSetting::DisplayName(_) => "display_name",
            ServiceSetting::Description(_) => "description",
            ServiceSetting::StartAutomatic => "start_mode",
            ServiceSetting::WorkingDirectory(_) => "working_directory",
            ServiceSetting::LogRedirection { .. } => "log_redirection",
            ServiceSetting::RestartPolicy { .. } => "restart_policy",
        }
    }
}

/// Everything needed to register the staged executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub executable: PathBuf,
    /// Install root; relative paths in the service's config resolve against it.
    pub working_dir: PathBuf,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    pub restart_delay: Duration,
}

impl ServiceDefinition {
    /// Settings in application order.
    pub fn settings(&self) -> Vec<ServiceSetting> {
        vec![
            ServiceSetting::DisplayName(self.display_name.clone()),
            ServiceSetting::Description(self.description.clone()),
            ServiceSetting::StartAutomatic,
            ServiceSetting::WorkingDirectory(self.working_dir.clone()),
            ServiceSetting::LogRedirection {
                stdout: self.stdout_log.clone(),
                stderr: self.stderr_log.clone(),
            },
            ServiceSetting::RestartPolicy {
                delay: self.restart_delay,
            },
        ]
    }
}

/// OS service manager backend (NSSM on Windows, systemd on Linux).
#[async_trait]
pub trait ServiceManager: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn exists(&self, name: &str) -> Result<bool>;

    /// Create the bare registration for `def.executable` under `def.name`.
    async fn register(&self, def: &ServiceDefinition) -> Result<()>;

    async fn apply(&self, name: &str, setting: &ServiceSetting) -> Result<()>;

    async fn start(&self, name: &str) -> Result<()>;

    async fn status(&self, name: &str) -> Result<ServiceState>;

    /// Operator command that removes an existing registration.
    fn removal_hint(&self, name: &str) -> String;

    /// Operator command that starts the service by hand.
    fn start_hint(&self, name: &str) -> String;
}

/// Fail with `Conflict` if anything is registered under `name`.
pub async fn check_no_conflict(
    manager: &dyn ServiceManager,
    name: &str,
) -> Result<(), ProvisionError> {
    let exists = manager
        .exists(name)
        .await
        .map_err(|cause| ProvisionError::Registration {
            service_name: name.to_string(),
            cause: cause.context("could not query the service manager"),
        })?;

    if exists {
        let remediation = manager.removal_hint(name);
        error!(
            "[PHASE: install] [STEP: register] existing registration found (service_name={}, backend={}, remediation={})",
            name,
            manager.backend(),
            remediation
        );
        return Err(ProvisionError::Conflict {
            service_name: name.to_string(),
            remediation,
        });
    }
    Ok(())
}

pub async fn register_service(
    manager: &dyn ServiceManager,
    def: &ServiceDefinition,
) -> Result<Registration, ProvisionError> {
    let started = Instant::now();
    let mut state = RegistrationState::Absent;
    info!(
        "[PHASE: install] [STEP: register] register_service entered (service_name={}, backend={}, executable={:?}, state={:?})",
        def.name,
        manager.backend(),
        def.executable,
        state
    );

    check_no_conflict(manager, &def.name).await?;

    state = RegistrationState::Registering;
    info!(
        "[PHASE: install] [STEP: register] registering (service_name={}, state={:?})",
        def.name, state
    );
    manager
        .register(def)
        .await
        .map_err(|cause| ProvisionError::Registration {
            service_name: def.name.clone(),
            cause,
        })?;

    let mut warnings = Vec::new();
    for setting in def.settings() {
        match manager.apply(&def.name, &setting).await {
            Ok(()) => info!(
                "[PHASE: install] [STEP: register] setting applied (service_name={}, setting={})",
                def.name,
                setting.kind()
            ),
            Err(e) => {
                let msg = format!("could not apply {} to '{}': {:#}", setting.kind(), def.name, e);
                warn!("[PHASE: install] [STEP: register] {}", msg);
                warnings.push(msg);
            }
        }
    }

    state = RegistrationState::Configured;
    info!(
        "[PHASE: install] [STEP: register] register_service exit (service_name={}, state={:?}, warnings={}, duration_ms={})",
        def.name,
        state,
        warnings.len(),
        started.elapsed().as_millis()
    );

    Ok(Registration {
        service_name: def.name.clone(),
        state,
        warnings,
    })
}
