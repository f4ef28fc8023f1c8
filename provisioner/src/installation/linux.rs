// Linux backends
//
// - Service: systemd. `register` writes a bare unit; every setting is its own drop-in
//   (`<unit>.d/NN-<kind>.conf`) so a failed setting leaves the others in place.
// - Firewall: `ufw`, rules identified by their comment.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Duration;

use crate::installation::files::write_atomic;
use crate::installation::firewall::{FirewallManager, FirewallRule};
use crate::installation::service::{ServiceDefinition, ServiceManager, ServiceSetting, ServiceState};
use crate::installation::{run_checked, CommandRunner, CommandSpec};

pub const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";

const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(15);
const UFW_TIMEOUT: Duration = Duration::from_secs(20);

// ============================================================================
// Unit text (pure, testable on all platforms)
// ============================================================================

/// Bare unit: just enough to start the executable. Policy lives in drop-ins.
pub fn build_systemd_unit_text(service_name: &str, exec_path: &Path) -> String {
    let exec_quoted = quote_systemd_path(&exec_path.to_string_lossy());
    format!(
        r#"[Unit]
Description={service_name}
After=network.target

[Service]
Type=simple
ExecStart={exec_quoted}

[Install]
WantedBy=multi-user.target
"#
    )
}

/// Drop-in file name + contents for a setting, or `None` when it is not a drop-in.
pub fn build_drop_in(setting: &ServiceSetting) -> Option<(&'static str, String)> {
    let path = |p: &Path| p.to_string_lossy().to_string();
    match setting {
        ServiceSetting::DisplayName(d) => {
            Some(("10-display-name.conf", format!("[Unit]\nDescription={}\n", d)))
        }
        // systemd has a single Description; the long text goes into an extension key.
        ServiceSetting::Description(d) => Some((
            "20-description.conf",
            format!("[Unit]\nX-Sentinel-Description={}\n", d),
        )),
        ServiceSetting::StartAutomatic => None,
        ServiceSetting::WorkingDirectory(dir) => Some((
            "40-working-directory.conf",
            format!(
                "[Service]\nWorkingDirectory={}\n",
                quote_systemd_path(&path(dir))
            ),
        )),
        ServiceSetting::LogRedirection { stdout, stderr } => Some((
            "50-logging.conf",
            format!(
                "[Service]\nStandardOutput=append:{}\nStandardError=append:{}\n",
                path(stdout),
                path(stderr)
            ),
        )),
        // on-failure: a clean exit 0 is not restarted, every other exit is.
        ServiceSetting::RestartPolicy { delay } => Some((
            "60-restart.conf",
            format!(
                "[Service]\nRestart=on-failure\nRestartSec={}ms\n",
                delay.as_millis()
            ),
        )),
    }
}

/// Quote a path for systemd unit files if it contains spaces or quotes.
fn quote_systemd_path(path: &str) -> String {
    if path.contains(' ') || path.contains('\t') || path.contains('"') {
        format!("\"{}\"", path.replace('"', "\\\""))
    } else {
        path.to_string()
    }
}

pub fn parse_is_active(stdout: &str) -> ServiceState {
    match stdout.trim() {
        "active" | "reloading" => ServiceState::Running,
        "activating" => ServiceState::Starting,
        "inactive" | "deactivating" => ServiceState::Stopped,
        "failed" => ServiceState::Failed,
        "" => ServiceState::Other("unknown".to_string()),
        other => ServiceState::Other(other.to_string()),
    }
}

// ============================================================================
// systemd
// ============================================================================

pub struct SystemdServiceManager {
    runner: Arc<dyn CommandRunner>,
    unit_dir: PathBuf,
}

impl SystemdServiceManager {
    pub fn new(runner: Arc<dyn CommandRunner>, unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            unit_dir: unit_dir.into(),
        }
    }

    fn unit_path(&self, name: &str) -> PathBuf {
        self.unit_dir.join(format!("{}.service", name))
    }

    fn drop_in_dir(&self, name: &str) -> PathBuf {
        self.unit_dir.join(format!("{}.service.d", name))
    }

    async fn systemctl(&self, args: &[&str], operation: &str) -> Result<()> {
        let spec = CommandSpec::new("systemctl", args)
            .operation(operation)
            .timeout(SYSTEMCTL_TIMEOUT);
        run_checked(self.runner.as_ref(), &spec).await?;
        Ok(())
    }
}

#[async_trait]
impl ServiceManager for SystemdServiceManager {
    fn backend(&self) -> &'static str {
        "systemd"
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        if tokio::fs::try_exists(self.unit_path(name)).await.unwrap_or(false) {
            return Ok(true);
        }
        let unit = format!("{}.service", name);
        let spec = CommandSpec::new(
            "systemctl",
            &["list-unit-files", unit.as_str(), "--no-legend", "--no-pager"],
        )
        .operation("systemctl_list_unit_files")
        .timeout(SYSTEMCTL_TIMEOUT);
        let out = self.runner.run(&spec).await?;
        let listed = out
            .stdout
            .lines()
            .any(|l| l.split_whitespace().next() == Some(unit.as_str()));
        debug!(
            "[PHASE: installation] [STEP: service] systemd exists check (unit={}, listed={})",
            unit, listed
        );
        Ok(listed)
    }

    async fn register(&self, def: &ServiceDefinition) -> Result<()> {
        let path = self.unit_path(&def.name);
        let text = build_systemd_unit_text(&def.name, &def.executable);
        write_atomic(&path, text.as_bytes(), false)
            .await
            .with_context(|| format!("Failed to write unit file {:?}", path))?;
        self.systemctl(&["daemon-reload"], "systemctl_daemon_reload").await?;
        info!(
            "[PHASE: installation] [STEP: service] systemd unit written (path={:?})",
            path
        );
        Ok(())
    }

    async fn apply(&self, name: &str, setting: &ServiceSetting) -> Result<()> {
        match build_drop_in(setting) {
            Some((file, contents)) => {
                let path = self.drop_in_dir(name).join(file);
                write_atomic(&path, contents.as_bytes(), false)
                    .await
                    .with_context(|| format!("Failed to write drop-in {:?}", path))?;
                self.systemctl(&["daemon-reload"], "systemctl_daemon_reload").await
            }
            None => self.systemctl(&["enable", name], "systemctl_enable").await,
        }
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.systemctl(&["start", name], "systemctl_start").await
    }

    async fn status(&self, name: &str) -> Result<ServiceState> {
        // Non-zero exit for anything but "active"; stdout still names the state.
        let spec = CommandSpec::new("systemctl", &["is-active", name])
            .operation("systemctl_is_active")
            .timeout(SYSTEMCTL_TIMEOUT);
        let out = self.runner.run(&spec).await?;
        Ok(parse_is_active(&out.stdout))
    }

    fn removal_hint(&self, name: &str) -> String {
        format!(
            "systemctl disable --now {name} && rm -rf {unit} {dropins} && systemctl daemon-reload",
            name = name,
            unit = self.unit_path(name).display(),
            dropins = self.drop_in_dir(name).display()
        )
    }

    fn start_hint(&self, name: &str) -> String {
        format!("systemctl start {}", name)
    }
}

// ============================================================================
// ufw
// ============================================================================

pub struct UfwFirewall {
    runner: Arc<dyn CommandRunner>,
}

impl UfwFirewall {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

pub fn ufw_allow_args(rule: &FirewallRule) -> Vec<String> {
    vec![
        "allow".to_string(),
        format!("{}/{}", rule.port, rule.protocol.to_ascii_lowercase()),
        "comment".to_string(),
        rule.name.clone(),
    ]
}

/// `ufw status` prints the comment after `#` on each rule line.
pub fn ufw_status_has_rule(stdout: &str, name: &str) -> bool {
    stdout
        .lines()
        .filter_map(|l| l.split_once('#').map(|(_, c)| c.trim()))
        .any(|c| c == name)
}

#[async_trait]
impl FirewallManager for UfwFirewall {
    async fn rule_exists(&self, name: &str) -> Result<bool> {
        let spec = CommandSpec::new("ufw", &["status"])
            .operation("ufw_status")
            .timeout(UFW_TIMEOUT);
        let out = run_checked(self.runner.as_ref(), &spec).await?;
        Ok(ufw_status_has_rule(&out.stdout, name))
    }

    async fn add_rule(&self, rule: &FirewallRule) -> Result<()> {
        let spec = CommandSpec::new("ufw", &ufw_allow_args(rule))
            .operation("ufw_allow")
            .timeout(UFW_TIMEOUT)
            .no_retry();
        run_checked(self.runner.as_ref(), &spec).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeRunner;

    #[test]
    fn unit_text_has_required_sections_and_exec() {
        let unit = build_systemd_unit_text("sentinel-agent", Path::new("/opt/sentinel-agent/sentinel-agent"));
        let sections: Vec<&str> = unit
            .lines()
            .filter(|l| l.starts_with('[') && l.ends_with(']'))
            .collect();
        assert_eq!(sections, vec!["[Unit]", "[Service]", "[Install]"]);
        assert!(unit.contains("ExecStart=/opt/sentinel-agent/sentinel-agent"));
        assert!(!unit.contains("Restart="));
    }

    #[test]
    fn paths_with_spaces_are_quoted() {
        let unit = build_systemd_unit_text("t", Path::new("/opt/my app/agent"));
        assert!(unit.contains("ExecStart=\"/opt/my app/agent\""), "{}", unit);
        assert_eq!(quote_systemd_path("/opt/my\"app"), "\"/opt/my\\\"app\"");
    }

    #[test]
    fn restart_drop_in_is_on_failure_with_delay() {
        let (file, text) = build_drop_in(&ServiceSetting::RestartPolicy {
            delay: Duration::from_millis(5000),
        })
        .unwrap();
        assert_eq!(file, "60-restart.conf");
        assert!(text.contains("Restart=on-failure"));
        assert!(text.contains("RestartSec=5000ms"));
    }

    #[test]
    fn is_active_states() {
        assert_eq!(parse_is_active("active\n"), ServiceState::Running);
        assert_eq!(parse_is_active("inactive\n"), ServiceState::Stopped);
        assert_eq!(parse_is_active("failed"), ServiceState::Failed);
        assert_eq!(parse_is_active("activating"), ServiceState::Starting);
    }

    #[tokio::test]
    async fn register_and_apply_write_unit_and_drop_ins() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let mgr = SystemdServiceManager::new(runner.clone(), tmp.path());
        let def = ServiceDefinition {
            name: "sentinel-agent".to_string(),
            display_name: "Sentinel Agent".to_string(),
            description: "agent".to_string(),
            executable: PathBuf::from("/opt/s/sentinel-agent"),
            working_dir: PathBuf::from("/opt/s"),
            stdout_log: PathBuf::from("/opt/s/logs/service.out.log"),
            stderr_log: PathBuf::from("/opt/s/logs/service.err.log"),
            restart_delay: Duration::from_millis(5000),
        };

        assert!(!mgr.exists("sentinel-agent").await.unwrap());
        mgr.register(&def).await.unwrap();
        assert!(mgr.exists("sentinel-agent").await.unwrap());

        for s in def.settings() {
            mgr.apply(&def.name, &s).await.unwrap();
        }
        let d = tmp.path().join("sentinel-agent.service.d");
        let wd = std::fs::read_to_string(d.join("40-working-directory.conf")).unwrap();
        assert!(wd.contains("WorkingDirectory=/opt/s"));
        let logs = std::fs::read_to_string(d.join("50-logging.conf")).unwrap();
        assert!(logs.contains("StandardOutput=append:/opt/s/logs/service.out.log"));
        assert!(runner
            .call_lines()
            .iter()
            .any(|l| l == "systemctl enable sentinel-agent"));
    }

    #[tokio::test]
    async fn exists_consults_list_unit_files() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new().stdout_when(
            "list-unit-files",
            "sentinel-agent.service enabled enabled\n",
        ));
        let mgr = SystemdServiceManager::new(runner, tmp.path());
        assert!(mgr.exists("sentinel-agent").await.unwrap());
    }

    #[test]
    fn ufw_rule_lookup_by_comment() {
        let status = "Status: active\n\nTo                         Action      From\n--                         ------      ----\n3000/tcp                   ALLOW       Anywhere                   # Sentinel Agent (primary)\n";
        assert!(ufw_status_has_rule(status, "Sentinel Agent (primary)"));
        assert!(!ufw_status_has_rule(status, "Sentinel Agent (secondary)"));
        assert_eq!(
            ufw_allow_args(&FirewallRule::tcp("X", 3001)),
            vec!["allow", "3001/tcp", "comment", "X"]
        );
    }
}
