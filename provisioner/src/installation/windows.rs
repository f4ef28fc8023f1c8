// Windows backends
//
// - Service: NSSM (staged wrapper utility) for register/configure/start/status,
//   `sc.exe query` for the existence check (works before NSSM is staged).
// - Firewall: `netsh advfirewall firewall`.
//
// Argument builders are pure so they are testable on every OS.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Duration;

use crate::installation::firewall::{FirewallManager, FirewallRule};
use crate::installation::service::{ServiceDefinition, ServiceManager, ServiceSetting, ServiceState};
use crate::installation::{run_checked, CommandRunner, CommandSpec};

const SC_TIMEOUT: Duration = Duration::from_secs(20);
const NSSM_TIMEOUT: Duration = Duration::from_secs(30);
const NETSH_TIMEOUT: Duration = Duration::from_secs(20);

/// `sc.exe query` exit code for "service does not exist".
const ERROR_SERVICE_DOES_NOT_EXIST: i32 = 1060;

pub struct NssmServiceManager {
    runner: Arc<dyn CommandRunner>,
    nssm: PathBuf,
}

impl NssmServiceManager {
    pub fn new(runner: Arc<dyn CommandRunner>, nssm: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            nssm: nssm.into(),
        }
    }

    fn nssm_spec(&self, args: &[String], operation: &str) -> CommandSpec {
        CommandSpec::new(self.nssm.to_string_lossy().to_string(), args)
            .operation(operation)
            .timeout(NSSM_TIMEOUT)
            .no_retry()
    }
}

pub fn nssm_install_args(def: &ServiceDefinition) -> Vec<String> {
    vec![
        "install".to_string(),
        def.name.clone(),
        def.executable.to_string_lossy().to_string(),
    ]
}

/// One setting can take several `nssm set` calls.
pub fn nssm_setting_args(name: &str, setting: &ServiceSetting) -> Vec<Vec<String>> {
    let set = |parts: &[&str]| -> Vec<String> {
        let mut v = vec!["set".to_string(), name.to_string()];
        v.extend(parts.iter().map(|p| p.to_string()));
        v
    };
    let path = |p: &Path| p.to_string_lossy().to_string();

    match setting {
        ServiceSetting::DisplayName(d) => vec![set(&["DisplayName", d.as_str()])],
        ServiceSetting::Description(d) => vec![set(&["Description", d.as_str()])],
        ServiceSetting::StartAutomatic => vec![set(&["Start", "SERVICE_AUTO_START"])],
        ServiceSetting::WorkingDirectory(dir) => vec![set(&["AppDirectory", path(dir).as_str()])],
        ServiceSetting::LogRedirection { stdout, stderr } => vec![
            set(&["AppStdout", path(stdout).as_str()]),
            set(&["AppStderr", path(stderr).as_str()]),
        ],
        ServiceSetting::RestartPolicy { delay } => {
            let ms = delay.as_millis().to_string();
            vec![
                set(&["AppExit", "Default", "Restart"]),
                set(&["AppExit", "0", "Exit"]),
                set(&["AppRestartDelay", ms.as_str()]),
            ]
        }
    }
}

/// `nssm status` prints e.g. `SERVICE_RUNNING`, sometimes as UTF-16 with embedded NULs.
pub fn parse_nssm_status(stdout: &str) -> ServiceState {
    let cleaned: String = stdout.chars().filter(|c| *c != '\0').collect();
    match cleaned.trim().to_ascii_uppercase().as_str() {
        "SERVICE_RUNNING" => ServiceState::Running,
        "SERVICE_START_PENDING" | "SERVICE_CONTINUE_PENDING" => ServiceState::Starting,
        "SERVICE_STOPPED" | "SERVICE_STOP_PENDING" => ServiceState::Stopped,
        "SERVICE_PAUSED" | "SERVICE_PAUSE_PENDING" => ServiceState::Paused,
        "" => ServiceState::Other("unknown".to_string()),
        other => ServiceState::Other(other.to_string()),
    }
}

#[async_trait]
impl ServiceManager for NssmServiceManager {
    fn backend(&self) -> &'static str {
        "nssm"
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let spec = CommandSpec::new("sc.exe", &["query", name])
            .operation("sc_query")
            .timeout(SC_TIMEOUT);
        let out = self.runner.run(&spec).await?;
        debug!(
            "[PHASE: installation] [STEP: service] sc query (service_name={}, exit_code={:?})",
            name, out.exit_code
        );
        match out.exit_code {
            Some(0) => Ok(true),
            Some(ERROR_SERVICE_DOES_NOT_EXIST) => Ok(false),
            other => anyhow::bail!(
                "sc.exe query {} exited with {:?}: {}",
                name,
                other,
                out.stderr.trim()
            ),
        }
    }

    async fn register(&self, def: &ServiceDefinition) -> Result<()> {
        let spec = self.nssm_spec(&nssm_install_args(def), "nssm_install");
        run_checked(self.runner.as_ref(), &spec).await?;
        info!(
            "[PHASE: installation] [STEP: service] nssm install ok (service_name={})",
            def.name
        );
        Ok(())
    }

    async fn apply(&self, name: &str, setting: &ServiceSetting) -> Result<()> {
        for args in nssm_setting_args(name, setting) {
            let spec = self.nssm_spec(&args, &format!("nssm_set_{}", setting.kind()));
            run_checked(self.runner.as_ref(), &spec).await?;
        }
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        let args = vec!["start".to_string(), name.to_string()];
        run_checked(self.runner.as_ref(), &self.nssm_spec(&args, "nssm_start")).await?;
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<ServiceState> {
        let args = vec!["status".to_string(), name.to_string()];
        let out = self
            .runner
            .run(&self.nssm_spec(&args, "nssm_status"))
            .await
            .context("nssm status failed to run")?;
        Ok(parse_nssm_status(&out.stdout))
    }

    fn removal_hint(&self, name: &str) -> String {
        format!("{} remove {} confirm", self.nssm.display(), name)
    }

    fn start_hint(&self, name: &str) -> String {
        format!("{} start {}", self.nssm.display(), name)
    }
}

pub struct NetshFirewall {
    runner: Arc<dyn CommandRunner>,
}

impl NetshFirewall {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

pub fn netsh_show_rule_args(name: &str) -> Vec<String> {
    vec![
        "advfirewall".to_string(),
        "firewall".to_string(),
        "show".to_string(),
        "rule".to_string(),
        format!("name={}", name),
    ]
}

pub fn netsh_add_rule_args(rule: &FirewallRule) -> Vec<String> {
    vec![
        "advfirewall".to_string(),
        "firewall".to_string(),
        "add".to_string(),
        "rule".to_string(),
        format!("name={}", rule.name),
        "dir=in".to_string(),
        "action=allow".to_string(),
        format!("protocol={}", rule.protocol),
        format!("localport={}", rule.port),
    ]
}

#[async_trait]
impl FirewallManager for NetshFirewall {
    async fn rule_exists(&self, name: &str) -> Result<bool> {
        let spec = CommandSpec::new("netsh", &netsh_show_rule_args(name))
            .operation("netsh_show_rule")
            .timeout(NETSH_TIMEOUT);
        // netsh exits 1 with "No rules match the specified criteria." when absent.
        let out = self.runner.run(&spec).await?;
        Ok(out.success())
    }

    async fn add_rule(&self, rule: &FirewallRule) -> Result<()> {
        let spec = CommandSpec::new("netsh", &netsh_add_rule_args(rule))
            .operation("netsh_add_rule")
            .timeout(NETSH_TIMEOUT)
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
    fn restart_policy_never_restarts_clean_exit() {
        let cmds = nssm_setting_args(
            "sentinel-agent",
            &ServiceSetting::RestartPolicy {
                delay: Duration::from_millis(5000),
            },
        );
        let lines: Vec<String> = cmds.iter().map(|c| c.join(" ")).collect();
        assert_eq!(
            lines,
            vec![
                "set sentinel-agent AppExit Default Restart",
                "set sentinel-agent AppExit 0 Exit",
                "set sentinel-agent AppRestartDelay 5000",
            ]
        );
    }

    #[test]
    fn log_redirection_sets_both_streams() {
        let cmds = nssm_setting_args(
            "svc",
            &ServiceSetting::LogRedirection {
                stdout: PathBuf::from(r"C:\S\logs\service.out.log"),
                stderr: PathBuf::from(r"C:\S\logs\service.err.log"),
            },
        );
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0][2], "AppStdout");
        assert_eq!(cmds[1][2], "AppStderr");
    }

    #[test]
    fn parses_nssm_status_including_utf16_noise() {
        assert_eq!(parse_nssm_status("SERVICE_RUNNING\r\n"), ServiceState::Running);
        assert_eq!(
            parse_nssm_status("S\0E\0R\0V\0I\0C\0E\0_\0S\0T\0O\0P\0P\0E\0D\0"),
            ServiceState::Stopped
        );
        assert_eq!(
            parse_nssm_status("SERVICE_START_PENDING"),
            ServiceState::Starting
        );
    }

    #[tokio::test]
    async fn exists_maps_sc_query_exit_codes() {
        let runner = Arc::new(FakeRunner::new().exit_code_when("query missing", 1060));
        let mgr = NssmServiceManager::new(runner.clone(), r"C:\S\tools\nssm-2.24\nssm.exe");
        assert!(!mgr.exists("missing").await.unwrap());
        assert!(mgr.exists("present").await.unwrap());

        let runner = Arc::new(FakeRunner::new().exit_code_when("sc.exe", 5));
        let mgr = NssmServiceManager::new(runner, "nssm.exe");
        assert!(mgr.exists("svc").await.is_err());

        let runner = Arc::new(FakeRunner::new().fail_spawn_when("sc.exe"));
        let mgr = NssmServiceManager::new(runner, "nssm.exe");
        let err = mgr.exists("svc").await.unwrap_err();
        assert!(err.to_string().contains("Failed to spawn"));
    }

    #[tokio::test]
    async fn register_uses_staged_nssm() {
        let runner = Arc::new(FakeRunner::new());
        let mgr = NssmServiceManager::new(runner.clone(), "/tools/nssm.exe");
        let def = ServiceDefinition {
            name: "svc".to_string(),
            display_name: "Svc".to_string(),
            description: "d".to_string(),
            executable: PathBuf::from("/root/agent.exe"),
            working_dir: PathBuf::from("/root"),
            stdout_log: PathBuf::from("/root/logs/o"),
            stderr_log: PathBuf::from("/root/logs/e"),
            restart_delay: Duration::from_secs(5),
        };
        mgr.register(&def).await.unwrap();
        mgr.apply("svc", &ServiceSetting::StartAutomatic).await.unwrap();
        assert_eq!(
            runner.call_lines(),
            vec![
                "/tools/nssm.exe install svc /root/agent.exe",
                "/tools/nssm.exe set svc Start SERVICE_AUTO_START",
            ]
        );
        assert!(mgr.removal_hint("svc").contains("remove svc confirm"));
    }

    #[test]
    fn netsh_add_rule_is_inbound_allow_on_port() {
        let args = netsh_add_rule_args(&FirewallRule::tcp("Sentinel Agent (primary)", 3000));
        assert!(args.contains(&"name=Sentinel Agent (primary)".to_string()));
        assert!(args.contains(&"dir=in".to_string()));
        assert!(args.contains(&"localport=3000".to_string()));
        assert!(args.contains(&"protocol=TCP".to_string()));
    }

    #[tokio::test]
    async fn netsh_rule_absent_when_show_fails() {
        let runner = Arc::new(FakeRunner::new().exit_code_when("show rule", 1));
        let fw = NetshFirewall::new(runner);
        assert!(!fw.rule_exists("Sentinel Agent (primary)").await.unwrap());
    }
}
