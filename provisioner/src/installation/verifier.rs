// Convergence verifier
//
// start -> settle delay -> one status query. No retry loop.
// Anything other than "running" is a Diverged report, never an error.

use log::{info, warn};
use std::time::Instant;
use tokio::time::Duration;

use crate::installation::service::{ServiceManager, ServiceState};
use crate::models::report::{ConvergenceReport, InstallSummary};

pub fn health_url(port: u16) -> String {
    format!("http://localhost:{}/api/v1/health", port)
}

pub async fn verify(
    manager: &dyn ServiceManager,
    summary: InstallSummary,
    settle_delay: Duration,
) -> ConvergenceReport {
    let started = Instant::now();
    let name = summary.service_name.clone();
    info!(
        "[PHASE: install] [STEP: verify] verify entered (service_name={}, settle_delay_ms={})",
        name,
        settle_delay.as_millis()
    );

    let observed = match manager.start(&name).await {
        Err(e) => {
            warn!(
                "[PHASE: install] [STEP: verify] start command failed (service_name={}): {:#}",
                name, e
            );
            format!("start failed: {:#}", e)
        }
        Ok(()) => {
            tokio::time::sleep(settle_delay).await;
            match manager.status(&name).await {
                Ok(ServiceState::Running) => {
                    info!(
                        "[PHASE: install] [STEP: verify] verify exit converged (service_name={}, duration_ms={})",
                        name,
                        started.elapsed().as_millis()
                    );
                    return ConvergenceReport::Converged { summary };
                }
                Ok(state) => state.to_string(),
                Err(e) => format!("status unavailable: {:#}", e),
            }
        }
    };

    let remediation = remediation_steps(manager, &summary);
    warn!(
        "[PHASE: install] [STEP: verify] verify exit diverged (service_name={}, observed={}, duration_ms={})",
        name,
        observed,
        started.elapsed().as_millis()
    );
    ConvergenceReport::Diverged {
        summary,
        observed,
        remediation,
    }
}

fn remediation_steps(manager: &dyn ServiceManager, s: &InstallSummary) -> Vec<String> {
    vec![
        format!("Review the configuration in {}", s.env_file.display()),
        format!(
            "Start the service manually: {}",
            manager.start_hint(&s.service_name)
        ),
        format!("Inspect the service logs in {}", s.logs_dir.display()),
        format!("Re-test the health endpoint: {}", s.health_url),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeServiceManager;
    use std::path::PathBuf;

    fn summary() -> InstallSummary {
        InstallSummary {
            service_name: "sentinel-agent".to_string(),
            version: "1.2.3".to_string(),
            install_root: PathBuf::from("/opt/s"),
            env_file: PathBuf::from("/opt/s/.env"),
            logs_dir: PathBuf::from("/opt/s/logs"),
            health_url: health_url(3000),
        }
    }

    #[tokio::test]
    async fn running_service_converges_after_single_check() {
        let mgr = FakeServiceManager::new();
        let report = verify(&mgr, summary(), Duration::ZERO).await;
        assert!(report.is_converged());
        assert_eq!(mgr.calls(), vec!["start sentinel-agent", "status sentinel-agent"]);
    }

    #[tokio::test]
    async fn stopped_service_diverges_with_checklist() {
        let mgr = FakeServiceManager::new().reports(ServiceState::Stopped);
        match verify(&mgr, summary(), Duration::ZERO).await {
            ConvergenceReport::Diverged {
                observed,
                remediation,
                ..
            } => {
                assert_eq!(observed, "stopped");
                assert_eq!(remediation.len(), 4);
                assert!(remediation[0].contains("/opt/s/.env"));
                assert!(remediation[1].contains("fake-start sentinel-agent"));
                assert!(remediation[2].contains("/opt/s/logs"));
                assert!(remediation[3].contains("/api/v1/health"));
            }
            other => panic!("expected diverged, got {:?}", other),
        }
        assert_eq!(mgr.calls().iter().filter(|c| c.starts_with("status")).count(), 1);
    }

    #[tokio::test]
    async fn waits_for_settle_delay_before_checking() {
        let mgr = FakeServiceManager::new();
        let before = Instant::now();
        verify(&mgr, summary(), Duration::from_millis(50)).await;
        assert!(before.elapsed() >= Duration::from_millis(50));
    }
}
