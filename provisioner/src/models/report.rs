// Stage outcomes and terminal reports
//
// Degraded-but-successful paths are explicit variants so callers (and tests) can match on
// them instead of inspecting logs.

use std::path::PathBuf;

use crate::error::Stage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationWarning {
    pub stage: Stage,
    pub message: String,
}

impl ConfigurationWarning {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

/// Paths produced by the stager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedArtifacts {
    pub executable: PathBuf,
    pub wrapper: Option<PathBuf>,
    pub updater: Option<PathBuf>,
    pub version_record: PathBuf,
    /// Wrapper was already present and not downloaded again.
    pub wrapper_cached: bool,
}

impl StagedArtifacts {
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut out = vec![self.executable.clone()];
        out.extend(self.wrapper.clone());
        out.extend(self.updater.clone());
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseOutcome {
    Applied { applied: Vec<String>, skipped: usize },
    /// Left for the service to migrate on first start.
    Deferred { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallOutcome {
    Configured {
        created: Vec<String>,
        already_present: Vec<String>,
    },
    Warned {
        created: Vec<String>,
        failures: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Absent,
    Registering,
    Configured,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub service_name: String,
    pub state: RegistrationState,
    /// Configuration sub-steps that failed (the registration itself stands).
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSummary {
    pub service_name: String,
    pub version: String,
    pub install_root: PathBuf,
    pub env_file: PathBuf,
    pub logs_dir: PathBuf,
    pub health_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceReport {
    Converged {
        summary: InstallSummary,
    },
    Diverged {
        summary: InstallSummary,
        observed: String,
        remediation: Vec<String>,
    },
}

impl ConvergenceReport {
    pub fn summary(&self) -> &InstallSummary {
        match self {
            ConvergenceReport::Converged { summary } => summary,
            ConvergenceReport::Diverged { summary, .. } => summary,
        }
    }

    pub fn is_converged(&self) -> bool {
        matches!(self, ConvergenceReport::Converged { .. })
    }

    pub fn render(&self) -> String {
        let s = self.summary();
        let mut out = String::new();
        match self {
            ConvergenceReport::Converged { .. } => {
                out.push_str(&format!(
                    "Service '{}' {} is running.\n",
                    s.service_name, s.version
                ));
            }
            ConvergenceReport::Diverged { observed, .. } => {
                out.push_str(&format!(
                    "Service '{}' {} was installed but is not running (status: {}).\n",
                    s.service_name, s.version, observed
                ));
            }
        }
        out.push_str(&format!("  Install directory: {}\n", s.install_root.display()));
        out.push_str(&format!("  Configuration:     {}\n", s.env_file.display()));
        out.push_str(&format!("  Logs:              {}\n", s.logs_dir.display()));
        out.push_str(&format!("  Health check:      {}\n", s.health_url));
        if let ConvergenceReport::Diverged { remediation, .. } = self {
            out.push_str("Next steps:\n");
            for (i, step) in remediation.iter().enumerate() {
                out.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }
        out
    }
}

/// Everything a completed (converged or diverged) run produced.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub correlation_id: String,
    pub version: String,
    pub staged: StagedArtifacts,
    pub env_file: PathBuf,
    pub env_created: bool,
    pub database: DatabaseOutcome,
    pub registration: Registration,
    pub firewall: FirewallOutcome,
    pub convergence: ConvergenceReport,
    pub warnings: Vec<ConfigurationWarning>,
}

impl PipelineReport {
    /// Operator summary: convergence report, then any warnings.
    pub fn render(&self) -> String {
        let mut out = self.convergence.render();
        if !self.warnings.is_empty() {
            out.push_str("Warnings:\n");
            for w in &self.warnings {
                out.push_str(&format!("  [{}] {}\n", w.stage, w.message));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> InstallSummary {
        InstallSummary {
            service_name: "sentinel-agent".to_string(),
            version: "1.2.3".to_string(),
            install_root: PathBuf::from("/opt/sentinel"),
            env_file: PathBuf::from("/opt/sentinel/.env"),
            logs_dir: PathBuf::from("/opt/sentinel/logs"),
            health_url: "http://localhost:3000/api/v1/health".to_string(),
        }
    }

    #[test]
    fn converged_render_has_locations_and_no_checklist() {
        let text = ConvergenceReport::Converged { summary: summary() }.render();
        assert!(text.contains("is running"));
        assert!(text.contains("/opt/sentinel/.env"));
        assert!(text.contains("/api/v1/health"));
        assert!(!text.contains("Next steps"));
    }

    #[test]
    fn diverged_render_numbers_remediation_steps() {
        let report = ConvergenceReport::Diverged {
            summary: summary(),
            observed: "stopped".to_string(),
            remediation: vec!["edit".to_string(), "start".to_string()],
        };
        assert!(!report.is_converged());
        let text = report.render();
        assert!(text.contains("status: stopped"));
        assert!(text.contains("  1. edit\n"));
        assert!(text.contains("  2. start\n"));
    }
}
