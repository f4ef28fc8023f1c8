// Error taxonomy for the provisioning pipeline.
//
// Fatal failures are `ProvisionError` values wrapped in a `StageFailure` naming the stage
// that produced them. Non-fatal outcomes (deferred migrations, firewall warnings, partial
// service configuration, a diverged service) are NOT errors; they live in `models::report`.

use std::fmt;
use thiserror::Error;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Runtime,
    Bundle,
    Preflight,
    Resolve,
    Stage,
    Environment,
    Database,
    Register,
    Firewall,
    Verify,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Runtime => "runtime",
            Stage::Bundle => "bundle",
            Stage::Preflight => "preflight",
            Stage::Resolve => "resolve",
            Stage::Stage => "stage",
            Stage::Environment => "environment",
            Stage::Database => "database",
            Stage::Register => "register",
            Stage::Firewall => "firewall",
            Stage::Verify => "verify",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a manifest could not be turned into a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionCause {
    Unreachable,
    Malformed,
    MissingVersion,
    InvalidVersion,
}

impl fmt::Display for ResolutionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResolutionCause::Unreachable => "manifest endpoint unreachable",
            ResolutionCause::Malformed => "manifest is not valid JSON",
            ResolutionCause::MissingVersion => "manifest has no version",
            ResolutionCause::InvalidVersion => "manifest version is not usable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("{cause} ({endpoint}): {detail}")]
    Resolution {
        endpoint: String,
        cause: ResolutionCause,
        detail: String,
    },

    #[error("failed to stage {artifact}: {cause:#}")]
    Staging {
        artifact: String,
        #[source]
        cause: anyhow::Error,
    },

    #[error(
        "service '{service_name}' is already registered. Remove the existing registration first ({remediation}) and re-run the installer"
    )]
    Conflict {
        service_name: String,
        remediation: String,
    },

    #[error("failed to register service '{service_name}': {cause:#}")]
    Registration {
        service_name: String,
        #[source]
        cause: anyhow::Error,
    },

    #[error("administrator privileges are required (re-run elevated / as root)")]
    NotElevated,

    #[error("bootstrap step '{step}' failed: {cause:#}")]
    Bootstrap {
        step: &'static str,
        #[source]
        cause: anyhow::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProvisionError {
    pub fn staging(artifact: impl Into<String>, cause: anyhow::Error) -> Self {
        ProvisionError::Staging {
            artifact: artifact.into(),
            cause,
        }
    }

    pub fn bootstrap(step: &'static str, cause: anyhow::Error) -> Self {
        ProvisionError::Bootstrap { step, cause }
    }

    pub fn at(self, stage: Stage) -> StageFailure {
        StageFailure { stage, error: self }
    }
}

/// The single top-level error surfaced to the operator.
#[derive(Debug, Error)]
#[error("stage '{stage}' failed: {error}")]
pub struct StageFailure {
    pub stage: Stage,
    #[source]
    pub error: ProvisionError,
}

/// Extension for tagging any stage result with its stage label.
pub trait StageResultExt<T> {
    fn at_stage(self, stage: Stage) -> Result<T, StageFailure>;
}

impl<T, E: Into<ProvisionError>> StageResultExt<T> for Result<T, E> {
    fn at_stage(self, stage: Stage) -> Result<T, StageFailure> {
        self.map_err(|e| e.into().at(stage))
    }
}
