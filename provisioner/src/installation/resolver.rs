// Artifact resolver
//
// resolve(manifest endpoint) -> { version, artifact urls }. Pure read, no internal retries.

use log::{error, info};
use std::collections::BTreeMap;
use std::time::Instant;
use url::Url;

use crate::config::ReleaseConfig;
use crate::error::{ProvisionError, ResolutionCause};
use crate::installation::fetch::{render_url_template, Fetcher};
use crate::models::manifest::{InstallationManifest, ManifestBody};
use crate::utils::logging::mask_url;
use crate::utils::validation::is_valid_release_version;

pub async fn resolve(
    fetcher: &dyn Fetcher,
    release: &ReleaseConfig,
) -> Result<InstallationManifest, ProvisionError> {
    let started = Instant::now();
    let endpoint = mask_url(&release.manifest_url);
    info!(
        "[PHASE: install] [STEP: resolve] resolve entered (endpoint={})",
        endpoint
    );

    let fail = |cause: ResolutionCause, detail: String| {
        error!(
            "[PHASE: install] [STEP: resolve] resolution failed (endpoint={}, cause={}, detail={})",
            endpoint, cause, detail
        );
        ProvisionError::Resolution {
            endpoint: endpoint.clone(),
            cause,
            detail,
        }
    };

    let manifest_url = Url::parse(&release.manifest_url)
        .map_err(|e| fail(ResolutionCause::Unreachable, format!("invalid endpoint: {}", e)))?;

    let body = fetcher
        .get_bytes(&manifest_url)
        .await
        .map_err(|e| fail(ResolutionCause::Unreachable, format!("{:#}", e)))?;

    let parsed: ManifestBody = serde_json::from_slice(&body)
        .map_err(|e| fail(ResolutionCause::Malformed, e.to_string()))?;

    let version = match parsed.version.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => {
            return Err(fail(
                ResolutionCause::MissingVersion,
                "field `version` is absent or empty".to_string(),
            ))
        }
    };

    if !is_valid_release_version(&version) {
        return Err(fail(
            ResolutionCause::InvalidVersion,
            format!("'{}' cannot be used in artifact paths", version),
        ));
    }

    let mut artifact_urls = BTreeMap::new();
    for artifact in [&release.executable_name, &release.updater_executable_name] {
        let url = render_url_template(
            &release.artifact_url_template,
            &[("version", version.as_str()), ("artifact", artifact.as_str())],
        )
        .map_err(|e| fail(ResolutionCause::InvalidVersion, format!("{:#}", e)))?;
        artifact_urls.insert(artifact.clone(), url);
    }

    info!(
        "[PHASE: install] [STEP: resolve] resolve exit (version={}, artifacts={}, duration_ms={})",
        version,
        artifact_urls.len(),
        started.elapsed().as_millis()
    );

    Ok(InstallationManifest {
        version,
        artifact_urls,
    })
}
