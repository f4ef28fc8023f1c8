// Release manifest + version record models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// Wire shape of the remote manifest. Everything but `version` is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestBody {
    #[serde(default)]
    pub version: Option<String>,
}

/// A resolved release: the version to install and where each artifact lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationManifest {
    pub version: String,
    pub artifact_urls: BTreeMap<String, Url>,
}

impl InstallationManifest {
    pub fn artifact_url(&self, artifact: &str) -> Option<&Url> {
        self.artifact_urls.get(artifact)
    }
}

/// `version.json` in the install root, read by the companion updater to detect drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRecord {
    pub version: String,
    pub updated_at: DateTime<Utc>,
}

impl VersionRecord {
    pub fn now(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            updated_at: Utc::now(),
        }
    }
}
