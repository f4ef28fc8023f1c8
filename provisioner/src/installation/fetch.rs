// Remote fetch seam (manifest, artifacts, wrapper zip, source bundle)
//
// No retries here: the manifest read is safe to retry but the caller owns that policy,
// and a failed artifact download aborts the run.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use std::time::Instant;
use url::Url;

use crate::utils::logging::mask_url;

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// GET the URL and return the full body. Non-2xx statuses are errors.
    async fn get_bytes(&self, url: &Url) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("sentinel-provisioner/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get_bytes(&self, url: &Url) -> Result<Vec<u8>> {
        let started = Instant::now();
        let shown = mask_url(url.as_str());
        debug!(
            "[PHASE: installation] [STEP: fetch] get_bytes entered (url={})",
            shown
        );

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("Request to {} failed", shown))?;

        if !response.status().is_success() {
            anyhow::bail!("HTTP {} from {}", response.status(), shown);
        }

        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read response body from {}", shown))?;

        info!(
            "[PHASE: installation] [STEP: fetch] get_bytes exit (url={}, bytes={}, duration_ms={})",
            shown,
            bytes.len(),
            started.elapsed().as_millis()
        );
        Ok(bytes.to_vec())
    }
}

/// Substitute `{key}` placeholders and parse the result as a URL.
pub fn render_url_template(template: &str, vars: &[(&str, &str)]) -> Result<Url> {
    let mut rendered = template.to_string();
    for (k, v) in vars {
        rendered = rendered.replace(&format!("{{{}}}", k), v);
    }
    if rendered.contains('{') || rendered.contains('}') {
        anyhow::bail!("URL template has unresolved placeholders: {}", rendered);
    }
    Url::parse(&rendered).with_context(|| format!("Invalid URL: {}", rendered))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_url_template_substitutes_all_placeholders() {
        let url = render_url_template(
            "https://releases.example.com/v{version}/{artifact}",
            &[("version", "1.2.3"), ("artifact", "sentinel-agent.exe")],
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://releases.example.com/v1.2.3/sentinel-agent.exe"
        );
    }

    #[test]
    fn render_url_template_rejects_leftover_placeholders() {
        let err = render_url_template("https://x.example/{version}/{artifact}", &[("version", "1")])
            .unwrap_err();
        assert!(err.to_string().contains("unresolved"));
    }

    #[test]
    fn render_url_template_rejects_non_urls() {
        assert!(render_url_template("not a url {v}", &[("v", "1")]).is_err());
    }
}
