// Environment materializer
//
// - Existing env file: returned as-is, never rewritten (operators hand-edit it)
// - Missing env file: composed once, API key from a SecretProvider (generated when empty),
//   written to `.env.partial` and published without clobbering
// - Schema/migration assets: copied on every run (they ship with the release)

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::EnvironmentDefaults;
use crate::error::{ProvisionError, Stage};
use crate::installation::files::{
    copy_dir_recursive, partial_path, publish_no_clobber, remove_file_if_exists, write_partial,
};
use crate::models::env_config::{EnvComposeInput, EnvironmentConfig};
use crate::models::layout::InstallLayout;
use crate::models::report::ConfigurationWarning;
use crate::security::crypto::{generate_alphanumeric, secret_fingerprint, GENERATED_SECRET_LEN};

/// Supplies the operator's API secret for a fresh env file.
///
/// `None` or an empty string means "generate one".
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn provide(&self, key: &str) -> Result<Option<String>>;
}

/// Asks on the terminal. Without a terminal it behaves like [`GeneratedSecretProvider`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptSecretProvider;

#[async_trait]
impl SecretProvider for PromptSecretProvider {
    async fn provide(&self, key: &str) -> Result<Option<String>> {
        if !std::io::stdin().is_terminal() {
            return Ok(None);
        }
        let prompt = format!("Enter {} (leave empty to generate one): ", key);
        let line = tokio::task::spawn_blocking(move || -> Result<String> {
            let mut err = std::io::stderr();
            err.write_all(prompt.as_bytes())?;
            err.flush()?;
            let mut line = String::new();
            std::io::stdin()
                .read_line(&mut line)
                .context("Failed to read from terminal")?;
            Ok(line)
        })
        .await
        .context("Prompt task failed")??;
        Ok(Some(line.trim().to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct FixedSecretProvider(pub String);

#[async_trait]
impl SecretProvider for FixedSecretProvider {
    async fn provide(&self, _key: &str) -> Result<Option<String>> {
        Ok(Some(self.0.clone()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GeneratedSecretProvider;

#[async_trait]
impl SecretProvider for GeneratedSecretProvider {
    async fn provide(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

#[derive(Debug, Clone)]
pub struct MaterializeRequest<'a> {
    pub layout: &'a InstallLayout,
    pub port: u16,
    pub secondary_port: u16,
    pub defaults: &'a EnvironmentDefaults,
    /// `schema/` directory of the release bundle.
    pub schema_source: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Materialized {
    pub config: EnvironmentConfig,
    pub warnings: Vec<ConfigurationWarning>,
}

pub async fn materialize(
    req: &MaterializeRequest<'_>,
    secrets: &dyn SecretProvider,
) -> Result<Materialized, ProvisionError> {
    let started = Instant::now();
    let env_path = req.layout.env_file();
    info!(
        "[PHASE: install] [STEP: environment] materialize entered (env_file={:?}, port={}, secondary_port={})",
        env_path, req.port, req.secondary_port
    );

    req.layout.ensure().await?;

    let mut warnings = Vec::new();
    match &req.schema_source {
        Some(src) if src.is_dir() => {
            let copied = copy_dir_recursive(src, &req.layout.schema_dir(), "schema")
                .await
                .with_context(|| format!("Failed to copy schema assets from {:?}", src))?;
            info!(
                "[PHASE: install] [STEP: environment] schema assets copied (files={}, dest={:?})",
                copied,
                req.layout.schema_dir()
            );
        }
        other => {
            let msg = format!(
                "schema assets not found at {:?}; the service will create its schema on first start",
                other
            );
            warn!("[PHASE: install] [STEP: environment] {}", msg);
            warnings.push(ConfigurationWarning::new(Stage::Environment, msg));
        }
    }

    let config = match read_existing(&env_path).await? {
        Some(existing) => {
            info!(
                "[PHASE: install] [STEP: environment] env file exists, leaving it untouched (path={:?})",
                env_path
            );
            existing
        }
        None => create_env_file(req, &env_path, secrets).await?,
    };

    info!(
        "[PHASE: install] [STEP: environment] materialize exit (created={}, duration_ms={})",
        config.created,
        started.elapsed().as_millis()
    );
    Ok(Materialized { config, warnings })
}

async fn read_existing(path: &Path) -> Result<Option<EnvironmentConfig>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            Ok(Some(EnvironmentConfig::parse(path, &text)))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::Error::new(e)).with_context(|| format!("Failed to read {:?}", path)),
    }
}

async fn create_env_file(
    req: &MaterializeRequest<'_>,
    path: &Path,
    secrets: &dyn SecretProvider,
) -> Result<EnvironmentConfig> {
    let supplied = secrets
        .provide(crate::models::env_config::KEY_API_KEY)
        .await?
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let (api_key, generated) = match supplied {
        Some(s) => (s, false),
        None => (generate_alphanumeric(GENERATED_SECRET_LEN)?, true),
    };
    info!(
        "[PHASE: install] [STEP: environment] api key ready (generated={}, fingerprint={})",
        generated,
        secret_fingerprint(&api_key)
    );

    let config = EnvironmentConfig::compose(
        path.to_path_buf(),
        &EnvComposeInput {
            layout: req.layout,
            port: req.port,
            secondary_port: req.secondary_port,
            api_key: &api_key,
            defaults: req.defaults,
        },
    );

    // `.env` only ever appears complete: a crash mid-write leaves just `.env.partial`,
    // which the next run overwrites.
    let partial = partial_path(path);
    if let Err(e) = write_partial(&partial, config.render().as_bytes(), false).await {
        let _ = remove_file_if_exists(&partial).await;
        return Err(e.context(format!("Failed to write env file {:?}", path)));
    }
    if !publish_no_clobber(&partial, path).await? {
        warn!(
            "[PHASE: install] [STEP: environment] env file appeared concurrently, keeping it (path={:?})",
            path
        );
        return read_existing(path)
            .await?
            .ok_or_else(|| anyhow::anyhow!("env file vanished: {:?}", path));
    }

    info!(
        "[PHASE: install] [STEP: environment] env file created (path={:?}, keys={})",
        path,
        config.entries().len()
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::env_config::{KEY_API_KEY, KEY_DATABASE_URL, KEY_PORT};

    fn request<'a>(
        layout: &'a InstallLayout,
        defaults: &'a EnvironmentDefaults,
        schema_source: Option<PathBuf>,
    ) -> MaterializeRequest<'a> {
        MaterializeRequest {
            layout,
            port: 3000,
            secondary_port: 3001,
            defaults,
            schema_source,
        }
    }

    #[tokio::test]
    async fn existing_env_file_is_left_byte_identical() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(tmp.path().join("root"));
        layout.ensure().await.unwrap();
        let original = "\u{feff}# hand edited\nPORT=8080\nAPI_KEY=\"live-secret\"\r\nEXTRA=1";
        std::fs::write(layout.env_file(), original).unwrap();
        let defaults = EnvironmentDefaults::default();

        let out = materialize(
            &request(&layout, &defaults, None),
            &FixedSecretProvider("ignored".into()),
        )
        .await
        .unwrap();

        assert!(!out.config.created);
        assert_eq!(out.config.port(), Some(8080));
        assert_eq!(out.config.api_key(), Some("live-secret"));
        assert_eq!(std::fs::read_to_string(layout.env_file()).unwrap(), original);
    }

    #[tokio::test]
    async fn empty_secret_generates_32_alphanumeric_chars_that_differ_per_run() {
        let defaults = EnvironmentDefaults::default();
        let mut keys = Vec::new();
        for _ in 0..2 {
            let tmp = tempfile::tempdir().unwrap();
            let layout = InstallLayout::new(tmp.path().join("root"));
            let out = materialize(
                &request(&layout, &defaults, None),
                &FixedSecretProvider("   ".into()),
            )
            .await
            .unwrap();
            assert!(out.config.created);
            let key = out.config.api_key().unwrap().to_string();
            assert_eq!(key.len(), 32);
            assert!(key.chars().all(|c| c.is_ascii_alphanumeric()));
            keys.push(key);
        }
        assert_ne!(keys[0], keys[1]);
    }

    #[tokio::test]
    async fn fresh_file_has_no_bom_and_forward_slash_database_url() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(tmp.path().join("root"));
        let defaults = EnvironmentDefaults::default();
        materialize(
            &request(&layout, &defaults, None),
            &FixedSecretProvider("operator-secret".into()),
        )
        .await
        .unwrap();

        let bytes = std::fs::read(layout.env_file()).unwrap();
        assert!(!bytes.starts_with(&[0xEF, 0xBB, 0xBF]));
        let parsed = EnvironmentConfig::parse(&layout.env_file(), &String::from_utf8(bytes).unwrap());
        assert_eq!(parsed.get(KEY_PORT), Some("3000"));
        assert_eq!(parsed.get(KEY_API_KEY), Some("operator-secret"));
        let db = parsed.get(KEY_DATABASE_URL).unwrap();
        assert!(db.starts_with("file:"));
        assert!(!db.contains('\\'));
    }

    #[tokio::test]
    async fn rerun_keeps_first_secret() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(tmp.path().join("root"));
        let defaults = EnvironmentDefaults::default();
        let first = materialize(&request(&layout, &defaults, None), &GeneratedSecretProvider)
            .await
            .unwrap();
        let before = std::fs::read(layout.env_file()).unwrap();
        let second = materialize(&request(&layout, &defaults, None), &GeneratedSecretProvider)
            .await
            .unwrap();
        assert_eq!(first.config.api_key(), second.config.api_key());
        assert_eq!(before, std::fs::read(layout.env_file()).unwrap());
    }

    #[tokio::test]
    async fn stale_partial_from_interrupted_run_is_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(tmp.path().join("root"));
        layout.ensure().await.unwrap();
        let partial = partial_path(&layout.env_file());
        std::fs::write(&partial, "PORT=30").unwrap();
        let defaults = EnvironmentDefaults::default();

        let out = materialize(&request(&layout, &defaults, None), &GeneratedSecretProvider)
            .await
            .unwrap();

        assert!(out.config.created);
        assert_eq!(out.config.port(), Some(3000));
        assert_eq!(out.config.api_key().map(str::len), Some(32));
        assert!(!partial.exists());
        let written = std::fs::read_to_string(layout.env_file()).unwrap();
        assert_eq!(
            EnvironmentConfig::parse(&layout.env_file(), &written).api_key(),
            out.config.api_key()
        );
    }

    #[tokio::test]
    async fn failed_write_leaves_no_env_file_and_next_run_creates_it() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(tmp.path().join("root"));
        layout.ensure().await.unwrap();
        // A directory where the partial file should go makes the write fail.
        let partial = partial_path(&layout.env_file());
        std::fs::create_dir_all(&partial).unwrap();
        let defaults = EnvironmentDefaults::default();

        let err = materialize(&request(&layout, &defaults, None), &GeneratedSecretProvider)
            .await
            .unwrap_err();
        assert!(err.to_string().contains(".env"), "{}", err);
        assert!(!layout.env_file().exists());

        std::fs::remove_dir(&partial).unwrap();
        let out = materialize(&request(&layout, &defaults, None), &GeneratedSecretProvider)
            .await
            .unwrap();
        assert!(out.config.created);
        assert!(out.config.api_key().is_some());
    }

    #[tokio::test]
    async fn schema_assets_are_copied_and_missing_source_warns() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("bundle/schema");
        std::fs::create_dir_all(src.join("migrations/001_init")).unwrap();
        std::fs::write(src.join("migrations/001_init/migration.sql"), "CREATE TABLE t(id INTEGER);").unwrap();
        let layout = InstallLayout::new(tmp.path().join("root"));
        let defaults = EnvironmentDefaults::default();

        let out = materialize(&request(&layout, &defaults, Some(src)), &GeneratedSecretProvider)
            .await
            .unwrap();
        assert!(out.warnings.is_empty());
        assert!(layout.migrations_dir().join("001_init/migration.sql").is_file());

        let out = materialize(
            &request(&layout, &defaults, Some(tmp.path().join("nope"))),
            &GeneratedSecretProvider,
        )
        .await
        .unwrap();
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.warnings[0].stage, Stage::Environment);
    }
}
