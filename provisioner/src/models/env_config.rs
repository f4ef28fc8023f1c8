// Environment file model (flat KEY=VALUE, UTF-8, no BOM)
//
// Keys are emitted in a fixed order so a freshly written file is stable and diffable.

use std::path::{Path, PathBuf};

use crate::config::EnvironmentDefaults;
use crate::models::layout::{forward_slashes, InstallLayout};

pub const KEY_PORT: &str = "PORT";
pub const KEY_SECONDARY_PORT: &str = "SECONDARY_PORT";
pub const KEY_MODE: &str = "APP_ENV";
pub const KEY_DATABASE_URL: &str = "DATABASE_URL";
pub const KEY_MONITOR_INTERVAL: &str = "MONITOR_INTERVAL_MS";
pub const KEY_MAX_RESTART_ATTEMPTS: &str = "MAX_RESTART_ATTEMPTS";
pub const KEY_RESTART_DELAY: &str = "RESTART_DELAY_MS";
pub const KEY_LOG_DIR: &str = "LOG_DIR";
pub const KEY_LOG_MAX_SIZE: &str = "LOG_MAX_SIZE";
pub const KEY_LOG_MAX_FILES: &str = "LOG_MAX_FILES";
pub const KEY_API_KEY: &str = "API_KEY";
pub const KEY_ALLOWED_IPS: &str = "ALLOWED_IPS";
pub const KEY_MONITORED_SERVICES: &str = "MONITORED_SERVICES";
pub const KEY_AUTO_UPDATE_ENABLED: &str = "AUTO_UPDATE_ENABLED";
pub const KEY_UPDATE_CHECK_INTERVAL: &str = "UPDATE_CHECK_INTERVAL_HOURS";
pub const KEY_AUTO_INSTALL_UPDATES: &str = "AUTO_INSTALL_UPDATES";
pub const KEY_UPDATE_BUCKET: &str = "UPDATE_BUCKET";
pub const KEY_UPDATE_REGION: &str = "UPDATE_REGION";

const UTF8_BOM: char = '\u{feff}';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentConfig {
    pub path: PathBuf,
    /// True only when this run wrote the file.
    pub created: bool,
    entries: Vec<(String, String)>,
}

/// Inputs for composing a brand new env file.
#[derive(Debug, Clone)]
pub struct EnvComposeInput<'a> {
    pub layout: &'a InstallLayout,
    pub port: u16,
    pub secondary_port: u16,
    pub api_key: &'a str,
    pub defaults: &'a EnvironmentDefaults,
}

impl EnvironmentConfig {
    pub fn compose(path: PathBuf, input: &EnvComposeInput<'_>) -> Self {
        let d = input.defaults;
        let layout = input.layout;
        let entries = vec![
            (KEY_PORT, input.port.to_string()),
            (KEY_SECONDARY_PORT, input.secondary_port.to_string()),
            (KEY_MODE, d.mode.clone()),
            (KEY_DATABASE_URL, layout.database_url(&d.database_file)),
            (KEY_MONITOR_INTERVAL, d.monitor_interval_ms.to_string()),
            (KEY_MAX_RESTART_ATTEMPTS, d.max_restart_attempts.to_string()),
            (KEY_RESTART_DELAY, d.restart_delay_ms.to_string()),
            (
                KEY_LOG_DIR,
                forward_slashes(&layout.logs_dir().to_string_lossy()),
            ),
            (KEY_LOG_MAX_SIZE, d.log_max_size.clone()),
            (KEY_LOG_MAX_FILES, d.log_max_files.to_string()),
            (KEY_API_KEY, input.api_key.to_string()),
            (KEY_ALLOWED_IPS, d.allowed_ips.clone()),
            (KEY_MONITORED_SERVICES, d.monitored_services.join(",")),
            (KEY_AUTO_UPDATE_ENABLED, d.auto_update_enabled.to_string()),
            (
                KEY_UPDATE_CHECK_INTERVAL,
                d.update_check_interval_hours.to_string(),
            ),
            (KEY_AUTO_INSTALL_UPDATES, d.auto_install_updates.to_string()),
            (KEY_UPDATE_BUCKET, d.update_bucket.clone()),
            (KEY_UPDATE_REGION, d.update_region.clone()),
        ];

        Self {
            path,
            created: true,
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    /// Parse an existing env file. Blank lines and `#` comments are skipped; a leading BOM
    /// (written by other tools) is tolerated on read.
    pub fn parse(path: &Path, contents: &str) -> Self {
        let contents = contents.strip_prefix(UTF8_BOM).unwrap_or(contents);
        let mut entries = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let value = value.trim();
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(value);
                entries.push((key.trim().to_string(), value.to_string()));
            }
        }
        Self {
            path: path.to_path_buf(),
            created: false,
            entries,
        }
    }

    /// Serialized file contents. Never starts with a BOM.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.entries {
            out.push_str(k);
            out.push('=');
            out.push_str(v);
            out.push('\n');
        }
        out.trim_start_matches(UTF8_BOM).to_string()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn port(&self) -> Option<u16> {
        self.get(KEY_PORT).and_then(|v| v.parse().ok())
    }

    pub fn secondary_port(&self) -> Option<u16> {
        self.get(KEY_SECONDARY_PORT).and_then(|v| v.parse().ok())
    }

    pub fn database_url(&self) -> Option<&str> {
        self.get(KEY_DATABASE_URL).filter(|v| !v.trim().is_empty())
    }

    pub fn api_key(&self) -> Option<&str> {
        self.get(KEY_API_KEY)
    }
}
