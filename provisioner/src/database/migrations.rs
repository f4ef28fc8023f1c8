// Migration runner (SQLite data file)
//
// Layout: <root>/schema/migrations/<name>/migration.sql, applied in name order.
// Each migration runs in its own transaction and is recorded with the SHA-256 of its
// bytes. A recorded migration whose file changed is a checksum mismatch.
//
// The initializer never fails the install: every problem becomes `Deferred`, and the
// service migrates on its own first start.

use anyhow::{Context, Result};
use chrono::Utc;
use log::{info, warn};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs;

use crate::models::layout::InstallLayout;
use crate::models::report::DatabaseOutcome;
use crate::security::crypto::sha256_hex;

pub const HISTORY_TABLE: &str = "_provisioner_migrations";
const MIGRATION_FILE_NAME: &str = "migration.sql";

#[derive(Debug, Clone)]
pub struct MigrationFile {
    pub name: String,
    pub path: PathBuf,
    pub sql: String,
    pub checksum: String,
}

pub struct MigrationRunner {
    pool: SqlitePool,
    migrations_dir: PathBuf,
}

/// `file:/x/y.db`, `sqlite:///x/y.db`, `sqlite:/x/y.db` or a bare path -> filesystem path.
pub fn sqlite_path_from_url(url: &str) -> Result<PathBuf> {
    let trimmed = url.trim();
    let rest = ["sqlite://", "sqlite:", "file://", "file:"]
        .iter()
        .find_map(|p| trimmed.strip_prefix(p))
        .unwrap_or(trimmed);
    let rest = rest.split('?').next().unwrap_or(rest);
    if rest.is_empty() {
        anyhow::bail!("Database URL has no file path: {}", url);
    }
    Ok(PathBuf::from(rest))
}

/// Data file path for `url`. Relative paths are relative to the install root, which is the
/// service's working directory.
pub fn resolve_database_path(url: &str, root: &Path) -> Result<PathBuf> {
    let path = sqlite_path_from_url(url)?;
    if path.is_relative() {
        return Ok(root.join(path));
    }
    Ok(path)
}

impl MigrationRunner {
    pub async fn connect(path: &Path, migrations_dir: impl Into<PathBuf>) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create data directory {:?}", parent))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database file {:?}", path))?;

        Ok(Self {
            pool,
            migrations_dir: migrations_dir.into(),
        })
    }

    /// Migration directories sorted by name. Directories without `migration.sql` are skipped.
    pub async fn discover(&self) -> Result<Vec<MigrationFile>> {
        let mut dirs = Vec::new();
        let mut rd = fs::read_dir(&self.migrations_dir)
            .await
            .with_context(|| format!("read_dir failed: {:?}", self.migrations_dir))?;
        while let Some(ent) = rd.next_entry().await? {
            if ent.file_type().await?.is_dir() {
                dirs.push(ent.path());
            }
        }
        dirs.sort();

        let mut out = Vec::new();
        for dir in dirs {
            let path = dir.join(MIGRATION_FILE_NAME);
            if !path.is_file() {
                continue;
            }
            let bytes = fs::read(&path)
                .await
                .with_context(|| format!("Failed to read migration file: {:?}", path))?;
            let checksum = sha256_hex(&bytes);
            let sql = String::from_utf8(bytes)
                .with_context(|| format!("Migration file is not valid UTF-8: {:?}", path))?;
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            out.push(MigrationFile {
                name,
                path,
                sql,
                checksum,
            });
        }
        Ok(out)
    }

    async fn ensure_history_table(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
               migration_name TEXT PRIMARY KEY NOT NULL, \
               checksum TEXT NOT NULL, \
               applied_at TEXT NOT NULL)",
            HISTORY_TABLE
        );
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .context("Failed to create migration history table")?;
        Ok(())
    }

    /// name -> checksum of everything already applied.
    pub async fn applied(&self) -> Result<HashMap<String, String>> {
        self.ensure_history_table().await?;
        let rows: Vec<(String, String)> = sqlx::query_as(&format!(
            "SELECT migration_name, checksum FROM {}",
            HISTORY_TABLE
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to read migration history")?;
        Ok(rows.into_iter().collect())
    }

    pub async fn apply(&self, migration: &MigrationFile) -> Result<()> {
        let started = Instant::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        sqlx::raw_sql(&migration.sql)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to execute migration SQL: {}", migration.name))?;

        sqlx::query(&format!(
            "INSERT INTO {} (migration_name, checksum, applied_at) VALUES (?, ?, ?)",
            HISTORY_TABLE
        ))
        .bind(&migration.name)
        .bind(&migration.checksum)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to record applied migration: {}", migration.name))?;

        tx.commit().await.context("Failed to commit transaction")?;

        info!(
            "[PHASE: database] [STEP: apply_migration] applied {} ({}ms)",
            migration.name,
            started.elapsed().as_millis()
        );
        Ok(())
    }

    /// Apply everything pending. Returns (applied names, number already applied).
    pub async fn run(&self) -> Result<(Vec<String>, usize)> {
        let history = self.applied().await?;
        let mut applied = Vec::new();
        let mut skipped = 0;

        for migration in self.discover().await? {
            match history.get(&migration.name) {
                Some(recorded) if *recorded == migration.checksum => {
                    skipped += 1;
                }
                Some(recorded) => anyhow::bail!(
                    "Checksum mismatch for migration {}: recorded {}, file {}",
                    migration.name,
                    recorded,
                    migration.checksum
                ),
                None => {
                    self.apply(&migration).await?;
                    applied.push(migration.name.clone());
                }
            }
        }
        Ok((applied, skipped))
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// Apply pending migrations; any failure downgrades to `Deferred`.
pub async fn initialize(layout: &InstallLayout, database_url: &str) -> DatabaseOutcome {
    let started = Instant::now();
    let migrations_dir = layout.migrations_dir();
    info!(
        "[PHASE: install] [STEP: database] initialize entered (database_url={}, migrations_dir={:?})",
        database_url, migrations_dir
    );

    if !migrations_dir.is_dir() {
        return deferred(format!("no migrations found at {:?}", migrations_dir));
    }

    let result = match resolve_database_path(database_url, layout.root()) {
        Ok(path) => {
            info!(
                "[PHASE: install] [STEP: database] data file resolved (path={:?})",
                path
            );
            run_migrations(&path, &migrations_dir).await
        }
        Err(e) => Err(e),
    };
    match result {
        Ok((applied, skipped)) => {
            info!(
                "[PHASE: install] [STEP: database] initialize exit applied (applied={}, skipped={}, duration_ms={})",
                applied.len(),
                skipped,
                started.elapsed().as_millis()
            );
            DatabaseOutcome::Applied { applied, skipped }
        }
        Err(e) => deferred(format!("{:#}", e)),
    }
}

async fn run_migrations(database_path: &Path, migrations_dir: &Path) -> Result<(Vec<String>, usize)> {
    let runner = MigrationRunner::connect(database_path, migrations_dir).await?;
    let result = runner.run().await;
    runner.close().await;
    result
}

fn deferred(reason: String) -> DatabaseOutcome {
    warn!(
        "[PHASE: install] [STEP: database] migrations deferred to first service start: {}",
        reason
    );
    DatabaseOutcome::Deferred { reason }
}
