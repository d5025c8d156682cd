//! Schema Migration Runner
//!
//! Applies ordered `NNNN_name.sql` scripts to the relational store and
//! records each applied file in the `schema_migrations` ledger. Scripts come
//! either from the set compiled into the crate or from a directory chosen at
//! run time.
//!
//! # Guarantees
//!
//! - Files are applied in lexical filename order; `*_rollback.sql` files are
//!   never applied forward
//! - Each file runs in its own transaction together with its ledger row, so a
//!   file is either fully applied and recorded or not at all
//! - The first failure rolls that file back and halts the run; earlier files
//!   stay applied
//! - Running twice applies nothing the second time
//!
//! `rollback_last_migration` runs the matching `NNNN_name_rollback.sql` and
//! removes the ledger row.

use crate::db::error::{StoreError, StoreResult};
use crate::db::pool::{ConnectionPool, PooledConnection};
use libsql::params::Params;
use libsql::Value as SqlValue;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

const LEDGER_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    filename TEXT NOT NULL UNIQUE,
    applied_at TEXT NOT NULL
)";

const ROLLBACK_SUFFIX: &str = "_rollback.sql";

/// Scripts under `migrations/`, embedded at compile time
const BUNDLED_MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_initial_schema.sql",
        include_str!("../../migrations/0001_initial_schema.sql"),
    ),
    (
        "0001_initial_schema_rollback.sql",
        include_str!("../../migrations/0001_initial_schema_rollback.sql"),
    ),
    (
        "0002_search_markers.sql",
        include_str!("../../migrations/0002_search_markers.sql"),
    ),
    (
        "0002_search_markers_rollback.sql",
        include_str!("../../migrations/0002_search_markers_rollback.sql"),
    ),
    (
        "0003_query_indexes.sql",
        include_str!("../../migrations/0003_query_indexes.sql"),
    ),
    (
        "0003_query_indexes_rollback.sql",
        include_str!("../../migrations/0003_query_indexes_rollback.sql"),
    ),
];

/// Where migration scripts are read from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MigrationSource {
    /// Scripts compiled into the crate
    #[default]
    Bundled,
    /// `NNNN_name.sql` files in a directory
    Directory(PathBuf),
}

impl From<PathBuf> for MigrationSource {
    fn from(dir: PathBuf) -> Self {
        MigrationSource::Directory(dir)
    }
}

impl fmt::Display for MigrationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationSource::Bundled => write!(f, "bundled migrations"),
            MigrationSource::Directory(dir) => write!(f, "{}", dir.display()),
        }
    }
}

/// Runner lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationState {
    /// Ledger not yet verified
    Uninitialized,
    /// Ledger table exists
    Connected,
    /// A run completed with no pending files left
    Migrated,
}

/// One ledger row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub filename: String,
    pub applied_at: String,
}

/// Outcome of `run_migrations`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Files applied by this run, in order
    pub applied: Vec<String>,
    /// Files that were already recorded in the ledger
    pub already_applied: usize,
}

/// Applied and pending files
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub state: MigrationState,
    pub applied: Vec<AppliedMigration>,
    pub pending: Vec<String>,
}

/// Applies SQL migration files to a libsql database
pub struct MigrationRunner {
    pool: ConnectionPool,
    source: MigrationSource,
    state: Mutex<MigrationState>,
}

impl MigrationRunner {
    pub fn new(pool: ConnectionPool, source: impl Into<MigrationSource>) -> Self {
        Self {
            pool,
            source: source.into(),
            state: Mutex::new(MigrationState::Uninitialized),
        }
    }

    pub fn state(&self) -> MigrationState {
        *self.state.lock()
    }

    pub fn source(&self) -> &MigrationSource {
        &self.source
    }

    /// Apply every pending migration
    ///
    /// # Errors
    ///
    /// `StoreError::Migration` naming the failing file; files applied before
    /// it remain applied.
    pub async fn run_migrations(&self) -> StoreResult<MigrationReport> {
        let conn = self.pool.acquire().await?;
        self.ensure_ledger(&conn).await?;

        let files = self.migration_files().await?;
        let applied: Vec<String> = self
            .applied_on(&conn)
            .await?
            .into_iter()
            .map(|m| m.filename)
            .collect();

        let mut report = MigrationReport::default();
        for file in files {
            if applied.contains(&file) {
                report.already_applied += 1;
                continue;
            }

            let sql = self
                .read_script(&file)
                .await?
                .ok_or_else(|| StoreError::migration(format!("{} disappeared", file)))?;

            tracing::info!(file = %file, "applying migration");
            self.apply_in_transaction(&conn, &file, &sql, LedgerChange::Insert)
                .await?;
            report.applied.push(file);
        }

        *self.state.lock() = MigrationState::Migrated;
        tracing::info!(
            applied = report.applied.len(),
            already_applied = report.already_applied,
            "migrations complete"
        );
        Ok(report)
    }

    /// Revert the most recently applied migration
    ///
    /// Returns the reverted filename, or `None` when nothing is applied.
    ///
    /// # Errors
    ///
    /// `StoreError::Migration` when the rollback script is missing or fails.
    pub async fn rollback_last_migration(&self) -> StoreResult<Option<String>> {
        let conn = self.pool.acquire().await?;
        self.ensure_ledger(&conn).await?;

        let Some(last) = self.applied_on(&conn).await?.pop() else {
            tracing::info!("no applied migrations to roll back");
            return Ok(None);
        };

        let stem = last.filename.trim_end_matches(".sql");
        let script = format!("{}{}", stem, ROLLBACK_SUFFIX);
        let Some(sql) = self.read_script(&script).await? else {
            return Err(StoreError::migration(format!(
                "no rollback script for {} (expected {} in {})",
                last.filename, script, self.source
            )));
        };

        tracing::info!(file = %last.filename, "rolling back migration");
        self.apply_in_transaction(&conn, &last.filename, &sql, LedgerChange::Delete)
            .await?;
        *self.state.lock() = MigrationState::Connected;
        Ok(Some(last.filename))
    }

    pub async fn status(&self) -> StoreResult<MigrationStatus> {
        let conn = self.pool.acquire().await?;
        self.ensure_ledger(&conn).await?;
        let applied = self.applied_on(&conn).await?;
        let pending = self.pending_from(&applied).await?;
        Ok(MigrationStatus {
            state: self.state(),
            applied,
            pending,
        })
    }

    /// Ledger rows in application order
    pub async fn applied_migrations(&self) -> StoreResult<Vec<AppliedMigration>> {
        let conn = self.pool.acquire().await?;
        self.ensure_ledger(&conn).await?;
        self.applied_on(&conn).await
    }

    /// Migration files not yet recorded in the ledger
    pub async fn pending_migrations(&self) -> StoreResult<Vec<String>> {
        let applied = self.applied_migrations().await?;
        self.pending_from(&applied).await
    }

    async fn pending_from(&self, applied: &[AppliedMigration]) -> StoreResult<Vec<String>> {
        Ok(self
            .migration_files()
            .await?
            .into_iter()
            .filter(|f| !applied.iter().any(|a| &a.filename == f))
            .collect())
    }

    async fn ensure_ledger(&self, conn: &PooledConnection) -> StoreResult<()> {
        conn.execute(LEDGER_TABLE_SQL, ())
            .await
            .map_err(|e| StoreError::migration(format!("cannot create ledger table: {}", e)))?;
        let mut state = self.state.lock();
        if *state == MigrationState::Uninitialized {
            *state = MigrationState::Connected;
        }
        Ok(())
    }

    async fn applied_on(&self, conn: &PooledConnection) -> StoreResult<Vec<AppliedMigration>> {
        let mut rows = conn
            .query(
                "SELECT filename, applied_at FROM schema_migrations ORDER BY filename",
                (),
            )
            .await
            .map_err(|e| StoreError::migration(format!("cannot read ledger: {}", e)))?;

        let mut applied = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::migration(format!("cannot read ledger: {}", e)))?
        {
            let filename: String = row
                .get(0)
                .map_err(|e| StoreError::migration(format!("corrupt ledger row: {}", e)))?;
            let applied_at: String = row
                .get(1)
                .map_err(|e| StoreError::migration(format!("corrupt ledger row: {}", e)))?;
            applied.push(AppliedMigration {
                filename,
                applied_at,
            });
        }
        Ok(applied)
    }

    /// Sorted forward migration filenames
    async fn migration_files(&self) -> StoreResult<Vec<String>> {
        let mut files = match &self.source {
            MigrationSource::Bundled => BUNDLED_MIGRATIONS
                .iter()
                .map(|(name, _)| name.to_string())
                .collect(),
            MigrationSource::Directory(dir) => {
                let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| {
                    StoreError::migration(format!(
                        "cannot read migrations directory {}: {}",
                        dir.display(),
                        e
                    ))
                })?;
                let mut names = Vec::new();
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| StoreError::migration(e.to_string()))?
                {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
                names
            }
        };
        files.retain(|name| name.ends_with(".sql") && !name.ends_with(ROLLBACK_SUFFIX));
        files.sort();
        Ok(files)
    }

    /// Script contents, `None` when the source has no such file
    async fn read_script(&self, name: &str) -> StoreResult<Option<String>> {
        match &self.source {
            MigrationSource::Bundled => Ok(BUNDLED_MIGRATIONS
                .iter()
                .find(|(bundled, _)| *bundled == name)
                .map(|(_, sql)| sql.to_string())),
            MigrationSource::Directory(dir) => {
                match tokio::fs::read_to_string(dir.join(name)).await {
                    Ok(sql) => Ok(Some(sql)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(StoreError::migration(format!(
                        "cannot read {}: {}",
                        name, e
                    ))),
                }
            }
        }
    }

    async fn apply_in_transaction(
        &self,
        conn: &PooledConnection,
        file: &str,
        sql: &str,
        ledger: LedgerChange,
    ) -> StoreResult<()> {
        conn.execute("BEGIN", ())
            .await
            .map_err(|e| StoreError::migration(format!("{}: cannot begin: {}", file, e)))?;

        let result = async {
            conn.execute_batch(sql)
                .await
                .map_err(|e| StoreError::migration(format!("{} failed: {}", file, e)))?;

            let params = match ledger {
                LedgerChange::Insert => Params::Positional(vec![
                    SqlValue::Text(file.to_string()),
                    SqlValue::Text(crate::models::now_timestamp()),
                ]),
                LedgerChange::Delete => Params::Positional(vec![SqlValue::Text(file.to_string())]),
            };
            conn.execute(ledger.sql(), params).await.map_err(|e| {
                StoreError::migration(format!("{}: ledger update failed: {}", file, e))
            })?;

            conn.execute("COMMIT", ())
                .await
                .map_err(|e| StoreError::migration(format!("{}: commit failed: {}", file, e)))?;
            Ok::<(), StoreError>(())
        }
        .await;

        if let Err(err) = &result {
            tracing::error!(file, error = %err, "migration failed, rolling back");
            if !conn.is_autocommit() {
                if let Err(e) = conn.execute("ROLLBACK", ()).await {
                    tracing::error!(file, error = %e, "migration rollback failed");
                }
            }
        }
        result
    }
}

#[derive(Debug, Clone, Copy)]
enum LedgerChange {
    Insert,
    Delete,
}

impl LedgerChange {
    fn sql(self) -> &'static str {
        match self {
            LedgerChange::Insert => {
                "INSERT INTO schema_migrations (filename, applied_at) VALUES (?, ?)"
            }
            LedgerChange::Delete => "DELETE FROM schema_migrations WHERE filename = ?",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::{PoolOptions, PoolTarget};
    use tempfile::TempDir;

    async fn runner_with(files: &[(&str, &str)]) -> anyhow::Result<(TempDir, MigrationRunner)> {
        let dir = TempDir::new()?;
        let migrations = dir.path().join("migrations");
        std::fs::create_dir(&migrations)?;
        for (name, sql) in files {
            std::fs::write(migrations.join(name), sql)?;
        }
        let db_path = dir.path().join("test.db").to_string_lossy().into_owned();
        let pool = ConnectionPool::open(PoolTarget::Local(db_path), PoolOptions::default()).await?;
        Ok((dir, MigrationRunner::new(pool, migrations)))
    }

    #[tokio::test]
    async fn test_bundled_migrations_apply_cleanly() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let db_path = dir.path().join("bundled.db").to_string_lossy().into_owned();
        let pool = ConnectionPool::open(PoolTarget::Local(db_path), PoolOptions::default()).await?;
        let runner = MigrationRunner::new(pool, MigrationSource::Bundled);

        assert_eq!(runner.state(), MigrationState::Uninitialized);
        let report = runner.run_migrations().await?;
        assert_eq!(report.applied.len(), 3);
        assert_eq!(runner.state(), MigrationState::Migrated);

        let again = runner.run_migrations().await?;
        assert!(again.applied.is_empty());
        assert_eq!(again.already_applied, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_halts_and_keeps_earlier_files() -> anyhow::Result<()> {
        let (_dir, runner) = runner_with(&[
            ("0001_a.sql", "CREATE TABLE a (x INTEGER);"),
            ("0002_bad.sql", "CREATE TABLE b (x INTEGER); THIS IS NOT SQL;"),
            ("0003_c.sql", "CREATE TABLE c (x INTEGER);"),
        ])
        .await?;

        let err = runner.run_migrations().await.unwrap_err();
        assert!(matches!(err, StoreError::Migration(ref m) if m.contains("0002_bad.sql")));

        let status = runner.status().await?;
        assert_eq!(status.applied.len(), 1);
        assert_eq!(status.applied[0].filename, "0001_a.sql");
        assert_eq!(status.pending, vec!["0002_bad.sql", "0003_c.sql"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_rollback_last_migration() -> anyhow::Result<()> {
        let (_dir, runner) = runner_with(&[
            ("0001_a.sql", "CREATE TABLE a (x INTEGER);"),
            ("0001_a_rollback.sql", "DROP TABLE a;"),
            ("0002_b.sql", "CREATE TABLE b (x INTEGER);"),
        ])
        .await?;
        runner.run_migrations().await?;

        // 0002 has no rollback script
        let err = runner.rollback_last_migration().await.unwrap_err();
        assert!(matches!(err, StoreError::Migration(ref m) if m.contains("no rollback script")));
        assert_eq!(runner.applied_migrations().await?.len(), 2);

        Ok(())
    }

    #[tokio::test]
    async fn test_rollback_removes_ledger_row() -> anyhow::Result<()> {
        let (_dir, runner) = runner_with(&[
            ("0001_a.sql", "CREATE TABLE a (x INTEGER);"),
            ("0001_a_rollback.sql", "DROP TABLE a;"),
        ])
        .await?;
        runner.run_migrations().await?;

        let reverted = runner.rollback_last_migration().await?;
        assert_eq!(reverted.as_deref(), Some("0001_a.sql"));
        assert_eq!(runner.pending_migrations().await?, vec!["0001_a.sql"]);
        assert_eq!(runner.rollback_last_migration().await?, None);

        // Re-applying works because the table was dropped
        assert_eq!(runner.run_migrations().await?.applied, vec!["0001_a.sql"]);
        Ok(())
    }

    #[test]
    fn test_bundled_set_matches_migrations_directory() -> anyhow::Result<()> {
        let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations");
        let mut on_disk = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            on_disk.push((name, std::fs::read_to_string(entry.path())?));
        }
        on_disk.sort();

        let mut bundled: Vec<(String, String)> = BUNDLED_MIGRATIONS
            .iter()
            .map(|(name, sql)| (name.to_string(), sql.to_string()))
            .collect();
        bundled.sort();
        assert_eq!(bundled, on_disk);
        Ok(())
    }

    #[tokio::test]
    async fn test_bundled_rollback_needs_no_directory() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let db_path = dir.path().join("bundled.db").to_string_lossy().into_owned();
        let pool = ConnectionPool::open(PoolTarget::Local(db_path), PoolOptions::default()).await?;
        let runner = MigrationRunner::new(pool, MigrationSource::default());
        assert_eq!(runner.source().to_string(), "bundled migrations");

        runner.run_migrations().await?;
        let reverted = runner.rollback_last_migration().await?;
        assert_eq!(reverted.as_deref(), Some("0003_query_indexes.sql"));
        assert_eq!(runner.pending_migrations().await?, vec!["0003_query_indexes.sql"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_column_default_timestamps_use_microsecond_width() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let db_path = dir.path().join("defaults.db").to_string_lossy().into_owned();
        let pool = ConnectionPool::open(PoolTarget::Local(db_path), PoolOptions::default()).await?;
        MigrationRunner::new(pool.clone(), MigrationSource::Bundled)
            .run_migrations()
            .await?;

        let conn = pool.acquire().await?;
        conn.execute(
            "INSERT INTO user_settings (user_id, \"key\") VALUES ('u1', 'theme')",
            (),
        )
        .await?;
        let mut rows = conn
            .query("SELECT created_at, updated_at FROM user_settings", ())
            .await?;
        let row = rows.next().await?.expect("inserted row");
        let created_at: String = row.get(0)?;
        let updated_at: String = row.get(1)?;

        let written = crate::models::now_timestamp();
        assert_eq!(created_at.len(), written.len(), "{created_at}");
        assert_eq!(updated_at.len(), written.len(), "{updated_at}");
        assert!(created_at.ends_with("000Z"));
        assert!(chrono::DateTime::parse_from_rfc3339(&created_at).is_ok());
        Ok(())
    }
}
