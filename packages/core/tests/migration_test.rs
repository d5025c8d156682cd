//! Migration runner against on-disk databases

use serde_json::json;
use tempfile::TempDir;
use unistore_core::db::{LibsqlConfig, LibsqlStore, MigrationState, StoreAdapter};
use unistore_core::models::{collections, doc, document_id};

fn file_config(dir: &TempDir, auto_migrate: bool) -> LibsqlConfig {
    let mut config =
        LibsqlConfig::local(dir.path().join("app.db").to_string_lossy().to_string());
    config.auto_migrate = auto_migrate;
    config
}

#[tokio::test]
async fn test_second_run_applies_nothing_and_keeps_ledger() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = LibsqlStore::new(file_config(&dir, false))?;
    store.connect().await?;
    let runner = store.migration_runner()?;

    let first = runner.run_migrations().await?;
    assert_eq!(first.applied.len(), 3);
    assert_eq!(first.already_applied, 0);
    let ledger = runner.applied_migrations().await?;

    let second = runner.run_migrations().await?;
    assert!(second.applied.is_empty());
    assert_eq!(second.already_applied, 3);
    assert_eq!(runner.applied_migrations().await?, ledger);
    assert_eq!(runner.state(), MigrationState::Migrated);
    assert!(runner.pending_migrations().await?.is_empty());

    store.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_reopening_a_migrated_file_keeps_data() -> anyhow::Result<()> {
    let dir = TempDir::new()?;

    let store = LibsqlStore::new(file_config(&dir, true))?;
    store.connect().await?;
    let created = store
        .create(
            collections::USERS,
            doc(json!({"email": "ada@example.com", "username": "ada"})),
        )
        .await?;
    let id = document_id(&created).expect("id");
    store.disconnect().await?;

    // Auto-migration on reconnect must not touch existing tables
    let store = LibsqlStore::new(file_config(&dir, true))?;
    store.connect().await?;
    let status = store.migration_runner()?.status().await?;
    assert_eq!(status.applied.len(), 3);
    assert!(status.pending.is_empty());
    assert!(store.find_by_id(collections::USERS, &id).await?.is_some());
    store.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_rollback_then_reapply() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = LibsqlStore::new(file_config(&dir, false))?;
    store.connect().await?;
    let runner = store.migration_runner()?;
    runner.run_migrations().await?;

    let reverted = runner.rollback_last_migration().await?;
    assert_eq!(reverted.as_deref(), Some("0003_query_indexes.sql"));
    assert_eq!(
        runner.pending_migrations().await?,
        vec!["0003_query_indexes.sql".to_string()]
    );

    let report = runner.run_migrations().await?;
    assert_eq!(report.applied, vec!["0003_query_indexes.sql".to_string()]);
    assert_eq!(report.already_applied, 2);

    store.disconnect().await?;
    Ok(())
}
