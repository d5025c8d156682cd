//! Database Manager
//!
//! Owns the active [`StoreAdapter`] and everything built on it: the
//! [`SearchIndexer`], the domain [`Repositories`] and, when enabled in the
//! configuration, a background [`HealthMonitor`]. Application code is
//! handed one manager at bootstrap and asks it for repositories by name or
//! through the typed bundle.
//!
//! ```text
//! new() ──► Uninitialized ──initialize(config)──► Ready ──disconnect()──► Uninitialized
//! ```
//!
//! Initializing a ready manager is a no-op. Every accessor fails fast with
//! [`ManagerError::NotInitialized`] until `initialize` has completed.

use crate::config::DalConfig;
use crate::db::{
    BackendKind, LibsqlStore, StoreAdapter, StoreHealth, SurrealStore, Transaction,
};
use crate::repositories::{Repositories, Repository, REPOSITORY_NAMES};
use crate::search::{IndexOutcome, IndexStats, SearchHealth, SearchIndexer, SyncReport};
use crate::services::error::ManagerError;
use crate::services::health_monitor::{HealthMonitor, HealthReport};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything that exists only while the manager is ready
struct ManagerState {
    store: Arc<dyn StoreAdapter>,
    indexer: SearchIndexer,
    repositories: Arc<Repositories>,
    monitor: Option<tokio::sync::Mutex<HealthMonitor>>,
}

/// Snapshot returned by [`DatabaseManager::health_check`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseHealth {
    pub initialized: bool,
    pub store: Option<StoreHealth>,
    pub search: Option<SearchHealth>,
}

impl DatabaseHealth {
    pub fn healthy(&self) -> bool {
        self.store.as_ref().is_some_and(StoreHealth::healthy)
    }
}

#[derive(Default)]
pub struct DatabaseManager {
    state: RwLock<Option<Arc<ManagerState>>>,
    init_lock: tokio::sync::Mutex<()>,
}

impl DatabaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build, connect and register the adapter selected by `config`
    ///
    /// A no-op when already initialized.
    pub async fn initialize(&self, config: &DalConfig) -> Result<(), ManagerError> {
        let _guard = self.init_lock.lock().await;
        if self.state.read().is_some() {
            tracing::debug!("database manager already initialized");
            return Ok(());
        }

        config.validate()?;
        let backend = config.backend_kind()?;
        let store: Arc<dyn StoreAdapter> = match backend {
            BackendKind::Relational => Arc::new(LibsqlStore::new(config.libsql_config())?),
            BackendKind::Document => Arc::new(SurrealStore::new(config.surreal_config())),
        };
        store.connect().await?;

        let indexer = match SearchIndexer::from_config(store.clone(), &config.search) {
            Ok(indexer) => indexer,
            Err(e) => {
                if let Err(disconnect_err) = store.disconnect().await {
                    tracing::warn!(error = %disconnect_err, "disconnect after failed setup");
                }
                return Err(e.into());
            }
        };
        if let IndexOutcome::Failed(reason) = indexer.configure_indexes().await {
            // Writes still succeed; documents are picked up by the next sync
            tracing::warn!(reason, "search indexes not configured, continuing without them");
        }

        let monitor = config.monitor.enabled.then(|| {
            let mut monitor = HealthMonitor::new(store.clone(), indexer.clone());
            monitor.start(config.monitor_interval());
            monitor
        });

        self.install(store, indexer, monitor);
        tracing::info!(backend = %backend, "database manager initialized");
        Ok(())
    }

    /// Register an already connected adapter and indexer
    pub async fn initialize_with(
        &self,
        store: Arc<dyn StoreAdapter>,
        indexer: SearchIndexer,
    ) -> Result<(), ManagerError> {
        let _guard = self.init_lock.lock().await;
        if self.state.read().is_some() {
            return Ok(());
        }
        store.connect().await?;
        self.install(store, indexer, None);
        Ok(())
    }

    fn install(
        &self,
        store: Arc<dyn StoreAdapter>,
        indexer: SearchIndexer,
        monitor: Option<HealthMonitor>,
    ) {
        let repositories = Arc::new(Repositories::new(store.clone(), indexer.clone()));
        *self.state.write() = Some(Arc::new(ManagerState {
            store,
            indexer,
            repositories,
            monitor: monitor.map(tokio::sync::Mutex::new),
        }));
    }

    fn ready(&self) -> Result<Arc<ManagerState>, ManagerError> {
        self.state.read().clone().ok_or(ManagerError::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.state
            .read()
            .as_ref()
            .is_some_and(|state| state.store.is_connected())
    }

    pub fn repository_names(&self) -> &'static [&'static str] {
        REPOSITORY_NAMES
    }

    /// Generic repository by collection name
    pub fn get_repository(&self, name: &str) -> Result<Repository, ManagerError> {
        let state = self.ready()?;
        state
            .repositories
            .get(name)
            .cloned()
            .ok_or_else(|| ManagerError::unknown_repository(name, REPOSITORY_NAMES))
    }

    /// Typed domain repositories
    pub fn repositories(&self) -> Result<Arc<Repositories>, ManagerError> {
        Ok(self.ready()?.repositories.clone())
    }

    pub fn adapter(&self) -> Result<Arc<dyn StoreAdapter>, ManagerError> {
        Ok(self.ready()?.store.clone())
    }

    pub fn search_indexer(&self) -> Result<SearchIndexer, ManagerError> {
        Ok(self.ready()?.indexer.clone())
    }

    /// Run `f` in a transaction on the active adapter
    ///
    /// Commits when `f` succeeds and rolls back when it fails.
    pub async fn with_transaction<T, F>(&self, f: F) -> Result<T, ManagerError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, Result<T, ManagerError>> + Send,
    {
        let store = self.adapter()?;
        store.with_transaction(f).await
    }

    /// Close the adapter and return to the uninitialized state
    pub async fn disconnect(&self) -> Result<(), ManagerError> {
        let _guard = self.init_lock.lock().await;
        let state = self.state.write().take();
        if let Some(state) = state {
            if let Some(monitor) = &state.monitor {
                monitor.lock().await.stop().await;
            }
            state.store.disconnect().await?;
            tracing::info!("database manager disconnected");
        }
        Ok(())
    }

    pub async fn health_check(&self) -> DatabaseHealth {
        let Ok(state) = self.ready() else {
            return DatabaseHealth {
                initialized: false,
                store: None,
                search: None,
            };
        };
        let store = state.store.health_check().await;
        let search = state.indexer.health_check().await;
        DatabaseHealth {
            initialized: true,
            store: Some(store),
            search: Some(search),
        }
    }

    /// Whether the background health monitor is running
    pub async fn is_monitoring(&self) -> bool {
        let Ok(state) = self.ready() else {
            return false;
        };
        match &state.monitor {
            Some(monitor) => monitor.lock().await.is_running(),
            None => false,
        }
    }

    /// Last report published by the background health monitor
    pub async fn latest_health(&self) -> Option<HealthReport> {
        let state = self.ready().ok()?;
        let monitor = state.monitor.as_ref()?;
        let latest = monitor.lock().await.latest();
        latest
    }

    /// Index every unmarked document of each search-integrated repository
    pub async fn sync_search_index(
        &self,
        batch_size: Option<u64>,
    ) -> Result<BTreeMap<String, SyncReport>, ManagerError> {
        let state = self.ready()?;
        let batch_size = batch_size.unwrap_or_else(|| state.indexer.batch_size());
        let mut reports = BTreeMap::new();
        for repo in state.repositories.search_integrated() {
            if let Some(report) = repo.sync_search_index(batch_size).await {
                reports.insert(repo.collection().to_string(), report);
            }
        }
        Ok(reports)
    }

    /// Engine statistics per search-integrated repository
    pub async fn search_stats(
        &self,
    ) -> Result<BTreeMap<String, Option<IndexStats>>, ManagerError> {
        let state = self.ready()?;
        let mut stats = BTreeMap::new();
        for repo in state.repositories.search_integrated() {
            stats.insert(repo.collection().to_string(), repo.search_stats().await);
        }
        Ok(stats)
    }
}

impl std::fmt::Debug for DatabaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = self.state.read().as_ref().map(|s| s.store.backend());
        f.debug_struct("DatabaseManager")
            .field("backend", &backend)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DalConfig;
    use crate::models::{doc, document_id, Query};
    use serde_json::json;

    fn memory_config(backend: &str) -> DalConfig {
        let mut config = DalConfig::default();
        config.backend = backend.to_string();
        config.relational.path = crate::db::MEMORY_PATH.to_string();
        config.document.url = "mem://".to_string();
        config.search.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_accessors_fail_before_initialize() -> anyhow::Result<()> {
        let manager = DatabaseManager::new();
        assert!(matches!(
            manager.get_repository("users"),
            Err(ManagerError::NotInitialized)
        ));
        assert!(!manager.is_connected());
        assert!(!manager.health_check().await.initialized);
        Ok(())
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() -> anyhow::Result<()> {
        let manager = DatabaseManager::new();
        let config = memory_config("relational");
        manager.initialize(&config).await?;
        let users = manager.repositories()?.users.clone();
        users
            .create(doc(json!({"email": "a@x.com", "username": "a"})))
            .await?;

        // Second call keeps the same adapter and data
        manager.initialize(&config).await?;
        assert_eq!(
            manager.get_repository("users")?.count(&Query::new()).await?,
            1
        );

        let err = manager.get_repository("widgets").unwrap_err();
        match err {
            ManagerError::UnknownRepository { valid, .. } => assert_eq!(valid.len(), 15),
            other => panic!("unexpected error: {other}"),
        }

        assert!(manager.health_check().await.healthy());
        manager.disconnect().await?;
        assert!(!manager.is_initialized());
        Ok(())
    }

    #[tokio::test]
    async fn test_transaction_commit_and_rollback() -> anyhow::Result<()> {
        for backend in ["relational", "document"] {
            let manager = DatabaseManager::new();
            manager.initialize(&memory_config(backend)).await?;
            let conversations = manager.repositories()?.conversations.clone();

            let repo = conversations.clone();
            let created = manager
                .with_transaction(move |tx| {
                    Box::pin(async move {
                        let record = repo
                            .create_in(tx, doc(json!({"userId": "u1", "title": "kept"})))
                            .await?;
                        Ok(record)
                    })
                })
                .await?;
            let id = document_id(&created).expect("id");
            assert!(conversations.find_by_id(&id).await?.is_some(), "{backend}");

            let repo = conversations.clone();
            let failed: Result<(), ManagerError> = manager
                .with_transaction(move |tx| {
                    Box::pin(async move {
                        repo.create_in(tx, doc(json!({"userId": "u1", "title": "dropped"})))
                            .await?;
                        Err(ManagerError::NotInitialized)
                    })
                })
                .await;
            assert!(failed.is_err());
            assert_eq!(
                conversations.count(&Query::new()).await?,
                1,
                "{backend} rolled back"
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_search_fan_out_without_engine() -> anyhow::Result<()> {
        let manager = DatabaseManager::new();
        manager.initialize(&memory_config("document")).await?;
        assert!(!manager.search_indexer()?.is_enabled());
        manager
            .repositories()?
            .messages
            .create(doc(json!({"conversationId": "c1", "role": "user", "content": "hi"})))
            .await?;

        // Disabled engine: one empty report per search-integrated repository
        let reports = manager.sync_search_index(None).await?;
        assert_eq!(
            reports.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["conversations", "documents", "messages"]
        );
        assert!(reports.values().all(|r| r.indexed == 0 && r.error.is_none()));
        let stats = manager.search_stats().await?;
        assert!(stats.values().all(Option::is_none));
        Ok(())
    }

    #[tokio::test]
    async fn test_enabled_monitor_runs_until_disconnect() -> anyhow::Result<()> {
        let manager = DatabaseManager::new();
        let mut config = memory_config("relational");
        config.monitor.enabled = true;
        config.monitor.interval_secs = 1;
        manager.initialize(&config).await?;
        assert!(manager.is_monitoring().await);

        // The first tick fires immediately
        let mut latest = None;
        for _ in 0..50 {
            latest = manager.latest_health().await;
            if latest.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let report = latest.expect("monitor published a report");
        assert!(report.is_ready());

        manager.disconnect().await?;
        assert!(!manager.is_monitoring().await);
        assert!(manager.latest_health().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_disabled_monitor_is_not_started() -> anyhow::Result<()> {
        let manager = DatabaseManager::new();
        let mut config = memory_config("document");
        config.monitor.enabled = false;
        manager.initialize(&config).await?;
        assert!(!manager.is_monitoring().await);
        assert!(manager.latest_health().await.is_none());
        manager.disconnect().await?;
        Ok(())
    }
}
