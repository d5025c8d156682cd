//! LibsqlStore - Relational StoreAdapter Implementation
//!
//! Implements `StoreAdapter` over libsql (local SQLite files, `:memory:`, or
//! remote Turso databases).
//!
//! # Architecture
//!
//! - **Pooling**: every operation borrows one connection from
//!   [`ConnectionPool`] and returns it on drop
//! - **Translation**: canonical queries become parameterized SQL through
//!   [`SqlTranslator`]; collection and field names go through [`naming`]
//! - **Tracking**: each statement races the query timeout and is recorded
//!   in [`QueryMetrics`]
//! - **Bootstrap**: with `auto_migrate`, `connect` applies pending migrations
//!   before serving traffic
//!
//! The SQL for each operation lives in free functions over a [`SqlExecutor`],
//! so the store and its transactions run identical statements.
//!
//! [`naming`]: crate::db::naming

use crate::db::error::{StoreError, StoreResult};
use crate::db::migrations::{MigrationRunner, MigrationSource};
use crate::db::naming::{table_spec, validate_mappings, IdKind, TableSpec};
use crate::db::pool::{ConnectionPool, PoolOptions, PoolTarget, PooledConnection};
use crate::db::query_metrics::QueryMetrics;
use crate::db::sql_translator::{quote_ident, SqlTranslator};
use crate::db::store_adapter::{
    BackendKind, StoreAdapter, StoreHealth, Transaction, TransactionOps,
};
use crate::models::{
    check_field_path, collections, stamp_created, AggregateSpec, Document, Query, QueryOptions,
    Update, ID_FIELD,
};
use async_trait::async_trait;
use libsql::params::Params;
use libsql::Value as SqlValue;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Number, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Relational adapter settings
#[derive(Debug, Clone, PartialEq)]
pub struct LibsqlConfig {
    pub target: PoolTarget,
    pub pool: PoolOptions,
    pub query_timeout: Duration,
    pub slow_query_threshold: Duration,
    /// Rolling window size for query timings
    pub metrics_window: usize,
    pub metrics_reset_interval: Duration,
    pub auto_migrate: bool,
    pub migrations: MigrationSource,
}

impl LibsqlConfig {
    /// Defaults for a local database file (or `:memory:`)
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            target: PoolTarget::Local(path.into()),
            pool: PoolOptions::default(),
            query_timeout: Duration::from_secs(30),
            slow_query_threshold: Duration::from_millis(500),
            metrics_window: 1000,
            metrics_reset_interval: Duration::from_secs(3600),
            auto_migrate: true,
            migrations: MigrationSource::Bundled,
        }
    }

    /// Private in-memory database, migrated on connect
    pub fn in_memory() -> Self {
        Self::local(crate::db::pool::MEMORY_PATH)
    }
}

/// Relational backend over libsql
pub struct LibsqlStore {
    config: LibsqlConfig,
    pool: RwLock<Option<ConnectionPool>>,
    metrics: Arc<QueryMetrics>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl LibsqlStore {
    /// Create an unconnected store
    ///
    /// # Errors
    ///
    /// `StoreError::Connection` when a known collection has no table mapping.
    pub fn new(config: LibsqlConfig) -> StoreResult<Self> {
        validate_mappings(collections::ALL)?;
        let metrics = Arc::new(QueryMetrics::new(
            config.metrics_window,
            config.slow_query_threshold,
        ));
        Ok(Self {
            config,
            pool: RwLock::new(None),
            metrics,
            tasks: Mutex::new(Vec::new()),
            connect_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &LibsqlConfig {
        &self.config
    }

    pub fn metrics(&self) -> &QueryMetrics {
        &self.metrics
    }

    /// The active pool, or a connection error when disconnected
    pub fn pool(&self) -> StoreResult<ConnectionPool> {
        self.pool
            .read()
            .clone()
            .ok_or_else(|| StoreError::connection("relational store is not connected"))
    }

    /// Migration runner bound to this store's pool
    pub fn migration_runner(&self) -> StoreResult<MigrationRunner> {
        Ok(MigrationRunner::new(
            self.pool()?,
            self.config.migrations.clone(),
        ))
    }

    async fn acquire(&self) -> StoreResult<PooledConnection> {
        self.pool()?.acquire().await
    }

    fn executor<'c>(&'c self, conn: &'c libsql::Connection) -> SqlExecutor<'c> {
        SqlExecutor {
            conn,
            metrics: &self.metrics,
            timeout: self.config.query_timeout,
        }
    }
}

#[async_trait]
impl StoreAdapter for LibsqlStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Relational
    }

    async fn connect(&self) -> StoreResult<()> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let pool = ConnectionPool::open(self.config.target.clone(), self.config.pool.clone()).await?;

        if self.config.auto_migrate {
            let runner = MigrationRunner::new(pool.clone(), self.config.migrations.clone());
            if let Err(e) = runner.run_migrations().await {
                pool.close();
                return Err(e);
            }
        }

        {
            let mut tasks = self.tasks.lock();
            tasks.push(pool.spawn_keep_alive());
            tasks.push(
                self.metrics
                    .spawn_reset_task(self.config.metrics_reset_interval),
            );
        }
        *self.pool.write() = Some(pool);

        tracing::info!(database = ?self.config.target, "relational store connected");
        Ok(())
    }

    async fn disconnect(&self) -> StoreResult<()> {
        let pool = self.pool.write().take();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(pool) = pool {
            pool.close();
            tracing::info!("relational store disconnected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.pool.read().is_some()
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> StoreResult<Option<Document>> {
        let conn = self.acquire().await?;
        find_by_id(&self.executor(&conn), collection, id).await
    }

    async fn find_many(
        &self,
        collection: &str,
        query: &Query,
        options: &QueryOptions,
    ) -> StoreResult<Vec<Document>> {
        let conn = self.acquire().await?;
        find_many(&self.executor(&conn), collection, query, options).await
    }

    async fn count(&self, collection: &str, query: &Query) -> StoreResult<u64> {
        let conn = self.acquire().await?;
        count(&self.executor(&conn), collection, query).await
    }

    async fn aggregate(
        &self,
        collection: &str,
        spec: &AggregateSpec,
    ) -> StoreResult<Vec<Document>> {
        let conn = self.acquire().await?;
        let translator = SqlTranslator::new(table_spec(collection)?);
        let fragment = translator.aggregate(spec)?;
        self.executor(&conn)
            .fetch(collection, &fragment.sql, fragment.params, RowShape::Plain)
            .await
    }

    async fn create(&self, collection: &str, data: Document) -> StoreResult<Document> {
        let conn = self.acquire().await?;
        create(&self.executor(&conn), collection, data).await
    }

    async fn create_many(
        &self,
        collection: &str,
        data: Vec<Document>,
    ) -> StoreResult<Vec<Document>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.acquire().await?;
        let exec = self.executor(&conn);
        exec.run("BEGIN").await?;

        let mut created = Vec::with_capacity(data.len());
        for item in data {
            match create(&exec, collection, item).await {
                Ok(doc) => created.push(doc),
                Err(e) => {
                    if let Err(rollback) = exec.run("ROLLBACK").await {
                        tracing::error!(collection, error = %rollback, "create_many rollback failed");
                    }
                    return Err(e);
                }
            }
        }
        exec.run("COMMIT").await?;
        Ok(created)
    }

    async fn update_by_id(
        &self,
        collection: &str,
        id: &str,
        update: &Update,
    ) -> StoreResult<Option<Document>> {
        let conn = self.acquire().await?;
        update_by_id(&self.executor(&conn), collection, id, update).await
    }

    async fn update_many(
        &self,
        collection: &str,
        query: &Query,
        update: &Update,
    ) -> StoreResult<u64> {
        if update.is_empty() {
            return Ok(0);
        }
        let conn = self.acquire().await?;
        let translator = SqlTranslator::new(table_spec(collection)?);
        let (assignments, mut params) = set_clause(&translator, &update.touched())?;
        let where_clause = translator.where_clause(query)?;
        params.extend(where_clause.params);
        let sql = format!(
            "UPDATE {} SET {}{}",
            translator.table(),
            assignments,
            where_clause.sql
        );
        self.executor(&conn).execute(collection, &sql, params).await
    }

    async fn delete_by_id(&self, collection: &str, id: &str) -> StoreResult<bool> {
        let conn = self.acquire().await?;
        delete_by_id(&self.executor(&conn), collection, id).await
    }

    async fn delete_many(&self, collection: &str, query: &Query) -> StoreResult<u64> {
        let conn = self.acquire().await?;
        let translator = SqlTranslator::new(table_spec(collection)?);
        let where_clause = translator.where_clause(query)?;
        let sql = format!("DELETE FROM {}{}", translator.table(), where_clause.sql);
        self.executor(&conn)
            .execute(collection, &sql, where_clause.params)
            .await
    }

    async fn start_transaction(&self) -> StoreResult<Transaction> {
        let conn = self.acquire().await?;
        conn.execute("BEGIN", ())
            .await
            .map_err(|e| StoreError::transaction(format!("BEGIN failed: {}", e)))?;
        Ok(Transaction::new(Box::new(LibsqlTransaction {
            conn,
            metrics: Arc::clone(&self.metrics),
            timeout: self.config.query_timeout,
        })))
    }

    async fn health_check(&self) -> StoreHealth {
        let start = Instant::now();
        let target = match &self.config.target {
            target if target.is_memory() => "memory".to_string(),
            PoolTarget::Local(path) => path.clone(),
            PoolTarget::Remote { url, .. } => url.clone(),
        };

        let pool = match self.pool() {
            Ok(pool) => pool,
            Err(e) => {
                return StoreHealth {
                    backend: self.backend(),
                    connected: false,
                    latency_ms: 0,
                    details: json!({ "engine": "libsql", "target": target }),
                    error: Some(e.to_string()),
                }
            }
        };

        let ping = async {
            let conn = pool.acquire().await?;
            self.executor(&conn).ping().await?;
            Ok::<(), StoreError>(())
        };
        let error = ping.await.err().map(|e| e.to_string());

        StoreHealth {
            backend: self.backend(),
            connected: error.is_none(),
            latency_ms: start.elapsed().as_millis() as u64,
            details: json!({
                "engine": "libsql",
                "target": target,
                "pool": pool.status(),
                "queries": self.metrics.snapshot(),
            }),
            error,
        }
    }
}

/// Transaction bound to one pooled connection
struct LibsqlTransaction {
    conn: PooledConnection,
    metrics: Arc<QueryMetrics>,
    timeout: Duration,
}

impl LibsqlTransaction {
    fn executor(&self) -> SqlExecutor<'_> {
        SqlExecutor {
            conn: &self.conn,
            metrics: &self.metrics,
            timeout: self.timeout,
        }
    }
}

#[async_trait]
impl TransactionOps for LibsqlTransaction {
    async fn create(&mut self, collection: &str, data: Document) -> StoreResult<Document> {
        create(&self.executor(), collection, data).await
    }

    async fn find_by_id(&mut self, collection: &str, id: &str) -> StoreResult<Option<Document>> {
        find_by_id(&self.executor(), collection, id).await
    }

    async fn find_many(
        &mut self,
        collection: &str,
        query: &Query,
        options: &QueryOptions,
    ) -> StoreResult<Vec<Document>> {
        find_many(&self.executor(), collection, query, options).await
    }

    async fn update_by_id(
        &mut self,
        collection: &str,
        id: &str,
        update: &Update,
    ) -> StoreResult<Option<Document>> {
        update_by_id(&self.executor(), collection, id, update).await
    }

    async fn delete_by_id(&mut self, collection: &str, id: &str) -> StoreResult<bool> {
        delete_by_id(&self.executor(), collection, id).await
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.conn
            .execute("COMMIT", ())
            .await
            .map(|_| ())
            .map_err(|e| StoreError::transaction(format!("COMMIT failed: {}", e)))
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.conn
            .execute("ROLLBACK", ())
            .await
            .map(|_| ())
            .map_err(|e| StoreError::transaction(format!("ROLLBACK failed: {}", e)))
    }
}

/// How result rows become documents
#[derive(Clone, Copy)]
enum RowShape<'t> {
    /// Table rows: column names mapped to canonical fields
    Table(&'t SqlTranslator),
    /// Computed rows (aggregates): names kept verbatim
    Plain,
}

/// One connection plus the tracking applied to every statement
struct SqlExecutor<'c> {
    conn: &'c libsql::Connection,
    metrics: &'c QueryMetrics,
    timeout: Duration,
}

impl SqlExecutor<'_> {
    async fn fetch(
        &self,
        collection: &str,
        sql: &str,
        params: Vec<SqlValue>,
        shape: RowShape<'_>,
    ) -> StoreResult<Vec<Document>> {
        let logged = params.clone();
        self.metrics
            .track(sql, &logged, self.timeout, async {
                let mut rows = self
                    .conn
                    .query(sql, Params::Positional(params))
                    .await
                    .map_err(|e| StoreError::from_libsql(collection, "query", e))?;

                let columns: Vec<String> = (0..rows.column_count())
                    .map(|i| rows.column_name(i).unwrap_or_default().to_string())
                    .collect();

                let mut docs = Vec::new();
                while let Some(row) = rows
                    .next()
                    .await
                    .map_err(|e| StoreError::from_libsql(collection, "read row", e))?
                {
                    let mut doc = Document::new();
                    for (i, column) in columns.iter().enumerate() {
                        let value = row
                            .get_value(i as i32)
                            .map_err(|e| StoreError::from_libsql(collection, "read column", e))?;
                        match shape {
                            RowShape::Table(translator) => {
                                if let Some(field) = translator.spec().field_for(column) {
                                    doc.insert(field, translator.read_value(column, value));
                                }
                            }
                            RowShape::Plain => {
                                doc.insert(column.clone(), plain_value(value));
                            }
                        }
                    }
                    docs.push(doc);
                }
                Ok(docs)
            })
            .await
    }

    async fn execute(&self, collection: &str, sql: &str, params: Vec<SqlValue>) -> StoreResult<u64> {
        let logged = params.clone();
        self.metrics
            .track(sql, &logged, self.timeout, async {
                self.conn
                    .execute(sql, Params::Positional(params))
                    .await
                    .map_err(|e| StoreError::from_libsql(collection, "execute", e))
            })
            .await
    }

    /// Parameterless control statement (`BEGIN`, `COMMIT`, `ROLLBACK`)
    async fn run(&self, sql: &str) -> StoreResult<()> {
        self.metrics
            .track::<(), SqlValue, _>(sql, &[], self.timeout, async {
                self.conn
                    .execute(sql, ())
                    .await
                    .map(|_| ())
                    .map_err(|e| StoreError::transaction(format!("{} failed: {}", sql, e)))
            })
            .await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.metrics
            .track::<(), SqlValue, _>("SELECT 1", &[], self.timeout, async {
                let mut rows = self
                    .conn
                    .query("SELECT 1", ())
                    .await
                    .map_err(|e| StoreError::connection(e.to_string()))?;
                rows.next()
                    .await
                    .map_err(|e| StoreError::connection(e.to_string()))?;
                Ok(())
            })
            .await
    }
}

fn plain_value(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Number(Number::from(i)),
        SqlValue::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(bytes) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
    }
}

fn translator_for(collection: &str) -> StoreResult<SqlTranslator> {
    Ok(SqlTranslator::new(table_spec(collection)?))
}

async fn find_many(
    exec: &SqlExecutor<'_>,
    collection: &str,
    query: &Query,
    options: &QueryOptions,
) -> StoreResult<Vec<Document>> {
    let translator = translator_for(collection)?;
    if !options.populate.is_empty() {
        tracing::debug!(collection, "populate hints are not resolved by the relational store");
    }
    let where_clause = translator.where_clause(query)?;
    let mut params = where_clause.params;
    let mut sql = format!(
        "SELECT {} FROM {}{}{}",
        translator.select_list(options.projection.as_deref())?,
        translator.table(),
        where_clause.sql,
        translator.order_by(&options.sort)?
    );

    match (options.limit, options.offset) {
        (Some(limit), offset) => {
            sql.push_str(" LIMIT ?");
            params.push(SqlValue::Integer(clamp_i64(limit)));
            if let Some(offset) = offset {
                sql.push_str(" OFFSET ?");
                params.push(SqlValue::Integer(clamp_i64(offset)));
            }
        }
        (None, Some(offset)) => {
            sql.push_str(" LIMIT -1 OFFSET ?");
            params.push(SqlValue::Integer(clamp_i64(offset)));
        }
        (None, None) => {}
    }

    exec.fetch(collection, &sql, params, RowShape::Table(&translator))
        .await
}

async fn find_by_id(
    exec: &SqlExecutor<'_>,
    collection: &str,
    id: &str,
) -> StoreResult<Option<Document>> {
    let mut docs = find_many(
        exec,
        collection,
        &Query::by_id(id),
        &QueryOptions::new().limit(1),
    )
    .await?;
    Ok(docs.pop())
}

async fn count(exec: &SqlExecutor<'_>, collection: &str, query: &Query) -> StoreResult<u64> {
    let translator = translator_for(collection)?;
    let where_clause = translator.where_clause(query)?;
    let sql = format!(
        "SELECT COUNT(*) AS n FROM {}{}",
        translator.table(),
        where_clause.sql
    );
    let rows = exec
        .fetch(collection, &sql, where_clause.params, RowShape::Plain)
        .await?;
    Ok(rows
        .first()
        .and_then(|row| row.get("n"))
        .and_then(Value::as_u64)
        .unwrap_or(0))
}

async fn create(exec: &SqlExecutor<'_>, collection: &str, mut data: Document) -> StoreResult<Document> {
    let translator = translator_for(collection)?;
    let spec = translator.spec();

    stamp_created(&mut data);
    let id = data.remove(ID_FIELD);
    let mut columns = Vec::with_capacity(data.len() + 1);
    let mut params = Vec::with_capacity(data.len() + 1);

    match (spec.id_kind, id) {
        (_, Some(Value::Null)) | (IdKind::Integer, None) => {}
        (IdKind::Text, None) => {
            columns.push(quote_ident(spec.id_column));
            params.push(SqlValue::Text(uuid::Uuid::new_v4().to_string()));
        }
        (_, Some(value)) => {
            columns.push(quote_ident(spec.id_column));
            params.push(translator.write_value(spec.id_column, &id_value(value))?);
        }
    }

    for (field, value) in &data {
        let column = writable_column(spec, field)?;
        params.push(translator.write_value(&column, value)?);
        columns.push(quote_ident(&column));
    }

    let sql = if columns.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES RETURNING *", translator.table())
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
            translator.table(),
            columns.join(", "),
            vec!["?"; columns.len()].join(", ")
        )
    };

    exec.fetch(collection, &sql, params, RowShape::Table(&translator))
        .await?
        .pop()
        .ok_or_else(|| StoreError::query(format!("insert into {} returned no row", collection)))
}

async fn update_by_id(
    exec: &SqlExecutor<'_>,
    collection: &str,
    id: &str,
    update: &Update,
) -> StoreResult<Option<Document>> {
    if update.is_empty() {
        return find_by_id(exec, collection, id).await;
    }
    let translator = translator_for(collection)?;
    let (assignments, mut params) = set_clause(&translator, &update.touched())?;
    let where_clause = translator.where_clause(&Query::by_id(id))?;
    params.extend(where_clause.params);

    let sql = format!(
        "UPDATE {} SET {}{} RETURNING *",
        translator.table(),
        assignments,
        where_clause.sql
    );
    Ok(exec
        .fetch(collection, &sql, params, RowShape::Table(&translator))
        .await?
        .pop())
}

async fn delete_by_id(exec: &SqlExecutor<'_>, collection: &str, id: &str) -> StoreResult<bool> {
    let translator = translator_for(collection)?;
    let where_clause = translator.where_clause(&Query::by_id(id))?;
    let sql = format!("DELETE FROM {}{}", translator.table(), where_clause.sql);
    Ok(exec.execute(collection, &sql, where_clause.params).await? > 0)
}

/// `SET` assignments for an update; `$inc` treats NULL as zero
fn set_clause(translator: &SqlTranslator, update: &Update) -> StoreResult<(String, Vec<SqlValue>)> {
    let spec = translator.spec();
    let mut assignments = Vec::new();
    let mut params = Vec::new();

    for (field, value) in &update.set {
        if field == ID_FIELD {
            continue;
        }
        let column = writable_column(spec, field)?;
        params.push(translator.write_value(&column, value)?);
        assignments.push(format!("{} = ?", quote_ident(&column)));
    }
    for (field, delta) in &update.inc {
        let column = writable_column(spec, field)?;
        let quoted = quote_ident(&column);
        params.push(translator.write_value(&column, &Value::Number(delta.clone()))?);
        assignments.push(format!("{} = COALESCE({}, 0) + ?", quoted, quoted));
    }
    for field in &update.unset {
        let column = writable_column(spec, field)?;
        assignments.push(format!("{} = NULL", quote_ident(&column)));
    }

    if assignments.is_empty() {
        return Err(StoreError::translation("update does not change any field"));
    }
    Ok((assignments.join(", "), params))
}

/// Column for a top-level field that callers may write
fn writable_column(spec: &TableSpec, field: &str) -> StoreResult<String> {
    check_field_path(field)?;
    if field.contains('.') {
        return Err(StoreError::translation(format!(
            "nested write to '{}' is not supported by the relational store",
            field
        )));
    }
    let column = spec.column_for(field);
    if spec.field_for(&column).is_none() || column == spec.id_column {
        return Err(StoreError::translation(format!(
            "field '{}' is reserved on {}",
            field, spec.collection
        )));
    }
    Ok(column)
}

/// Identifier values arrive as strings or numbers; store them as strings
fn id_value(value: Value) -> Value {
    match value {
        Value::Number(n) => Value::String(n.to_string()),
        other => other,
    }
}

fn clamp_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{doc, document_id, Filter, SortOrder};

    async fn store() -> anyhow::Result<LibsqlStore> {
        let store = LibsqlStore::new(LibsqlConfig::in_memory())?;
        store.connect().await?;
        Ok(store)
    }

    #[tokio::test]
    async fn test_create_assigns_canonical_ids() -> anyhow::Result<()> {
        let store = store().await?;

        let user = store
            .create("users", doc(json!({"email": "a@x.com", "username": "a"})))
            .await?;
        let user_id = document_id(&user).expect("user id");
        assert!(user_id.parse::<i64>().is_ok());
        assert_eq!(user["isActive"], json!(true));

        let conv = store
            .create("conversations", doc(json!({"userId": user_id, "title": "Hello"})))
            .await?;
        let conv_id = document_id(&conv).expect("conversation id");
        assert_eq!(conv_id.len(), 36);
        assert!(conv.get("id").is_none());

        let found = store.find_by_id("conversations", &conv_id).await?.expect("found");
        assert_eq!(found["title"], json!("Hello"));
        assert_eq!(found[ID_FIELD], json!(conv_id));
        Ok(())
    }

    #[tokio::test]
    async fn test_unique_violation_is_conflict() -> anyhow::Result<()> {
        let store = store().await?;
        store
            .create("users", doc(json!({"email": "a@x.com", "username": "a"})))
            .await?;
        let err = store
            .create("users", doc(json!({"email": "a@x.com", "username": "b"})))
            .await
            .unwrap_err();
        assert!(err.is_conflict(), "got {err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn test_update_inc_and_unset() -> anyhow::Result<()> {
        let store = store().await?;
        let conv = store
            .create(
                "conversations",
                doc(json!({"userId": "1", "title": "T", "metadata": {"k": "v"}})),
            )
            .await?;
        let id = document_id(&conv).unwrap();

        let updated = store
            .update_by_id(
                "conversations",
                &id,
                &Update::new()
                    .set("title", "Renamed")
                    .inc("messageCount", 2)
                    .unset("metadata"),
            )
            .await?
            .expect("updated");
        assert_eq!(updated["title"], json!("Renamed"));
        assert_eq!(updated["messageCount"], json!(2));
        assert_eq!(updated["metadata"], Value::Null);

        assert!(store
            .update_by_id("conversations", "missing", &Update::new().set("title", "x"))
            .await?
            .is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_find_many_sort_limit_offset() -> anyhow::Result<()> {
        let store = store().await?;
        for i in 0..5 {
            store
                .create(
                    "messages",
                    doc(json!({
                        "conversationId": "c1",
                        "role": "user",
                        "content": format!("message {}", i),
                        "tokenCount": i,
                    })),
                )
                .await?;
        }

        let page = store
            .find_many(
                "messages",
                &Query::new().eq("conversationId", "c1"),
                &QueryOptions::new()
                    .sort_by("tokenCount", SortOrder::Desc)
                    .limit(2)
                    .offset(1),
            )
            .await?;
        let counts: Vec<_> = page.iter().map(|d| d["tokenCount"].clone()).collect();
        assert_eq!(counts, vec![json!(3), json!(2)]);

        let tail = store
            .find_many(
                "messages",
                &Query::new(),
                &QueryOptions::new().sort_by("tokenCount", SortOrder::Asc).offset(4),
            )
            .await?;
        assert_eq!(tail.len(), 1);

        let n = store
            .count(
                "messages",
                &Query::new().filter("tokenCount", Filter::Gte(json!(2))),
            )
            .await?;
        assert_eq!(n, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_integer_id_that_does_not_parse_matches_nothing() -> anyhow::Result<()> {
        let store = store().await?;
        assert!(store.find_by_id("users", "not-a-number").await?.is_none());
        assert!(!store.delete_by_id("users", "not-a-number").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_many_is_atomic() -> anyhow::Result<()> {
        let store = store().await?;
        let err = store
            .create_many(
                "tools",
                vec![
                    doc(json!({"name": "search"})),
                    doc(json!({"name": "search"})),
                ],
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.count("tools", &Query::new()).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_health_reports_pool_and_queries() -> anyhow::Result<()> {
        let store = store().await?;
        let health = store.health_check().await;
        assert!(health.healthy());
        assert_eq!(health.details["engine"], json!("libsql"));
        assert_eq!(health.details["pool"]["max"], json!(1));

        store.disconnect().await?;
        let health = store.health_check().await;
        assert!(!health.connected);
        Ok(())
    }
}
