//! SurrealStore - Document StoreAdapter Implementation
//!
//! Implements `StoreAdapter` over SurrealDB through the `any` engine, so one
//! type serves embedded (`mem://`, `rocksdb://path`) and remote (`http://`)
//! deployments.
//!
//! # Design Principles
//!
//! 1. **SCHEMALESS Tables**: one table per logical collection, defined on connect
//! 2. **Record IDs**: records live at `table:<_id>` and also carry `_id` as a
//!    plain field; reads `OMIT id` so callers only ever see the string `_id`
//! 3. **Uniqueness**: UNIQUE indexes on `_id` and on each collection's natural
//!    keys, so duplicate writes surface as `StoreError::Conflict`
//! 4. **Bound Parameters**: query values travel as `$pN` bindings, never as
//!    statement text
//!
//! # Transactions
//!
//! SurrealDB has no interactive client-side transactions. Writes made through
//! a [`Transaction`] are staged and sent as one
//! `BEGIN TRANSACTION; … COMMIT TRANSACTION;` request on commit, which the
//! server applies atomically. Point reads inside the transaction see the
//! transaction's own staged writes; queries see committed state.
//!
//! # Examples
//!
//! ```rust,no_run
//! use unistore_core::db::{StoreAdapter, SurrealConfig, SurrealStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = SurrealStore::new(SurrealConfig::memory());
//!     store.connect().await?;
//!     let found = store.find_by_id("users", "550e8400-e29b-41d4-a716-446655440000").await?;
//!     assert!(found.is_none());
//!     Ok(())
//! }
//! ```

use crate::db::error::{StoreError, StoreResult};
use crate::db::store_adapter::{
    BackendKind, StoreAdapter, StoreHealth, Transaction, TransactionOps,
};
use crate::models::{
    check_field_path, collections, document_id, Accumulator, AggregateSpec, Document, Filter,
    stamp_created, Populate, Query, QueryOptions, Update, ID_FIELD,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;
use surrealdb::engine::any::{self, Any};
use surrealdb::opt::auth::Root;
use surrealdb::Surreal;

/// Natural keys that must stay unique per collection
const UNIQUE_FIELDS: &[(&str, &[&str])] = &[
    (collections::USERS, &["email"]),
    (collections::USERS, &["username"]),
    (collections::AGENTS, &["name"]),
    (collections::TOOLS, &["name"]),
    (collections::API_KEYS, &["keyPrefix"]),
    (collections::SETTINGS, &["userId", "key"]),
    (collections::FEEDBACK, &["messageId", "userId"]),
];

/// Document adapter settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurrealConfig {
    /// `mem://`, `rocksdb://<path>`, or `http://host:port`
    pub url: String,
    pub namespace: String,
    pub database: String,
    /// Root credentials for remote endpoints
    pub username: Option<String>,
    pub password: Option<String>,
}

impl SurrealConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            namespace: "unistore".to_string(),
            database: "main".to_string(),
            username: None,
            password: None,
        }
    }

    /// Embedded in-memory database
    pub fn memory() -> Self {
        Self::new("mem://")
    }
}

/// SurrealStore implements StoreAdapter for SurrealDB
pub struct SurrealStore {
    config: SurrealConfig,
    db: RwLock<Option<Surreal<Any>>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl SurrealStore {
    pub fn new(config: SurrealConfig) -> Self {
        Self {
            config,
            db: RwLock::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SurrealConfig {
        &self.config
    }

    fn db(&self) -> StoreResult<Surreal<Any>> {
        self.db
            .read()
            .clone()
            .ok_or_else(|| StoreError::connection("document store is not connected"))
    }

    /// Define every collection table and its unique indexes
    ///
    /// All statements use `IF NOT EXISTS`, so this is safe to run on every connect.
    async fn initialize_schema(db: &Surreal<Any>) -> StoreResult<()> {
        let mut ddl = String::new();
        for table in collections::ALL {
            ddl.push_str(&format!(
                "DEFINE TABLE IF NOT EXISTS {table} SCHEMALESS;\n\
                 DEFINE INDEX IF NOT EXISTS {table}_id_unique ON TABLE {table} FIELDS `{ID_FIELD}` UNIQUE;\n"
            ));
        }
        for (table, fields) in UNIQUE_FIELDS {
            let name = fields.join("_").to_lowercase();
            let columns: Vec<String> = fields.iter().map(|f| quote_path(f)).collect();
            ddl.push_str(&format!(
                "DEFINE INDEX IF NOT EXISTS {table}_{name}_unique ON TABLE {table} FIELDS {} UNIQUE;\n",
                columns.join(", ")
            ));
        }

        db.query(ddl)
            .await
            .and_then(|response| response.check())
            .map_err(|e| StoreError::connection(format!("failed to initialize schema: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl StoreAdapter for SurrealStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Document
    }

    async fn connect(&self) -> StoreResult<()> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let db = any::connect(self.config.url.as_str())
            .await
            .map_err(|e| {
                StoreError::connection(format!("failed to connect to {}: {}", self.config.url, e))
            })?;

        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            db.signin(Root {
                username: username.as_str(),
                password: password.as_str(),
            })
            .await
            .map_err(|e| StoreError::connection(format!("sign-in failed: {}", e)))?;
        }

        db.use_ns(self.config.namespace.as_str())
            .use_db(self.config.database.as_str())
            .await
            .map_err(|e| {
                StoreError::connection(format!(
                    "failed to use namespace '{}' and database '{}': {}",
                    self.config.namespace, self.config.database, e
                ))
            })?;

        Self::initialize_schema(&db).await?;
        *self.db.write() = Some(db);

        tracing::info!(url = %self.config.url, "document store connected");
        Ok(())
    }

    async fn disconnect(&self) -> StoreResult<()> {
        if self.db.write().take().is_some() {
            tracing::info!("document store disconnected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.db.read().is_some()
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> StoreResult<Option<Document>> {
        find_by_id(&self.db()?, collection, id).await
    }

    async fn find_many(
        &self,
        collection: &str,
        query: &Query,
        options: &QueryOptions,
    ) -> StoreResult<Vec<Document>> {
        let db = self.db()?;
        let mut docs = find_many(&db, collection, query, options).await?;
        for hint in &options.populate {
            populate(&db, &mut docs, hint).await?;
        }
        Ok(docs)
    }

    async fn count(&self, collection: &str, query: &Query) -> StoreResult<u64> {
        let db = self.db()?;
        let mut statement = SurrealStatement::new(collection)?;
        let condition = statement.where_clause(query)?;
        let sql = format!(
            "SELECT count() AS n FROM type::table($tb){} GROUP ALL",
            condition
        );
        let rows = statement.fetch(&db, &sql, "count").await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("n"))
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    async fn aggregate(
        &self,
        collection: &str,
        spec: &AggregateSpec,
    ) -> StoreResult<Vec<Document>> {
        spec.check()?;
        let db = self.db()?;
        let mut statement = SurrealStatement::new(collection)?;
        let condition = statement.where_clause(&spec.filter)?;

        let mut select = Vec::new();
        if let Some(group) = &spec.group_by {
            select.push(quote_path(group));
        }
        for (alias, acc) in &spec.accumulators {
            let expr = match acc {
                Accumulator::Count => "count()".to_string(),
                Accumulator::Sum(f) => format!("math::sum({})", quote_path(f)),
                Accumulator::Avg(f) => format!("math::mean({})", quote_path(f)),
                Accumulator::Min(f) => format!("math::min({})", quote_path(f)),
                Accumulator::Max(f) => format!("math::max({})", quote_path(f)),
            };
            select.push(format!("{} AS {}", expr, quote_path(alias)));
        }
        let grouping = match &spec.group_by {
            Some(group) => format!(" GROUP BY {}", quote_path(group)),
            None => " GROUP ALL".to_string(),
        };
        let sql = format!(
            "SELECT {} FROM type::table($tb){}{}",
            select.join(", "),
            condition,
            grouping
        );

        let rows = statement.fetch(&db, &sql, "aggregate").await?;
        let mut results: Vec<Document> = rows
            .into_iter()
            .map(|mut row| {
                let key = match &spec.group_by {
                    Some(group) => take_path(&mut row, group),
                    None => Value::Null,
                };
                row.insert(ID_FIELD.to_string(), key);
                row
            })
            .collect();
        if spec.group_by.is_some() {
            results.sort_by(|a, b| compare_values(&a[ID_FIELD], &b[ID_FIELD]));
        } else if results.is_empty() {
            // GROUP ALL over no rows yields nothing; report the empty totals instead
            let mut empty = Document::new();
            empty.insert(ID_FIELD.to_string(), Value::Null);
            for (alias, acc) in &spec.accumulators {
                let value = match acc {
                    Accumulator::Count | Accumulator::Sum(_) => json!(0),
                    _ => Value::Null,
                };
                empty.insert(alias.clone(), value);
            }
            results.push(empty);
        }
        Ok(results)
    }

    async fn create(&self, collection: &str, data: Document) -> StoreResult<Document> {
        let db = self.db()?;
        let (id, data) = prepare_create(collection, data)?;
        db.query("CREATE type::thing($tb, $id) CONTENT $data RETURN NONE")
            .bind(("tb", collection.to_string()))
            .bind(("id", id.clone()))
            .bind(("data", Value::Object(data)))
            .await
            .and_then(|response| response.check())
            .map_err(|e| StoreError::from_surreal(collection, "create", e))?;

        find_by_id(&db, collection, &id)
            .await?
            .ok_or_else(|| StoreError::query(format!("created {} record {} not found", collection, id)))
    }

    async fn create_many(
        &self,
        collection: &str,
        data: Vec<Document>,
    ) -> StoreResult<Vec<Document>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let db = self.db()?;
        let mut batch = StagedBatch::default();
        let mut ids = Vec::with_capacity(data.len());
        for item in data {
            let (id, item) = prepare_create(collection, item)?;
            batch.stage_create(collection, &id, item);
            ids.push(id);
        }
        batch.flush(&db, collection).await?;

        let found = find_many(
            &db,
            collection,
            &Query::new().filter(
                ID_FIELD,
                Filter::In(ids.iter().cloned().map(Value::String).collect()),
            ),
            &QueryOptions::new(),
        )
        .await?;
        let mut by_id: HashMap<String, Document> = found
            .into_iter()
            .filter_map(|d| document_id(&d).map(|id| (id, d)))
            .collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn update_by_id(
        &self,
        collection: &str,
        id: &str,
        update: &Update,
    ) -> StoreResult<Option<Document>> {
        let db = self.db()?;
        if !update.is_empty() {
            let mut statement = SurrealStatement::new(collection)?;
            let assignments = statement.set_clause(&update.touched())?;
            statement.bind("id", Value::String(id.to_string()));
            let sql = format!(
                "UPDATE type::table($tb) SET {} WHERE `{}` = $id RETURN NONE",
                assignments, ID_FIELD
            );
            statement.execute(&db, &sql, "update").await?;
        }
        find_by_id(&db, collection, id).await
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
        let db = self.db()?;
        let ids = matching_ids(&db, collection, query).await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let mut statement = SurrealStatement::new(collection)?;
        let assignments = statement.set_clause(&update.touched())?;
        let count = ids.len() as u64;
        statement.bind("ids", json!(ids));
        let sql = format!(
            "UPDATE type::table($tb) SET {} WHERE `{}` INSIDE $ids RETURN NONE",
            assignments, ID_FIELD
        );
        statement.execute(&db, &sql, "update_many").await?;
        Ok(count)
    }

    async fn delete_by_id(&self, collection: &str, id: &str) -> StoreResult<bool> {
        let db = self.db()?;
        let existed = !matching_ids(&db, collection, &Query::by_id(id)).await?.is_empty();
        if existed {
            let mut statement = SurrealStatement::new(collection)?;
            statement.bind("id", Value::String(id.to_string()));
            statement
                .execute(&db, "DELETE type::thing($tb, $id) RETURN NONE", "delete")
                .await?;
        }
        Ok(existed)
    }

    async fn delete_many(&self, collection: &str, query: &Query) -> StoreResult<u64> {
        let db = self.db()?;
        let ids = matching_ids(&db, collection, query).await?;
        if ids.is_empty() {
            return Ok(0);
        }
        let count = ids.len() as u64;
        let mut statement = SurrealStatement::new(collection)?;
        statement.bind("ids", json!(ids));
        let sql = format!(
            "DELETE type::table($tb) WHERE `{}` INSIDE $ids RETURN NONE",
            ID_FIELD
        );
        statement.execute(&db, &sql, "delete_many").await?;
        Ok(count)
    }

    async fn start_transaction(&self) -> StoreResult<Transaction> {
        Ok(Transaction::new(Box::new(SurrealTransaction {
            db: self.db()?,
            batch: StagedBatch::default(),
            overlay: HashMap::new(),
        })))
    }

    async fn health_check(&self) -> StoreHealth {
        let start = Instant::now();
        let details = json!({
            "engine": "surrealdb",
            "url": self.config.url,
            "namespace": self.config.namespace,
            "database": self.config.database,
        });

        let error = match self.db() {
            Ok(db) => db.health().await.err().map(|e| e.to_string()),
            Err(e) => {
                return StoreHealth {
                    backend: self.backend(),
                    connected: false,
                    latency_ms: 0,
                    details,
                    error: Some(e.to_string()),
                }
            }
        };

        StoreHealth {
            backend: self.backend(),
            connected: error.is_none(),
            latency_ms: start.elapsed().as_millis() as u64,
            details,
            error,
        }
    }
}

/// Staged-write transaction flushed as a single BEGIN/COMMIT request
struct SurrealTransaction {
    db: Surreal<Any>,
    batch: StagedBatch,
    /// Staged post-write state: `None` marks a staged delete
    overlay: HashMap<(String, String), Option<Document>>,
}

impl SurrealTransaction {
    async fn current(&self, collection: &str, id: &str) -> StoreResult<Option<Document>> {
        match self.overlay.get(&(collection.to_string(), id.to_string())) {
            Some(staged) => Ok(staged.clone()),
            None => find_by_id(&self.db, collection, id).await,
        }
    }
}

#[async_trait]
impl TransactionOps for SurrealTransaction {
    async fn create(&mut self, collection: &str, data: Document) -> StoreResult<Document> {
        let (id, data) = prepare_create(collection, data)?;
        if self.current(collection, &id).await?.is_some() {
            return Err(StoreError::conflict(
                collection,
                format!("record {} already exists", id),
            ));
        }
        self.batch.stage_create(collection, &id, data.clone());
        self.overlay
            .insert((collection.to_string(), id), Some(data.clone()));
        Ok(data)
    }

    async fn find_by_id(&mut self, collection: &str, id: &str) -> StoreResult<Option<Document>> {
        self.current(collection, id).await
    }

    async fn find_many(
        &mut self,
        collection: &str,
        query: &Query,
        options: &QueryOptions,
    ) -> StoreResult<Vec<Document>> {
        find_many(&self.db, collection, query, options).await
    }

    async fn update_by_id(
        &mut self,
        collection: &str,
        id: &str,
        update: &Update,
    ) -> StoreResult<Option<Document>> {
        let Some(mut doc) = self.current(collection, id).await? else {
            return Ok(None);
        };
        if !update.is_empty() {
            let update = update.touched();
            self.batch.stage_update(collection, id, &update)?;
            update.apply_to(&mut doc);
            self.overlay
                .insert((collection.to_string(), id.to_string()), Some(doc.clone()));
        }
        Ok(Some(doc))
    }

    async fn delete_by_id(&mut self, collection: &str, id: &str) -> StoreResult<bool> {
        if self.current(collection, id).await?.is_none() {
            return Ok(false);
        }
        self.batch.stage_delete(collection, id);
        self.overlay
            .insert((collection.to_string(), id.to_string()), None);
        Ok(true)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let this = *self;
        this.batch
            .flush(&this.db, "transaction")
            .await
            .map_err(|e| match e {
                conflict @ StoreError::Conflict { .. } => conflict,
                other => StoreError::transaction(other.to_string()),
            })
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        tracing::debug!(
            staged = self.batch.statements.len(),
            "discarding staged transaction writes"
        );
        Ok(())
    }
}

/// Statements plus bindings queued for one atomic request
#[derive(Default)]
struct StagedBatch {
    statements: Vec<String>,
    bindings: Vec<(String, Value)>,
}

impl StagedBatch {
    fn next_param(&mut self, value: Value) -> String {
        let name = format!("s{}", self.bindings.len());
        self.bindings.push((name.clone(), value));
        name
    }

    fn stage_create(&mut self, collection: &str, id: &str, data: Document) {
        let tb = self.next_param(Value::String(collection.to_string()));
        let rid = self.next_param(Value::String(id.to_string()));
        let content = self.next_param(Value::Object(data));
        self.statements.push(format!(
            "CREATE type::thing(${tb}, ${rid}) CONTENT ${content} RETURN NONE"
        ));
    }

    fn stage_update(&mut self, collection: &str, id: &str, update: &Update) -> StoreResult<()> {
        let prefix = format!("s{}_", self.bindings.len());
        let mut statement = SurrealStatement::with_prefix(collection, prefix)?;
        let assignments = statement.set_clause(update)?;
        self.bindings
            .extend(statement.params.into_iter().filter(|(name, _)| name != "tb"));
        let tb = self.next_param(Value::String(collection.to_string()));
        let rid = self.next_param(Value::String(id.to_string()));
        self.statements.push(format!(
            "UPDATE type::thing(${tb}, ${rid}) SET {assignments} RETURN NONE"
        ));
        Ok(())
    }

    fn stage_delete(&mut self, collection: &str, id: &str) {
        let tb = self.next_param(Value::String(collection.to_string()));
        let rid = self.next_param(Value::String(id.to_string()));
        self.statements
            .push(format!("DELETE type::thing(${tb}, ${rid}) RETURN NONE"));
    }

    async fn flush(self, db: &Surreal<Any>, context: &str) -> StoreResult<()> {
        if self.statements.is_empty() {
            return Ok(());
        }
        let mut sql = String::from("BEGIN TRANSACTION;\n");
        for statement in &self.statements {
            sql.push_str(statement);
            sql.push_str(";\n");
        }
        sql.push_str("COMMIT TRANSACTION;");

        let mut query = db.query(sql);
        for binding in self.bindings {
            query = query.bind(binding);
        }
        query
            .await
            .and_then(|response| response.check())
            .map_err(|e| StoreError::from_surreal(context, "commit", e))?;
        Ok(())
    }
}

/// One SurrealQL statement under construction with its `$pN` bindings
struct SurrealStatement {
    collection: String,
    prefix: String,
    params: Vec<(String, Value)>,
}

impl SurrealStatement {
    fn new(collection: &str) -> StoreResult<Self> {
        Self::with_prefix(collection, String::new())
    }

    /// Parameters are named `$<prefix>pN` so several statements can share one request
    fn with_prefix(collection: &str, prefix: String) -> StoreResult<Self> {
        if !collections::is_known(collection) {
            return Err(StoreError::UnknownCollection(collection.to_string()));
        }
        Ok(Self {
            collection: collection.to_string(),
            prefix,
            params: vec![("tb".to_string(), Value::String(collection.to_string()))],
        })
    }

    fn bind(&mut self, name: &str, value: Value) {
        self.params.push((name.to_string(), value));
    }

    fn param(&mut self, value: Value) -> String {
        let name = format!("{}p{}", self.prefix, self.params.len());
        self.params.push((name.clone(), value));
        format!("${}", name)
    }

    /// `" WHERE …"` or empty
    fn where_clause(&mut self, query: &Query) -> StoreResult<String> {
        Ok(match self.condition(query)? {
            Some(condition) => format!(" WHERE {}", condition),
            None => String::new(),
        })
    }

    fn condition(&mut self, query: &Query) -> StoreResult<Option<String>> {
        let mut parts = Vec::new();
        for (field, filter) in &query.fields {
            parts.push(self.filter(field, filter)?);
        }
        for clause in &query.all_of {
            if let Some(condition) = self.condition(clause)? {
                parts.push(condition);
            }
        }
        if !query.any_of.is_empty() {
            let mut alternatives = Vec::with_capacity(query.any_of.len());
            for alternative in &query.any_of {
                alternatives.push(
                    self.condition(alternative)?
                        .unwrap_or_else(|| "true".to_string()),
                );
            }
            parts.push(format!("({})", alternatives.join(" OR ")));
        }
        Ok(match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(parts.join(" AND ")),
        })
    }

    fn filter(&mut self, field: &str, filter: &Filter) -> StoreResult<String> {
        check_field_path(field)?;
        let f = quote_path(field);
        Ok(match filter {
            Filter::Eq(Value::Null) | Filter::Exists(false) => {
                format!("({f} = NONE OR {f} = NULL)")
            }
            Filter::Ne(Value::Null) | Filter::Exists(true) => {
                format!("({f} != NONE AND {f} != NULL)")
            }
            Filter::Eq(value) => format!("{f} = {}", self.param(value.clone())),
            Filter::Ne(value) => format!("{f} != {}", self.param(value.clone())),
            Filter::Gt(value) => format!("{f} > {}", self.scalar(field, value)?),
            Filter::Gte(value) => format!("{f} >= {}", self.scalar(field, value)?),
            Filter::Lt(value) => format!("{f} < {}", self.scalar(field, value)?),
            Filter::Lte(value) => format!("{f} <= {}", self.scalar(field, value)?),
            Filter::In(values) => {
                if values.is_empty() {
                    return Ok("false".to_string());
                }
                let has_null = values.iter().any(Value::is_null);
                let list: Vec<Value> = values.iter().filter(|v| !v.is_null()).cloned().collect();
                let membership = format!("{f} INSIDE {}", self.param(Value::Array(list)));
                if has_null {
                    format!("({membership} OR {f} = NONE OR {f} = NULL)")
                } else {
                    membership
                }
            }
            Filter::NotIn(values) => {
                if values.is_empty() {
                    return Ok("true".to_string());
                }
                let has_null = values.iter().any(Value::is_null);
                let list: Vec<Value> = values.iter().filter(|v| !v.is_null()).cloned().collect();
                let exclusion = format!("{f} NOTINSIDE {}", self.param(Value::Array(list)));
                if has_null {
                    format!("({exclusion} AND {f} != NONE AND {f} != NULL)")
                } else {
                    exclusion
                }
            }
            Filter::Contains {
                needle,
                case_insensitive: true,
            } => format!(
                "string::contains(string::lowercase(type::string({f} ?? '')), {})",
                self.param(Value::String(needle.to_lowercase()))
            ),
            Filter::Contains {
                needle,
                case_insensitive: false,
            } => format!(
                "string::contains(type::string({f} ?? ''), {})",
                self.param(Value::String(needle.clone()))
            ),
            Filter::And(filters) => {
                if filters.is_empty() {
                    return Err(StoreError::translation(format!(
                        "empty conjunction on field '{}'",
                        field
                    )));
                }
                let mut parts = Vec::with_capacity(filters.len());
                for inner in filters {
                    parts.push(self.filter(field, inner)?);
                }
                format!("({})", parts.join(" AND "))
            }
        })
    }

    fn scalar(&mut self, field: &str, value: &Value) -> StoreResult<String> {
        match value {
            Value::Null | Value::Array(_) | Value::Object(_) => Err(StoreError::translation(
                format!("cannot order-compare '{}' against {}", field, value),
            )),
            other => Ok(self.param(other.clone())),
        }
    }

    fn set_clause(&mut self, update: &Update) -> StoreResult<String> {
        let mut assignments = Vec::new();
        for (field, value) in &update.set {
            if field == ID_FIELD {
                continue;
            }
            check_field_path(field)?;
            let param = self.param(value.clone());
            assignments.push(format!("{} = {}", quote_path(field), param));
        }
        for (field, delta) in &update.inc {
            check_field_path(field)?;
            let param = self.param(Value::Number(delta.clone()));
            let f = quote_path(field);
            assignments.push(format!("{f} = ({f} ?? 0) + {param}"));
        }
        for field in &update.unset {
            check_field_path(field)?;
            assignments.push(format!("{} = NONE", quote_path(field)));
        }
        if assignments.is_empty() {
            return Err(StoreError::translation("update does not change any field"));
        }
        Ok(assignments.join(", "))
    }

    fn order_and_paging(&mut self, options: &QueryOptions) -> StoreResult<String> {
        let mut tail = String::new();
        if !options.sort.is_empty() {
            let mut parts = Vec::with_capacity(options.sort.len());
            for (field, order) in &options.sort {
                check_field_path(field)?;
                parts.push(format!("{} {}", quote_path(field), order.as_keyword()));
            }
            tail.push_str(&format!(" ORDER BY {}", parts.join(", ")));
        }
        if let Some(limit) = options.limit {
            tail.push_str(&format!(" LIMIT {}", self.param(json!(limit))));
        }
        if let Some(offset) = options.offset {
            tail.push_str(&format!(" START {}", self.param(json!(offset))));
        }
        Ok(tail)
    }

    async fn fetch(self, db: &Surreal<Any>, sql: &str, context: &str) -> StoreResult<Vec<Document>> {
        let collection = self.collection;
        let mut query = db.query(sql);
        for binding in self.params {
            query = query.bind(binding);
        }
        let mut response = query
            .await
            .and_then(|response| response.check())
            .map_err(|e| StoreError::from_surreal(&collection, context, e))?;
        let rows: Vec<Value> = response
            .take(0)
            .map_err(|e| StoreError::from_surreal(&collection, context, e))?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row {
                Value::Object(doc) => Some(doc),
                _ => None,
            })
            .collect())
    }

    async fn execute(self, db: &Surreal<Any>, sql: &str, context: &str) -> StoreResult<()> {
        let collection = self.collection;
        let mut query = db.query(sql);
        for binding in self.params {
            query = query.bind(binding);
        }
        query
            .await
            .and_then(|response| response.check())
            .map_err(|e| StoreError::from_surreal(&collection, context, e))?;
        Ok(())
    }
}

/// Backtick-quote each segment of a validated field path
fn quote_path(path: &str) -> String {
    path.split('.')
        .map(|segment| format!("`{}`", segment))
        .collect::<Vec<_>>()
        .join(".")
}

/// Remove and return the value at a dotted path
fn take_path(doc: &mut Document, path: &str) -> Value {
    match path.split_once('.') {
        None => doc.remove(path).unwrap_or(Value::Null),
        Some((head, rest)) => match doc.get_mut(head) {
            Some(Value::Object(inner)) => {
                let value = take_path(inner, rest);
                if inner.is_empty() {
                    doc.remove(head);
                }
                value
            }
            _ => Value::Null,
        },
    }
}

fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(std::cmp::Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Null, Value::Null) => std::cmp::Ordering::Equal,
        (Value::Null, _) => std::cmp::Ordering::Less,
        (_, Value::Null) => std::cmp::Ordering::Greater,
        _ => a.to_string().cmp(&b.to_string()),
    }
}

/// Assign the canonical id and check field names before a create
fn prepare_create(collection: &str, mut data: Document) -> StoreResult<(String, Document)> {
    if !collections::is_known(collection) {
        return Err(StoreError::UnknownCollection(collection.to_string()));
    }
    for field in data.keys() {
        check_field_path(field)?;
        if field == "id" {
            return Err(StoreError::translation(format!(
                "field 'id' is reserved on {}",
                collection
            )));
        }
    }
    let id = match data.get(ID_FIELD) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => uuid::Uuid::new_v4().to_string(),
    };
    data.insert(ID_FIELD.to_string(), Value::String(id.clone()));
    stamp_created(&mut data);
    Ok((id, data))
}

async fn find_many(
    db: &Surreal<Any>,
    collection: &str,
    query: &Query,
    options: &QueryOptions,
) -> StoreResult<Vec<Document>> {
    let mut statement = SurrealStatement::new(collection)?;
    let condition = statement.where_clause(query)?;
    let tail = statement.order_and_paging(options)?;

    let selection = match &options.projection {
        None => "* OMIT id".to_string(),
        Some(fields) => {
            let mut columns: BTreeSet<String> = BTreeSet::new();
            columns.insert(quote_path(ID_FIELD));
            for field in fields.iter().chain(options.sort.iter().map(|(f, _)| f)) {
                check_field_path(field)?;
                columns.insert(quote_path(field));
            }
            columns.into_iter().collect::<Vec<_>>().join(", ")
        }
    };

    let sql = format!(
        "SELECT {} FROM type::table($tb){}{}",
        selection, condition, tail
    );
    statement.fetch(db, &sql, "find").await
}

async fn find_by_id(
    db: &Surreal<Any>,
    collection: &str,
    id: &str,
) -> StoreResult<Option<Document>> {
    let mut docs = find_many(
        db,
        collection,
        &Query::by_id(id),
        &QueryOptions::new().limit(1),
    )
    .await?;
    Ok(docs.pop())
}

async fn matching_ids(db: &Surreal<Any>, collection: &str, query: &Query) -> StoreResult<Vec<String>> {
    let docs = find_many(
        db,
        collection,
        query,
        &QueryOptions::new().project([ID_FIELD]),
    )
    .await?;
    Ok(docs.iter().filter_map(document_id).collect())
}

/// Replace reference ids at `hint.path` with the referenced documents
async fn populate(db: &Surreal<Any>, docs: &mut [Document], hint: &Populate) -> StoreResult<()> {
    check_field_path(&hint.path)?;
    let ids: BTreeSet<String> = docs
        .iter()
        .filter_map(|doc| match doc.get(&hint.path) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .collect();
    if ids.is_empty() {
        return Ok(());
    }

    let related = find_many(
        db,
        &hint.collection,
        &Query::new().filter(ID_FIELD, Filter::In(ids.into_iter().map(Value::String).collect())),
        &QueryOptions::new(),
    )
    .await?;
    let by_id: HashMap<String, Document> = related
        .into_iter()
        .filter_map(|d| document_id(&d).map(|id| (id, d)))
        .collect();

    for doc in docs.iter_mut() {
        let key = match doc.get(&hint.path) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => continue,
        };
        if let Some(target) = by_id.get(&key) {
            doc.insert(hint.path.clone(), Value::Object(target.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::doc;

    #[test]
    fn test_where_clause_binds_every_value() {
        let mut statement = SurrealStatement::new("messages").unwrap();
        let q = Query::from_json(&json!({
            "role": "user",
            "tokenCount": {"$gte": 3},
            "metadata.source": {"$in": ["web", null]},
            "content": {"$regex": "Hello", "$options": "i"}
        }))
        .unwrap();
        let sql = statement.where_clause(&q).unwrap();

        assert!(sql.starts_with(" WHERE "));
        assert!(sql.contains("`metadata`.`source` INSIDE $p"));
        assert!(sql.contains("string::lowercase"));
        assert!(!sql.contains("Hello"));
        assert!(!sql.contains("'user'"));
        // tb + one binding per operand
        assert_eq!(statement.params.len(), 5);
        assert_eq!(statement.params[0].0, "tb");
    }

    #[test]
    fn test_unknown_collection_is_rejected() {
        assert!(matches!(
            SurrealStatement::new("ghosts"),
            Err(StoreError::UnknownCollection(_))
        ));
    }

    #[test]
    fn test_set_clause_handles_inc_and_unset() {
        let mut statement = SurrealStatement::new("conversations").unwrap();
        let sql = statement
            .set_clause(&Update::new().set("title", "x").inc("messageCount", 1).unset("draft"))
            .unwrap();
        assert_eq!(
            sql,
            "`title` = $p1, `messageCount` = (`messageCount` ?? 0) + $p2, `draft` = NONE"
        );
    }

    #[test]
    fn test_staged_update_uses_batch_unique_names() {
        let mut batch = StagedBatch::default();
        batch.stage_create("tools", "t1", doc(json!({"name": "a"})));
        batch
            .stage_update("tools", "t1", &Update::new().set("name", "b").inc("uses", 1))
            .unwrap();
        let names: BTreeSet<_> = batch.bindings.iter().map(|(n, _)| n.clone()).collect();
        assert_eq!(names.len(), batch.bindings.len());
        assert!(batch.statements[1].starts_with("UPDATE type::thing($s"));
        assert!(!batch.statements[1].contains("$p"));
    }

    #[test]
    fn test_take_path_reads_nested_group_keys() {
        let mut row = doc(json!({"metadata": {"source": "web"}, "total": 2}));
        assert_eq!(take_path(&mut row, "metadata.source"), json!("web"));
        assert!(row.get("metadata").is_none());
        assert_eq!(row["total"], json!(2));
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() -> anyhow::Result<()> {
        let store = SurrealStore::new(SurrealConfig::memory());
        store.connect().await?;

        let created = store
            .create("users", doc(json!({"email": "a@x.com", "username": "a"})))
            .await?;
        let id = document_id(&created).expect("id");
        assert!(created.get("id").is_none());

        let found = store.find_by_id("users", &id).await?.expect("found");
        assert_eq!(found["email"], json!("a@x.com"));

        let dup = store
            .create("users", doc(json!({"email": "a@x.com", "username": "b"})))
            .await
            .unwrap_err();
        assert!(dup.is_conflict(), "got {dup:?}");

        assert!(store.delete_by_id("users", &id).await?);
        assert!(!store.delete_by_id("users", &id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_writes_stamp_timestamps() -> anyhow::Result<()> {
        use crate::models::{CREATED_AT_FIELD, UPDATED_AT_FIELD};

        let store = SurrealStore::new(SurrealConfig::memory());
        store.connect().await?;

        let created = store
            .create("conversations", doc(json!({"userId": "u1", "title": "first"})))
            .await?;
        let id = document_id(&created).expect("id");
        let created_at = created[CREATED_AT_FIELD].clone();
        assert!(created_at.is_string());
        assert_eq!(created[UPDATED_AT_FIELD], created_at);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let updated = store
            .update_by_id("conversations", &id, &Update::new().set("title", "second"))
            .await?
            .expect("updated");
        assert_eq!(updated[CREATED_AT_FIELD], created_at);
        assert!(updated[UPDATED_AT_FIELD].as_str() > created_at.as_str());

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let mut tx = store.start_transaction().await?;
        let staged = tx
            .update_by_id("conversations", &id, &Update::new().set("title", "third"))
            .await?
            .expect("staged");
        tx.commit().await?;
        let committed = store.find_by_id("conversations", &id).await?.expect("found");
        assert_eq!(committed[UPDATED_AT_FIELD], staged[UPDATED_AT_FIELD]);
        assert!(committed[UPDATED_AT_FIELD].as_str() > updated[UPDATED_AT_FIELD].as_str());
        Ok(())
    }
}
