//! libsql Connection Pool
//!
//! A small bounded pool over a `libsql::Database`:
//!
//! - A semaphore caps connections in use at `max_size`
//! - `min_size` connections are opened up front and kept through reaping
//! - Idle connections older than `idle_timeout` are closed by the keep-alive
//!   task, which also pings the survivors with `SELECT 1`
//! - `acquire` waits at most `acquire_timeout` before failing with
//!   "pool exhausted"
//!
//! Connections are handed out as [`PooledConnection`] guards and return to the
//! pool on drop. A guard dropped while its connection is still inside a
//! transaction discards the connection instead of returning it.
//!
//! # Busy Timeout
//!
//! Every local connection sets `PRAGMA busy_timeout` and enables foreign keys,
//! so concurrent writers wait for the lock instead of failing with
//! "database is locked".
//!
//! # In-Memory Databases
//!
//! Each libsql connection to `:memory:` is a separate database, so a memory
//! pool is clamped to a single connection that is never reaped. A memory
//! connection dropped mid-transaction is rolled back and reused.

use crate::db::error::{StoreError, StoreResult};
use libsql::{Builder, Connection, Database};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Path that selects a private in-memory database
pub const MEMORY_PATH: &str = ":memory:";

/// Pool sizing and timing
#[derive(Debug, Clone, PartialEq)]
pub struct PoolOptions {
    pub min_size: usize,
    pub max_size: usize,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub busy_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            idle_timeout: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(5),
            keep_alive_interval: Duration::from_secs(60),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Where the pool's database lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolTarget {
    /// Local file path, or `:memory:`
    Local(String),
    /// Remote libsql / Turso endpoint
    Remote { url: String, auth_token: String },
}

impl PoolTarget {
    pub fn is_memory(&self) -> bool {
        matches!(self, PoolTarget::Local(path) if path == MEMORY_PATH)
    }

    fn is_local(&self) -> bool {
        matches!(self, PoolTarget::Local(_))
    }
}

/// Point-in-time pool occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Open connections (idle + in use)
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Callers currently blocked in `acquire`
    pub waiting: usize,
    pub max: usize,
}

struct IdleConnection {
    conn: Connection,
    since: Instant,
}

struct PoolInner {
    db: Database,
    target: PoolTarget,
    options: PoolOptions,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection>>,
    size: AtomicUsize,
    waiting: AtomicUsize,
    closed: AtomicBool,
}

/// Bounded libsql connection pool
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Open the database and pre-warm `min_size` connections
    pub async fn open(target: PoolTarget, mut options: PoolOptions) -> StoreResult<Self> {
        if target.is_memory() {
            options.min_size = 1;
            options.max_size = 1;
        }
        options.max_size = options.max_size.max(1);
        options.min_size = options.min_size.min(options.max_size);

        let db = match &target {
            PoolTarget::Local(path) => Builder::new_local(path).build().await,
            PoolTarget::Remote { url, auth_token } => {
                Builder::new_remote(url.clone(), auth_token.clone())
                    .build()
                    .await
            }
        }
        .map_err(|e| StoreError::connection(format!("failed to open database: {}", e)))?;

        let pool = Self {
            inner: Arc::new(PoolInner {
                db,
                semaphore: Arc::new(Semaphore::new(options.max_size)),
                target,
                options,
                idle: Mutex::new(VecDeque::new()),
                size: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        };

        for _ in 0..pool.inner.options.min_size {
            let conn = pool.inner.open_connection().await?;
            pool.inner.size.fetch_add(1, Ordering::SeqCst);
            pool.inner.idle.lock().push_back(IdleConnection {
                conn,
                since: Instant::now(),
            });
        }

        tracing::debug!(
            min = pool.inner.options.min_size,
            max = pool.inner.options.max_size,
            memory = pool.inner.target.is_memory(),
            "connection pool opened"
        );
        Ok(pool)
    }

    /// Borrow a connection, waiting up to `acquire_timeout`
    pub async fn acquire(&self) -> StoreResult<PooledConnection> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(StoreError::connection("connection pool is closed"));
        }

        self.inner.waiting.fetch_add(1, Ordering::SeqCst);
        let permit = tokio::time::timeout(
            self.inner.options.acquire_timeout,
            self.inner.semaphore.clone().acquire_owned(),
        )
        .await;
        self.inner.waiting.fetch_sub(1, Ordering::SeqCst);

        let permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(StoreError::connection("connection pool is closed")),
            Err(_) => {
                return Err(StoreError::connection(format!(
                    "pool exhausted: no connection available within {}ms ({} in use)",
                    self.inner.options.acquire_timeout.as_millis(),
                    self.inner.options.max_size
                )))
            }
        };

        let reused = self.inner.idle.lock().pop_back();
        let conn = match reused {
            Some(idle) => idle.conn,
            None => {
                let conn = self.inner.open_connection().await?;
                self.inner.size.fetch_add(1, Ordering::SeqCst);
                conn
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            permit: Some(permit),
            pool: Arc::clone(&self.inner),
        })
    }

    pub fn status(&self) -> PoolStatus {
        let idle = self.inner.idle.lock().len();
        let size = self.inner.size.load(Ordering::SeqCst);
        PoolStatus {
            size,
            idle,
            in_use: size.saturating_sub(idle),
            waiting: self.inner.waiting.load(Ordering::SeqCst),
            max: self.inner.options.max_size,
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close idle connections and refuse further acquisitions
    ///
    /// Borrowed connections are closed as their guards drop.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.semaphore.close();
        let drained = std::mem::take(&mut *self.inner.idle.lock());
        self.inner.size.fetch_sub(drained.len(), Ordering::SeqCst);
        tracing::debug!(closed = drained.len(), "connection pool closed");
    }

    /// Spawn the reaping / keep-alive task
    ///
    /// The task holds a weak reference and exits once the pool is dropped or
    /// closed.
    pub fn spawn_keep_alive(&self) -> tokio::task::JoinHandle<()> {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.options.keep_alive_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                inner.reap_idle();
                inner.ping_idle().await;
            }
        })
    }
}

impl PoolInner {
    async fn open_connection(&self) -> StoreResult<Connection> {
        let conn = self
            .db
            .connect()
            .map_err(|e| StoreError::connection(format!("failed to connect: {}", e)))?;

        if self.target.is_local() {
            let busy = format!("PRAGMA busy_timeout = {}", self.options.busy_timeout.as_millis());
            execute_pragma(&conn, &busy).await?;
            execute_pragma(&conn, "PRAGMA foreign_keys = ON").await?;
        }
        Ok(conn)
    }

    /// Close idle connections past `idle_timeout`, keeping `min_size` open
    fn reap_idle(&self) {
        if self.target.is_memory() {
            return;
        }
        let mut idle = self.idle.lock();
        let mut reaped = 0;
        while self.size.load(Ordering::SeqCst) > self.options.min_size {
            match idle.front() {
                Some(oldest) if oldest.since.elapsed() >= self.options.idle_timeout => {
                    idle.pop_front();
                    self.size.fetch_sub(1, Ordering::SeqCst);
                    reaped += 1;
                }
                _ => break,
            }
        }
        if reaped > 0 {
            tracing::debug!(reaped, "closed idle connections");
        }
    }

    /// Ping each idle connection, holding a permit while it is checked out
    async fn ping_idle(&self) {
        let count = self.idle.lock().len();
        for _ in 0..count {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                return;
            };
            let Some(idle) = self.idle.lock().pop_front() else {
                return;
            };
            let alive = match idle.conn.query("SELECT 1", ()).await {
                Ok(mut rows) => rows.next().await.map(|_| ()),
                Err(e) => Err(e),
            };
            match alive {
                Ok(()) => self.idle.lock().push_back(idle),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping connection that failed keep-alive");
                    self.size.fetch_sub(1, Ordering::SeqCst);
                }
            }
            drop(permit);
        }
    }

    fn release(&self, conn: Connection) {
        if self.closed.load(Ordering::SeqCst) {
            self.size.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        self.idle.lock().push_back(IdleConnection {
            conn,
            since: Instant::now(),
        });
    }
}

/// Execute a PRAGMA statement
///
/// PRAGMA statements return rows, so they go through `query` rather than
/// `execute`.
pub(crate) async fn execute_pragma(conn: &Connection, pragma: &str) -> StoreResult<()> {
    let mut stmt = conn
        .prepare(pragma)
        .await
        .map_err(|e| StoreError::connection(format!("failed to execute '{}': {}", pragma, e)))?;
    let mut rows = stmt
        .query(())
        .await
        .map_err(|e| StoreError::connection(format!("failed to execute '{}': {}", pragma, e)))?;
    rows.next()
        .await
        .map_err(|e| StoreError::connection(format!("failed to execute '{}': {}", pragma, e)))?;
    Ok(())
}

/// RAII guard over a borrowed connection
pub struct PooledConnection {
    conn: Option<Connection>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `Drop` takes the connection out
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else { return };
        let permit = self.permit.take();

        if conn.is_autocommit() {
            self.pool.release(conn);
            drop(permit);
            return;
        }

        if self.pool.target.is_memory() {
            // The only connection holds the whole database: roll back instead
            // of discarding, and keep the permit until it is back in the pool.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let pool = Arc::clone(&self.pool);
                handle.spawn(async move {
                    if let Err(e) = conn.execute("ROLLBACK", ()).await {
                        tracing::warn!(error = %e, "rollback of abandoned transaction failed");
                    }
                    pool.release(conn);
                    drop(permit);
                });
                return;
            }
        }

        tracing::warn!("discarding connection returned inside an open transaction");
        self.pool.size.fetch_sub(1, Ordering::SeqCst);
        drop(permit);
    }
}
