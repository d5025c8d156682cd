//! Health Monitor
//!
//! Periodically checks the primary store, the search engine and the process
//! itself, and keeps the latest [`HealthReport`] for readiness and liveness
//! endpoints.
//!
//! ## Status model
//!
//! Each component reports a [`HealthStatus`]. The overall status is derived
//! in this order:
//!
//! 1. any component in `error` → `unhealthy`
//! 2. store `down` → `down`
//! 3. every component `healthy` (a `disabled` search engine counts) → `healthy`
//! 4. otherwise → `degraded`
//!
//! Readiness depends on the store alone. Checks never fail; problems are
//! reported in the report.

use crate::db::{StoreAdapter, StoreHealth};
use crate::models::now_timestamp;
use crate::search::{SearchHealth, SearchIndexer};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Store round trips slower than this are reported as degraded
pub const SLOW_STORE_THRESHOLD: Duration = Duration::from_secs(1);

/// Resident memory above this is reported as degraded
pub const MEMORY_WARN_BYTES: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
    Unhealthy,
    Disabled,
    Error,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Down => "down",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Disabled => "disabled",
            HealthStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub details: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: String,
    pub uptime_secs: u64,
    pub store: ComponentHealth,
    pub search: ComponentHealth,
    pub process: ComponentHealth,
}

impl HealthReport {
    pub fn is_ready(&self) -> bool {
        matches!(
            self.store.status,
            HealthStatus::Healthy | HealthStatus::Degraded
        )
    }
}

/// Combine component statuses into the overall status
pub fn overall_status(store: HealthStatus, others: &[HealthStatus]) -> HealthStatus {
    let mut all = std::iter::once(&store).chain(others);
    if store == HealthStatus::Error || others.contains(&HealthStatus::Error) {
        HealthStatus::Unhealthy
    } else if store == HealthStatus::Down {
        HealthStatus::Down
    } else if all.all(|s| matches!(s, HealthStatus::Healthy | HealthStatus::Disabled)) {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    }
}

fn store_component(health: StoreHealth) -> ComponentHealth {
    let status = match (health.connected, &health.error) {
        (false, _) => HealthStatus::Down,
        (true, Some(_)) => HealthStatus::Error,
        (true, None) if health.latency_ms > SLOW_STORE_THRESHOLD.as_millis() as u64 => {
            HealthStatus::Degraded
        }
        (true, None) => HealthStatus::Healthy,
    };
    ComponentHealth {
        status,
        latency_ms: health.latency_ms,
        message: health.error,
        details: json!({
            "backend": health.backend,
            "metrics": health.details,
        }),
    }
}

fn search_component(health: SearchHealth) -> ComponentHealth {
    let status = match (health.enabled, health.reachable) {
        (false, _) => HealthStatus::Disabled,
        (true, true) => HealthStatus::Healthy,
        (true, false) => HealthStatus::Down,
    };
    ComponentHealth {
        status,
        latency_ms: health.latency_ms,
        message: health.error,
        details: json!({ "enabled": health.enabled }),
    }
}

/// Resident set size from `/proc/self/status`, where the platform has it
fn resident_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    vm_rss_bytes(&status)
}

/// Bytes from a `VmRSS:   1234 kB` line
fn vm_rss_bytes(status: &str) -> Option<u64> {
    let line = status.lines().find_map(|l| l.strip_prefix("VmRSS:"))?;
    let mut parts = line.split_whitespace();
    let kib: u64 = parts.next()?.parse().ok()?;
    match parts.next() {
        Some("kB") => kib.checked_mul(1024),
        _ => None,
    }
}

fn process_component(uptime: Duration) -> ComponentHealth {
    let rss = resident_memory_bytes();
    let status = match rss {
        Some(bytes) if bytes > MEMORY_WARN_BYTES => HealthStatus::Degraded,
        _ => HealthStatus::Healthy,
    };
    ComponentHealth {
        status,
        latency_ms: 0,
        message: rss.is_none().then(|| "memory usage unavailable".to_string()),
        details: json!({
            "pid": std::process::id(),
            "rssBytes": rss,
            "uptimeSecs": uptime.as_secs(),
        }),
    }
}

/// The checks behind every report
#[derive(Clone)]
struct HealthChecks {
    store: Arc<dyn StoreAdapter>,
    indexer: SearchIndexer,
    started: Instant,
}

impl HealthChecks {
    async fn check(&self) -> HealthReport {
        let (store, search) =
            tokio::join!(self.store.health_check(), self.indexer.health_check());
        let uptime = self.started.elapsed();

        let store = store_component(store);
        let search = search_component(search);
        let process = process_component(uptime);
        HealthReport {
            status: overall_status(store.status, &[search.status, process.status]),
            checked_at: now_timestamp(),
            uptime_secs: uptime.as_secs(),
            store,
            search,
            process,
        }
    }
}

/// Health monitor with an optional background check loop
pub struct HealthMonitor {
    checks: HealthChecks,
    latest: Arc<RwLock<Option<HealthReport>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn StoreAdapter>, indexer: SearchIndexer) -> Self {
        Self {
            checks: HealthChecks {
                store,
                indexer,
                started: Instant::now(),
            },
            latest: Arc::new(RwLock::new(None)),
            shutdown_tx: None,
            task: None,
        }
    }

    /// Start checking every `interval`; a running loop is left as is
    pub fn start(&mut self, interval: Duration) {
        if self.is_running() {
            return;
        }
        tracing::info!(interval_secs = interval.as_secs(), "HealthMonitor starting");

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let checks = self.checks.clone();
        let latest = self.latest.clone();
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => {
                        tracing::info!("HealthMonitor shutting down");
                        break;
                    }

                    _ = ticker.tick() => {
                        let report = checks.check().await;
                        Self::record(&latest, report);
                    }
                }
            }
        }));
        self.shutdown_tx = Some(shutdown_tx);
    }

    /// Stop the background loop and wait for it to exit
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "HealthMonitor task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Check immediately and remember the result
    pub async fn check_now(&self) -> HealthReport {
        let report = self.checks.check().await;
        Self::record(&self.latest, report.clone());
        report
    }

    /// Most recent report, if any check has run
    pub fn latest(&self) -> Option<HealthReport> {
        self.latest.read().clone()
    }

    /// Whether the primary store can serve requests
    pub async fn is_ready(&self) -> bool {
        let health = self.checks.store.health_check().await;
        matches!(
            store_component(health).status,
            HealthStatus::Healthy | HealthStatus::Degraded
        )
    }

    fn record(latest: &RwLock<Option<HealthReport>>, report: HealthReport) {
        let previous = latest.read().as_ref().map(|r| r.status);
        if previous != Some(report.status) {
            match report.status {
                HealthStatus::Healthy => {
                    tracing::info!(status = %report.status, "health status changed")
                }
                _ => tracing::warn!(
                    status = %report.status,
                    store = %report.store.status,
                    search = %report.search.status,
                    "health status changed"
                ),
            }
        }
        *latest.write() = Some(report);
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{LibsqlConfig, LibsqlStore};
    use HealthStatus::*;

    #[test]
    fn test_overall_status_precedence() {
        assert_eq!(overall_status(Healthy, &[Disabled, Healthy]), Healthy);
        assert_eq!(overall_status(Healthy, &[Down, Healthy]), Degraded);
        assert_eq!(overall_status(Degraded, &[Healthy, Healthy]), Degraded);
        assert_eq!(overall_status(Down, &[Healthy, Healthy]), Down);
        assert_eq!(overall_status(Down, &[Error, Healthy]), Unhealthy);
        assert_eq!(overall_status(Healthy, &[Healthy, Error]), Unhealthy);
    }

    #[test]
    fn test_store_component_mapping() {
        let health = |connected: bool, error: Option<&str>, latency_ms: u64| StoreHealth {
            backend: crate::db::BackendKind::Relational,
            connected,
            latency_ms,
            details: Value::Null,
            error: error.map(str::to_string),
        };
        assert_eq!(store_component(health(true, None, 3)).status, Healthy);
        assert_eq!(store_component(health(true, None, 5000)).status, Degraded);
        assert_eq!(store_component(health(false, Some("refused"), 0)).status, Down);
        assert_eq!(store_component(health(true, Some("odd"), 1)).status, Error);
    }

    #[tokio::test]
    async fn test_reports_follow_store_state() -> anyhow::Result<()> {
        let store: Arc<dyn StoreAdapter> = Arc::new(LibsqlStore::new(LibsqlConfig::in_memory())?);
        store.connect().await?;
        let monitor = HealthMonitor::new(store.clone(), SearchIndexer::disabled(store.clone()));

        let report = monitor.check_now().await;
        assert_eq!(report.status, Healthy);
        assert_eq!(report.search.status, Disabled);
        assert!(report.is_ready());
        assert!(monitor.is_ready().await);
        assert_eq!(monitor.latest().map(|r| r.status), Some(Healthy));

        store.disconnect().await?;
        let report = monitor.check_now().await;
        assert_eq!(report.status, Down);
        assert!(!report.is_ready());
        assert!(!monitor.is_ready().await);
        Ok(())
    }

    #[tokio::test]
    async fn test_background_loop_publishes_and_stops() -> anyhow::Result<()> {
        let store: Arc<dyn StoreAdapter> = Arc::new(LibsqlStore::new(LibsqlConfig::in_memory())?);
        store.connect().await?;
        let mut monitor = HealthMonitor::new(store.clone(), SearchIndexer::disabled(store));

        monitor.start(Duration::from_millis(20));
        assert!(monitor.is_running());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(monitor.latest().is_some());

        monitor.stop().await;
        assert!(!monitor.is_running());
        Ok(())
    }

    #[test]
    fn test_vm_rss_is_read_in_kibibytes() {
        let status = "Name:\tunistore\nVmPeak:\t  20480 kB\nVmRSS:\t   5120 kB\nThreads:\t4\n";
        assert_eq!(vm_rss_bytes(status), Some(5120 * 1024));
        assert_eq!(vm_rss_bytes("VmRSS:\t12 pages\n"), None);
        assert_eq!(vm_rss_bytes("Name:\tunistore\n"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resident_memory_is_reported_on_linux() {
        let rss = resident_memory_bytes().expect("VmRSS present");
        assert!(rss > 0);
        assert_eq!(rss % 1024, 0);
    }
}
