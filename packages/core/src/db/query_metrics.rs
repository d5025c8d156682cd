//! Query Performance Tracking
//!
//! Records statement execution times for the relational adapter:
//!
//! - **Rolling Window**: the last `window` durations feed average and p95
//! - **Counters**: totals, errors and slow statements since the last reset
//! - **Slow Query Log**: statements over the threshold are logged with
//!   truncated SQL and parameters
//! - **Periodic Reset**: a background task clears the counters on an interval
//!
//! # Usage
//!
//! ```rust
//! use unistore_core::db::QueryMetrics;
//! use std::time::Duration;
//!
//! let metrics = QueryMetrics::new(100, Duration::from_millis(250));
//! metrics.record::<i64>("SELECT 1", &[], Duration::from_millis(3), true);
//! assert_eq!(metrics.snapshot().total, 1);
//! ```

use crate::db::error::{StoreError, StoreResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// SQL text longer than this is truncated in slow-query logs
const LOG_SQL_LIMIT: usize = 200;

/// Parameter lists longer than this are truncated in slow-query logs
const LOG_PARAMS_LIMIT: usize = 10;

/// Aggregated query statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub errors: u64,
    pub slow: u64,
    pub avg_ms: f64,
    pub p95_ms: f64,
    /// Samples currently in the rolling window
    pub window: usize,
}

#[derive(Debug, Default)]
struct MetricsState {
    samples: VecDeque<Duration>,
    total: u64,
    errors: u64,
    slow: u64,
}

/// Thread-safe statement timing collector
#[derive(Debug)]
pub struct QueryMetrics {
    state: Mutex<MetricsState>,
    window: usize,
    slow_threshold: Duration,
}

impl QueryMetrics {
    pub fn new(window: usize, slow_threshold: Duration) -> Self {
        Self {
            state: Mutex::new(MetricsState::default()),
            window: window.max(1),
            slow_threshold,
        }
    }

    pub fn slow_threshold(&self) -> Duration {
        self.slow_threshold
    }

    /// Record one statement execution
    pub fn record<P: std::fmt::Debug>(
        &self,
        sql: &str,
        params: &[P],
        elapsed: Duration,
        success: bool,
    ) {
        let slow = elapsed >= self.slow_threshold;
        {
            let mut state = self.state.lock();
            state.total += 1;
            if !success {
                state.errors += 1;
            }
            if slow {
                state.slow += 1;
            }
            if state.samples.len() == self.window {
                state.samples.pop_front();
            }
            state.samples.push_back(elapsed);
        }

        if slow {
            tracing::warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = self.slow_threshold.as_millis() as u64,
                sql = %truncate(sql, LOG_SQL_LIMIT),
                params = ?&params[..params.len().min(LOG_PARAMS_LIMIT)],
                "slow query"
            );
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock();
        let mut sorted: Vec<Duration> = state.samples.iter().copied().collect();
        sorted.sort();

        let avg_ms = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().map(Duration::as_secs_f64).sum::<f64>() * 1000.0 / sorted.len() as f64
        };

        MetricsSnapshot {
            total: state.total,
            errors: state.errors,
            slow: state.slow,
            avg_ms,
            p95_ms: percentile(&sorted, 95.0).as_secs_f64() * 1000.0,
            window: sorted.len(),
        }
    }

    pub fn reset(&self) {
        *self.state.lock() = MetricsState::default();
    }

    /// Run `fut` against `timeout`, recording the outcome
    ///
    /// Expiry yields `StoreError::Timeout`; the statement future is dropped,
    /// which is cooperative cancellation only.
    pub async fn track<T, P, F>(
        &self,
        sql: &str,
        params: &[P],
        timeout: Duration,
        fut: F,
    ) -> StoreResult<T>
    where
        P: std::fmt::Debug,
        F: Future<Output = StoreResult<T>>,
    {
        let start = Instant::now();
        let result = match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                operation: truncate(sql, LOG_SQL_LIMIT),
                elapsed_ms: start.elapsed().as_millis() as u64,
            }),
        };
        self.record(sql, params, start.elapsed(), result.is_ok());
        result
    }

    /// Spawn a task that resets the counters every `interval`
    ///
    /// The task holds a weak reference and exits once the metrics are dropped.
    pub fn spawn_reset_task(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(metrics) => {
                        tracing::debug!(snapshot = ?metrics.snapshot(), "resetting query metrics");
                        metrics.reset();
                    }
                    None => break,
                }
            }
        })
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit).collect();
    out.push('…');
    out
}

/// Calculate percentile from sorted durations
fn percentile(sorted_durations: &[Duration], percentile: f64) -> Duration {
    if sorted_durations.is_empty() {
        return Duration::from_nanos(0);
    }

    let index = ((percentile / 100.0) * (sorted_durations.len() as f64 - 1.0)).round() as usize;
    sorted_durations[index.min(sorted_durations.len() - 1)]
}
