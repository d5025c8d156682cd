//! Services
//!
//! Process-level coordination on top of the repositories:
//!
//! - `DatabaseManager` - owns the active adapter, the search indexer and the
//!   repository registry
//! - `HealthMonitor` - periodic store, search and process checks

pub mod database_manager;
pub mod error;
pub mod health_monitor;

pub use database_manager::{DatabaseHealth, DatabaseManager};
pub use error::ManagerError;
pub use health_monitor::{
    overall_status, ComponentHealth, HealthMonitor, HealthReport, HealthStatus,
};
