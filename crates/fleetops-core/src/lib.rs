//! fleetops-core - Remote fleet management library
//!
//! This crate provides:
//! - SSH connections to remote servers
//! - A server registry that owns connections and dispatches commands
//! - Logical clusters with concurrent fan-out execution
//! - Scheduled health checks, metric collection and alerting
//! - Checksum-validated configuration sync
//!
//! Components share one explicitly constructed [`Registry`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use fleetops_core::{ClusterManager, FleetSettings, Registry, ServerConfig};
//!
//! # async fn demo() -> fleetops_core::Result<()> {
//! let settings = FleetSettings::default();
//! let registry = Arc::new(Registry::ssh(settings.registry()));
//! registry
//!     .add_server(ServerConfig::new("web1", "10.0.0.5", "deploy").with_private_key("~/.ssh/id_ed25519"))
//!     .await?;
//!
//! let clusters = ClusterManager::new(Arc::clone(&registry));
//! clusters
//!     .create_cluster("web", "frontends", vec!["web1".into()], vec![])
//!     .await?;
//! let report = clusters.execute_on_cluster("web", "uptime").await?;
//! println!("{} of {} succeeded", report.success_count, report.results.len());
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod fanout;
pub mod fingerprint;
pub mod metrics;
pub mod monitor;
pub mod registry;
pub mod remote;
pub mod ssh;
pub mod store;
pub mod sync;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use cluster::{Cluster, ClusterManager, ClusterUpdate};
pub use config::{FleetSettings, MonitorSettings, RegistrySettings, SyncSettings};
pub use error::{FleetError, Result};
pub use fanout::{FanOutReport, ServerExecResult};
pub use metrics::ServerMetrics;
pub use monitor::{
    AlertFilter, AlertSeverity, ClusterMonitor, HealthCheck, MonitoringAlert, MonitoringTask,
    ServerCheckOutcome, TaskRunReport, TaskState,
};
pub use registry::{Registry, ServerConfig, ServerHealth, ServerInfo, ServerStatus};
pub use remote::{CommandOutput, Connector, RemoteSession, SshConnector};
pub use ssh::{SshConnection, TunnelHandle};
pub use store::Store;
pub use sync::{ConfigSyncManager, SyncEvent, SyncEventType, SyncProfile, SyncResult};
pub use utils::expand_tilde;
