//! Subcommands and the state they share

pub mod cluster;
pub mod monitor;
pub mod server;
pub mod sync;
pub mod version;

use anyhow::{Context, Result};
use colored::*;
use comfy_table::{Cell, Color};
use fleetops_core::{
    ClusterManager, ClusterMonitor, ConfigSyncManager, FleetError, FleetSettings, Registry,
    ServerStatus, SshConnector, Store,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Components wired to the on-disk state directory
pub struct App {
    pub settings: FleetSettings,
    pub registry: Arc<Registry>,
    pub clusters: ClusterManager,
    pub sync: ConfigSyncManager,
    pub monitor: ClusterMonitor,
}

impl App {
    pub fn load(state_dir: Option<PathBuf>) -> Result<Self> {
        let settings = FleetSettings::load()?;
        let root = state_dir.unwrap_or_else(|| settings.state_dir());
        let store = Store::open(&root)
            .with_context(|| format!("Failed to open state directory {}", root.display()))?;
        debug!("Using state directory {}", root.display());

        let registry = Arc::new(Registry::with_store(
            Arc::new(SshConnector),
            settings.registry(),
            store.clone(),
        )?);
        let clusters = ClusterManager::with_store(Arc::clone(&registry), store.clone())?;
        let sync = ConfigSyncManager::with_store(Arc::clone(&registry), settings.sync(), store.clone())?;
        let monitor = ClusterMonitor::with_store(Arc::clone(&registry), settings.monitor(), store)?;

        Ok(Self {
            settings,
            registry,
            clusters,
            sync,
            monitor,
        })
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn status_cell(status: ServerStatus) -> Cell {
    let color = match status {
        ServerStatus::Online => Color::Green,
        ServerStatus::Offline => Color::Red,
        ServerStatus::Unknown => Color::Yellow,
    };
    Cell::new(status.as_str()).fg(color)
}

pub fn ok_cell(success: bool) -> Cell {
    if success {
        Cell::new("✓").fg(Color::Green)
    } else {
        Cell::new("✗").fg(Color::Red)
    }
}

/// Split comma separated values and drop empties
pub fn split_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn print_summary(success: usize, total: usize) {
    println!();
    if success == total {
        println!("{} {}/{} succeeded", "✓".green().bold(), success, total);
    } else {
        println!("{} {}/{} succeeded", "⚠".yellow().bold(), success, total);
    }
}

/// Print an error with hints for the common failure kinds
pub fn handle_error(error: &anyhow::Error) {
    eprintln!("{} Error: {}", "✗".red(), error);

    if std::env::var("DEBUG").is_ok() {
        for cause in error.chain().skip(1) {
            eprintln!("  caused by: {}", cause);
        }
    }

    match error.downcast_ref::<FleetError>() {
        Some(FleetError::Authentication(_)) => {
            eprintln!("\nHints:");
            eprintln!("  • Check the private key path and its permissions");
            eprintln!("  • Check the username and password");
        }
        Some(FleetError::Network(_)) | Some(FleetError::Timeout(_)) => {
            eprintln!("\nHints:");
            eprintln!("  • Check the host address and port");
            eprintln!("  • Run `fleetops server test <name>` to probe the connection");
        }
        Some(FleetError::NotFound { kind, .. }) => {
            eprintln!("\nHint: list known entries with `fleetops {}`", list_command(kind));
        }
        _ => {}
    }
}

fn list_command(kind: &str) -> &'static str {
    match kind {
        "cluster" => "cluster list",
        "sync profile" => "sync list",
        "monitoring task" => "monitor list-tasks",
        _ => "server list",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_list() {
        let values = vec!["web1,web2".to_string(), " db1 ".to_string(), ",".to_string()];
        assert_eq!(split_list(&values), vec!["web1", "web2", "db1"]);
    }
}
