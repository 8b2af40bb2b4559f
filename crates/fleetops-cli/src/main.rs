//! fleetops - run commands, sync configuration and watch health across SSH servers
//!
//! This CLI provides tools for:
//! - Registering servers and running commands on them
//! - Grouping servers into clusters
//! - Pushing configuration files with checksum verification
//! - Periodic health checks and alerts

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{cluster, monitor, server, sync, version, App};

#[derive(Parser)]
#[command(name = "fleetops")]
#[command(author = "Fleetops Team")]
#[command(version)]
#[command(about = "Remote fleet operations over SSH", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Directory holding servers, clusters, profiles and tasks
    #[arg(long, global = true, env = "FLEETOPS_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Server registry and single-server commands
    Server(server::ServerCommand),

    /// Server groups and fan-out commands
    Cluster(cluster::ClusterCommand),

    /// Configuration sync profiles
    Sync(sync::SyncCommand),

    /// Health check tasks and alerts
    Monitor(monitor::MonitorCommand),

    /// Show version information
    Version(version::VersionCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let Some(command) = cli.command else {
        println!("{}", "fleetops".bold());
        println!();
        println!("Run {} for help", "fleetops --help".cyan());
        return Ok(());
    };

    let app = match App::load(cli.state_dir) {
        Ok(app) => app,
        Err(e) => {
            eprintln!("{} Failed to load state: {:#}", "✗".red(), e);
            std::process::exit(1);
        }
    };

    let result = match command {
        Commands::Server(cmd) => cmd.execute(&app, cli.json).await,
        Commands::Cluster(cmd) => cmd.execute(&app, cli.json).await,
        Commands::Sync(cmd) => cmd.execute(&app, cli.json).await,
        Commands::Monitor(cmd) => cmd.execute(&app, cli.json).await,
        Commands::Version(cmd) => cmd.execute(&app),
    };

    if let Err(e) = result {
        commands::handle_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
