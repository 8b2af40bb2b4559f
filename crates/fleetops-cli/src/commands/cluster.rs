//! Cluster command - manage server groups and run commands across them

use anyhow::Result;
use clap::{Args, Subcommand};
use colored::*;
use comfy_table::{presets::UTF8_FULL, Cell, Table};
use fleetops_core::FanOutReport;

use super::{ok_cell, print_json, print_summary, split_list, App};

#[derive(Args)]
pub struct ClusterCommand {
    #[command(subcommand)]
    command: ClusterSubcommand,
}

#[derive(Subcommand)]
enum ClusterSubcommand {
    /// Create a cluster from registered servers
    Create(CreateCommand),

    /// List clusters
    List,

    /// Delete a cluster (servers stay registered)
    Delete { name: String },

    /// Run a command on every server in a cluster
    Exec(ExecCommand),
}

#[derive(Args)]
struct CreateCommand {
    name: String,

    /// Member servers, comma separated or repeated
    #[arg(short, long, required = true)]
    servers: Vec<String>,

    #[arg(short, long, default_value = "")]
    description: String,

    #[arg(short, long)]
    tag: Vec<String>,
}

#[derive(Args)]
struct ExecCommand {
    name: String,

    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

impl ClusterCommand {
    pub async fn execute(&self, app: &App, json: bool) -> Result<()> {
        match &self.command {
            ClusterSubcommand::Create(cmd) => {
                let cluster = app
                    .clusters
                    .create_cluster(
                        &cmd.name,
                        &cmd.description,
                        split_list(&cmd.servers),
                        split_list(&cmd.tag),
                    )
                    .await?;
                if json {
                    return print_json(&cluster);
                }
                println!(
                    "{} Created cluster {} ({} servers)",
                    "✓".green(),
                    cluster.name.bold(),
                    cluster.servers.len()
                );
                for server in &cluster.servers {
                    if !app.registry.contains(server).await {
                        println!("  {} {} is not registered yet", "⚠".yellow(), server);
                    }
                }
                Ok(())
            }
            ClusterSubcommand::List => list(app, json).await,
            ClusterSubcommand::Delete { name } => {
                app.clusters.delete_cluster(name).await?;
                println!("{} Deleted cluster {}", "✓".green(), name.bold());
                Ok(())
            }
            ClusterSubcommand::Exec(cmd) => {
                let report = app
                    .clusters
                    .execute_on_cluster(&cmd.name, &cmd.command.join(" "))
                    .await?;
                render_report(&report, json)
            }
        }
    }
}

async fn list(app: &App, json: bool) -> Result<()> {
    let clusters = app.clusters.list_clusters().await;
    if json {
        return print_json(&clusters);
    }
    if clusters.is_empty() {
        println!("{}", "No clusters defined".yellow());
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Name", "Description", "Servers", "Tags", "Updated"]);
    for cluster in &clusters {
        table.add_row(vec![
            Cell::new(&cluster.name),
            Cell::new(&cluster.description),
            Cell::new(cluster.servers.join(", ")),
            Cell::new(cluster.tags.join(", ")),
            Cell::new(cluster.updated_at.format("%Y-%m-%d %H:%M")),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub fn render_report(report: &FanOutReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Server", "OK", "Exit", "Time", "Output"]);
    for (server, result) in &report.results {
        let (exit, time, output) = match &result.output {
            Some(out) => (
                out.exit_code.to_string(),
                format!("{}ms", out.duration_ms),
                out.output.trim_end().to_string(),
            ),
            None => ("-".to_string(), "-".to_string(), String::new()),
        };
        let output = match &result.error {
            Some(error) if output.is_empty() => error.clone(),
            _ => output,
        };
        table.add_row(vec![
            Cell::new(server),
            ok_cell(result.success),
            Cell::new(exit),
            Cell::new(time),
            Cell::new(output),
        ]);
    }
    println!("{table}");
    print_summary(report.success_count, report.results.len());
    Ok(())
}
