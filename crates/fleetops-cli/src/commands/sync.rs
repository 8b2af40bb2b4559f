//! Sync command - configuration profiles and their runs

use anyhow::Result;
use clap::{Args, Subcommand};
use colored::*;
use comfy_table::{presets::UTF8_FULL, Cell, Table};
use fleetops_core::{SyncEvent, SyncEventType, SyncProfile};

use super::{ok_cell, print_json, print_summary, split_list, App};

#[derive(Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: SyncSubcommand,
}

#[derive(Subcommand)]
enum SyncSubcommand {
    /// Define a sync profile
    Create(CreateCommand),

    /// List sync profiles
    List,

    /// Check a profile's source and servers
    Validate { name: String },

    /// Push a profile's source to its servers
    Run { name: String },

    /// Show what a run would transfer without touching servers
    DryRun { name: String },

    /// Show recent runs
    History(HistoryCommand),
}

#[derive(Args)]
struct CreateCommand {
    name: String,

    /// Local file or directory
    #[arg(long)]
    source: String,

    /// Remote path
    #[arg(long)]
    target: String,

    #[arg(short, long, required = true)]
    servers: Vec<String>,

    /// Glob patterns to leave out
    #[arg(short, long)]
    exclude: Vec<String>,

    /// Run before transferring; repeatable
    #[arg(long)]
    pre: Vec<String>,

    /// Run after a verified transfer; repeatable
    #[arg(long)]
    post: Vec<String>,

    /// Octal mode for transferred files, e.g. 0640
    #[arg(long)]
    mode: Option<String>,

    #[arg(long)]
    owner: Option<String>,

    #[arg(long)]
    group: Option<String>,

    #[arg(long)]
    no_backup: bool,

    #[arg(long)]
    no_validate: bool,

    #[arg(short, long)]
    tag: Vec<String>,
}

#[derive(Args)]
struct HistoryCommand {
    /// Only this profile
    profile: Option<String>,

    #[arg(short = 'n', long, default_value_t = 20)]
    limit: usize,
}

impl SyncCommand {
    pub async fn execute(&self, app: &App, json: bool) -> Result<()> {
        match &self.command {
            SyncSubcommand::Create(cmd) => cmd.execute(app, json).await,
            SyncSubcommand::List => list(app, json).await,
            SyncSubcommand::Validate { name } => {
                app.sync.validate_profile(name).await?;
                println!("{} Profile {} is ready to sync", "✓".green(), name.bold());
                Ok(())
            }
            SyncSubcommand::Run { name } => {
                let event = app.sync.sync_configuration(name).await?;
                render_event(&event, json)
            }
            SyncSubcommand::DryRun { name } => {
                let event = app.sync.dry_run(name).await?;
                render_event(&event, json)
            }
            SyncSubcommand::History(cmd) => {
                let history = app
                    .sync
                    .get_sync_history(cmd.profile.as_deref(), Some(cmd.limit))
                    .await;
                render_history(&history, json)
            }
        }
    }
}

impl CreateCommand {
    async fn execute(&self, app: &App, json: bool) -> Result<()> {
        let mut profile = SyncProfile::new(
            &self.name,
            &self.source,
            &self.target,
            split_list(&self.servers),
        );
        profile.excludes = split_list(&self.exclude);
        profile.pre_commands = self.pre.clone();
        profile.post_commands = self.post.clone();
        profile.permissions = self.mode.clone();
        profile.owner = self.owner.clone();
        profile.group = self.group.clone();
        profile.backup_before = !self.no_backup;
        profile.validate = !self.no_validate;
        profile.tags = split_list(&self.tag);

        let profile = app.sync.create_sync_profile(profile).await?;
        if json {
            return print_json(&profile);
        }
        println!(
            "{} Created sync profile {}: {} → {}",
            "✓".green(),
            profile.name.bold(),
            profile.source,
            profile.target
        );
        Ok(())
    }
}

async fn list(app: &App, json: bool) -> Result<()> {
    let profiles = app.sync.list_sync_profiles().await;
    if json {
        return print_json(&profiles);
    }
    if profiles.is_empty() {
        println!("{}", "No sync profiles defined".yellow());
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Name", "Source", "Target", "Servers", "Backup", "Verify"]);
    for p in &profiles {
        table.add_row(vec![
            Cell::new(&p.name),
            Cell::new(&p.source),
            Cell::new(&p.target),
            Cell::new(p.servers.join(", ")),
            ok_cell(p.backup_before),
            ok_cell(p.validate),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn render_event(event: &SyncEvent, json: bool) -> Result<()> {
    if json {
        return print_json(event);
    }

    if event.event_type == SyncEventType::DryRun {
        println!("{} Dry run, nothing was changed", "ℹ".cyan());
    }
    println!(
        "{} {} files, {} bytes, checksum {}\n",
        event.profile.bold(),
        event.total_files,
        event.total_bytes,
        short_hash(&event.source_checksum)
    );

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Server", "OK", "Files", "Skipped", "Bytes", "Time", "Detail"]);
    for (server, result) in &event.results {
        let detail = match (&result.error, &result.backup_path) {
            (Some(error), _) => error.clone(),
            (None, Some(backup)) => format!("backup: {}", backup),
            (None, None) => String::new(),
        };
        table.add_row(vec![
            Cell::new(server),
            ok_cell(result.success),
            Cell::new(result.files_updated),
            Cell::new(result.files_skipped),
            Cell::new(result.bytes_transferred),
            Cell::new(format!("{}ms", result.duration_ms)),
            Cell::new(detail),
        ]);
    }
    println!("{table}");
    print_summary(event.success_count, event.results.len());
    Ok(())
}

fn render_history(history: &[SyncEvent], json: bool) -> Result<()> {
    if json {
        return print_json(history);
    }
    if history.is_empty() {
        println!("{}", "No syncs recorded".yellow());
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["When", "Profile", "OK", "Failed", "Files", "Checksum"]);
    for event in history {
        table.add_row(vec![
            Cell::new(event.timestamp.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(&event.profile),
            Cell::new(event.success_count),
            Cell::new(event.failure_count),
            Cell::new(event.total_files),
            Cell::new(short_hash(&event.source_checksum)),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
