//! Server command - register servers and run commands on them

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::*;
use comfy_table::{presets::UTF8_FULL, Cell, Table};
use fleetops_core::{CommandOutput, ServerConfig};
use std::path::PathBuf;
use std::time::Duration;

use super::{print_json, split_list, status_cell, App};

#[derive(Args)]
pub struct ServerCommand {
    #[command(subcommand)]
    command: ServerSubcommand,
}

#[derive(Subcommand)]
enum ServerSubcommand {
    /// Register a server
    Add(AddCommand),

    /// List registered servers
    List(ListCommand),

    /// Unregister a server
    Remove(NameArg),

    /// Probe a registered server's connection
    Test(NameArg),

    /// Run a command on a server
    Exec(ExecCommand),

    /// Run a local script file on a server
    Script(ScriptCommand),
}

#[derive(Args)]
struct AddCommand {
    name: String,

    host: String,

    #[arg(short, long)]
    user: String,

    #[arg(short, long, default_value_t = 22)]
    port: u16,

    /// Private key path; takes precedence over the password
    #[arg(short, long)]
    key: Option<String>,

    #[arg(long, env = "FLEETOPS_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Tags, comma separated or repeated
    #[arg(short, long)]
    tag: Vec<String>,

    /// Probe the connection before registering
    #[arg(long)]
    test: bool,
}

#[derive(Args)]
struct ListCommand {
    /// Only servers carrying this tag
    #[arg(short, long)]
    tag: Option<String>,
}

#[derive(Args)]
struct NameArg {
    name: String,
}

#[derive(Args)]
struct ExecCommand {
    name: String,

    /// Command line to run
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,

    /// Deadline in seconds
    #[arg(short, long)]
    timeout: Option<u64>,
}

#[derive(Args)]
struct ScriptCommand {
    name: String,

    file: PathBuf,
}

impl ServerCommand {
    pub async fn execute(&self, app: &App, json: bool) -> Result<()> {
        match &self.command {
            ServerSubcommand::Add(cmd) => cmd.execute(app).await,
            ServerSubcommand::List(cmd) => cmd.execute(app, json).await,
            ServerSubcommand::Remove(cmd) => {
                app.registry.remove_server(&cmd.name).await?;
                println!("{} Removed server {}", "✓".green(), cmd.name.bold());
                Ok(())
            }
            ServerSubcommand::Test(cmd) => test_server(app, &cmd.name, json).await,
            ServerSubcommand::Exec(cmd) => cmd.execute(app, json).await,
            ServerSubcommand::Script(cmd) => cmd.execute(app, json).await,
        }
    }
}

impl AddCommand {
    async fn execute(&self, app: &App) -> Result<()> {
        let mut config = ServerConfig::new(&self.name, &self.host, &self.user).with_port(self.port);
        config.private_key_path = self.key.clone();
        config.password = self.password.clone();
        config.tags = split_list(&self.tag);

        if self.test {
            let latency = app.registry.test_connection(&config).await?;
            println!("{} Connected to {} in {}ms", "✓".green(), self.host, latency.as_millis());
        }

        app.registry.add_server(config).await?;
        println!("{} Added server {}", "✓".green(), self.name.bold());
        Ok(())
    }
}

impl ListCommand {
    async fn execute(&self, app: &App, json: bool) -> Result<()> {
        let servers = match &self.tag {
            Some(tag) => app.registry.servers_with_tag(tag).await,
            None => app.registry.list_servers().await,
        };

        if json {
            return print_json(&servers);
        }
        if servers.is_empty() {
            println!("{}", "No servers registered".yellow());
            return Ok(());
        }

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Name", "Address", "User", "Auth", "Tags", "Status"]);
        for server in &servers {
            let c = &server.config;
            let auth = if c.private_key_path.is_some() { "key" } else { "password" };
            table.add_row(vec![
                Cell::new(&c.name),
                Cell::new(format!("{}:{}", c.host, c.port)),
                Cell::new(&c.username),
                Cell::new(auth),
                Cell::new(c.tags.join(", ")),
                status_cell(server.status),
            ]);
        }
        println!("{table}");
        Ok(())
    }
}

async fn test_server(app: &App, name: &str, json: bool) -> Result<()> {
    let health = app.registry.check_server_health(name).await?;
    if json {
        return print_json(&health);
    }

    match (&health.error, health.response_time_ms) {
        (None, Some(ms)) => println!("{} {} is online ({}ms)", "✓".green(), name.bold(), ms),
        (Some(error), _) => println!("{} {} is offline: {}", "✗".red(), name.bold(), error),
        (None, None) => println!("{} {} is {}", "⚠".yellow(), name.bold(), health.status),
    }
    Ok(())
}

impl ExecCommand {
    async fn execute(&self, app: &App, json: bool) -> Result<()> {
        let command = self.command.join(" ");
        let output = match self.timeout {
            Some(secs) => {
                app.registry
                    .execute_command_with_timeout(&self.name, &command, Duration::from_secs(secs))
                    .await?
            }
            None => app.registry.execute_command(&self.name, &command).await?,
        };
        render_output(&output, json)
    }
}

impl ScriptCommand {
    async fn execute(&self, app: &App, json: bool) -> Result<()> {
        let script = std::fs::read_to_string(&self.file)
            .with_context(|| format!("Failed to read {}", self.file.display()))?;
        let output = app.registry.execute_script(&self.name, &script).await?;
        render_output(&output, json)
    }
}

fn render_output(output: &CommandOutput, json: bool) -> Result<()> {
    if json {
        return print_json(output);
    }

    print!("{}", output.output);
    if !output.output.is_empty() && !output.output.ends_with('\n') {
        println!();
    }

    if output.timed_out {
        eprintln!("{} timed out after {}ms", "✗".red(), output.duration_ms);
        std::process::exit(124);
    }
    if output.exit_code != 0 {
        eprintln!("{} exit code {}", "✗".red(), output.exit_code);
        std::process::exit(output.exit_code.clamp(1, 255));
    }
    Ok(())
}
