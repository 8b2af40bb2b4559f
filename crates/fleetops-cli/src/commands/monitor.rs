//! Monitor command - health check tasks and alerts

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use colored::*;
use comfy_table::{presets::UTF8_FULL, Cell, Color, Table};
use fleetops_core::{
    AlertFilter, AlertSeverity, HealthCheck, MonitoringAlert, MonitoringTask, ServerMetrics,
    TaskRunReport,
};
use std::time::Duration;
use tracing::{debug, info};

use super::{ok_cell, print_json, split_list, status_cell, App};

#[derive(Args)]
pub struct MonitorCommand {
    #[command(subcommand)]
    command: MonitorSubcommand,
}

#[derive(Subcommand)]
enum MonitorSubcommand {
    /// Define a monitoring task
    AddTask(AddTaskCommand),

    /// List monitoring tasks
    ListTasks,

    /// Enable or disable a task
    Enable {
        name: String,
        #[arg(long)]
        off: bool,
    },

    /// Delete a monitoring task
    RemoveTask { name: String },

    /// Run one task now and show the results
    Run { name: String },

    /// Run the scheduler until interrupted
    Watch,

    /// Run every enabled task once and list the resulting alerts
    Alerts(AlertsCommand),
}

#[derive(Args)]
struct AddTaskCommand {
    name: String,

    #[arg(short, long, required = true)]
    servers: Vec<String>,

    /// Check as NAME=COMMAND; repeatable
    #[arg(short, long)]
    check: Vec<String>,

    /// Check whose failure is critical, as NAME=COMMAND; repeatable
    #[arg(long)]
    critical: Vec<String>,

    /// Seconds between runs
    #[arg(short, long, default_value_t = 60)]
    interval: u64,

    /// Per-server deadline in seconds
    #[arg(short, long, default_value_t = 30)]
    timeout: u64,
}

#[derive(Args)]
struct AlertsCommand {
    #[arg(long)]
    severity: Option<String>,

    #[arg(long)]
    server: Option<String>,
}

impl MonitorCommand {
    pub async fn execute(&self, app: &App, json: bool) -> Result<()> {
        match &self.command {
            MonitorSubcommand::AddTask(cmd) => cmd.execute(app).await,
            MonitorSubcommand::ListTasks => list_tasks(app, json).await,
            MonitorSubcommand::Enable { name, off } => {
                app.monitor.set_task_enabled(name, !off).await?;
                let state = if *off { "disabled" } else { "enabled" };
                println!("{} Task {} {}", "✓".green(), name.bold(), state);
                Ok(())
            }
            MonitorSubcommand::RemoveTask { name } => {
                app.monitor.remove_task(name).await?;
                println!("{} Removed task {}", "✓".green(), name.bold());
                Ok(())
            }
            MonitorSubcommand::Run { name } => {
                let report = app.monitor.run_task(name).await?;
                render_run(app, &report, json).await
            }
            MonitorSubcommand::Watch => watch(app).await,
            MonitorSubcommand::Alerts(cmd) => cmd.execute(app, json).await,
        }
    }
}

fn parse_check(arg: &str) -> Result<HealthCheck> {
    match arg.split_once('=') {
        Some((name, command)) if !name.trim().is_empty() && !command.trim().is_empty() => {
            Ok(HealthCheck::new(name.trim(), command.trim()))
        }
        _ => bail!("check '{}' must look like NAME=COMMAND", arg),
    }
}

fn parse_severity(value: &str) -> Result<AlertSeverity> {
    match value.to_ascii_lowercase().as_str() {
        "info" => Ok(AlertSeverity::Info),
        "warning" | "warn" => Ok(AlertSeverity::Warning),
        "critical" | "crit" => Ok(AlertSeverity::Critical),
        other => bail!("unknown severity '{}'", other),
    }
}

impl AddTaskCommand {
    async fn execute(&self, app: &App) -> Result<()> {
        let mut checks = Vec::new();
        for arg in &self.check {
            checks.push(parse_check(arg)?);
        }
        for arg in &self.critical {
            checks.push(parse_check(arg)?.critical());
        }

        let task = MonitoringTask::new(&self.name, split_list(&self.servers), checks)
            .with_interval(self.interval)
            .with_timeout(self.timeout);
        app.monitor.add_task(task).await?;
        println!("{} Added monitoring task {}", "✓".green(), self.name.bold());
        Ok(())
    }
}

async fn list_tasks(app: &App, json: bool) -> Result<()> {
    let tasks = app.monitor.list_tasks().await;
    if json {
        return print_json(&tasks);
    }
    if tasks.is_empty() {
        println!("{}", "No monitoring tasks defined".yellow());
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Name", "Servers", "Checks", "Interval", "Enabled", "Last run"]);
    for task in &tasks {
        let checks: Vec<String> = task
            .checks
            .iter()
            .map(|c| if c.critical { format!("{}!", c.name) } else { c.name.clone() })
            .collect();
        let last_run = task
            .last_run
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        table.add_row(vec![
            Cell::new(&task.name),
            Cell::new(task.servers.join(", ")),
            Cell::new(checks.join(", ")),
            Cell::new(format!("{}s", task.interval_secs)),
            ok_cell(task.enabled),
            Cell::new(last_run),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn render_run(app: &App, report: &TaskRunReport, json: bool) -> Result<()> {
    let mut metrics = Vec::new();
    for server in report.servers.keys() {
        if let Some(m) = app.monitor.get_metrics(server).await {
            metrics.push(m);
        }
    }
    let alerts = app.monitor.get_alerts(&AlertFilter::default()).await;

    if json {
        return print_json(&serde_json::json!({
            "report": report,
            "metrics": metrics,
            "alerts": alerts,
        }));
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Server", "Status", "Passed", "Failed", "Error"]);
    for (server, outcome) in &report.servers {
        table.add_row(vec![
            Cell::new(server),
            status_cell(outcome.status),
            Cell::new(outcome.checks_passed),
            Cell::new(outcome.checks_failed),
            Cell::new(outcome.error.clone().unwrap_or_default()),
        ]);
    }
    println!("{table}");

    if !metrics.is_empty() {
        println!();
        print_metrics(&metrics);
    }
    if !alerts.is_empty() {
        println!();
        print_alerts(&alerts);
    }
    Ok(())
}

fn percent(v: Option<f64>) -> String {
    v.map(|v| format!("{:.1}%", v)).unwrap_or_else(|| "-".to_string())
}

fn print_metrics(metrics: &[ServerMetrics]) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Server", "Status", "Load", "CPU", "Memory", "Disk", "Procs", "Custom"]);
    for m in metrics {
        let load = m
            .load_average
            .map(|[a, b, c]| format!("{:.2} {:.2} {:.2}", a, b, c))
            .unwrap_or_else(|| "-".to_string());
        let custom: Vec<String> = m.custom.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        table.add_row(vec![
            Cell::new(&m.server),
            status_cell(m.status),
            Cell::new(load),
            Cell::new(percent(m.cpu_percent)),
            Cell::new(percent(m.memory_percent)),
            Cell::new(percent(m.disk_percent)),
            Cell::new(m.process_count.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())),
            Cell::new(custom.join(" ")),
        ]);
    }
    println!("{table}");
}

fn print_alerts(alerts: &[MonitoringAlert]) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Time", "Severity", "Server", "Check", "Message"]);
    for alert in alerts {
        let color = match alert.severity {
            AlertSeverity::Critical => Color::Red,
            AlertSeverity::Warning => Color::Yellow,
            AlertSeverity::Info => Color::Cyan,
        };
        table.add_row(vec![
            Cell::new(alert.timestamp.format("%H:%M:%S")),
            Cell::new(alert.severity).fg(color),
            Cell::new(&alert.server),
            Cell::new(&alert.check_name),
            Cell::new(&alert.message),
        ]);
    }
    println!("{table}");
}

async fn watch(app: &App) -> Result<()> {
    if app.monitor.list_tasks().await.is_empty() {
        bail!("no monitoring tasks defined; add one with `fleetops monitor add-task`");
    }

    app.monitor.start_monitoring().await?;
    info!("Monitoring started with a {}ms tick", app.settings.monitor_tick_ms);
    println!(
        "{} Monitoring every {}ms, press Ctrl+C to stop",
        "⏳".cyan(),
        app.settings.monitor_tick_ms
    );

    let mut seen = 0;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupt received, stopping monitoring");
                break;
            }
            _ = ticker.tick() => {
                let alerts = app.monitor.get_alerts(&AlertFilter::default()).await;
                // The alert log is capped, so restart from the top if it shrank
                if alerts.len() < seen {
                    seen = 0;
                }
                if alerts.len() > seen {
                    debug!("{} new alerts", alerts.len() - seen);
                    print_alerts(&alerts[seen..]);
                    seen = alerts.len();
                }
            }
        }
    }

    app.monitor.stop_monitoring().await?;
    println!();
    print_metrics(&app.monitor.all_metrics().await);
    Ok(())
}

impl AlertsCommand {
    async fn execute(&self, app: &App, json: bool) -> Result<()> {
        let filter = AlertFilter {
            unresolved_only: true,
            severity: self.severity.as_deref().map(parse_severity).transpose()?,
            server: self.server.clone(),
        };

        for task in app.monitor.list_tasks().await.into_iter().filter(|t| t.enabled) {
            app.monitor.run_task(&task.name).await?;
        }
        let alerts = app.monitor.get_alerts(&filter).await;

        if json {
            return print_json(&alerts);
        }
        if alerts.is_empty() {
            println!("{} No alerts", "✓".green());
            return Ok(());
        }
        print_alerts(&alerts);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_check() {
        let check = parse_check("disk=df -h / | tail -1").unwrap();
        assert_eq!(check.name, "disk");
        assert_eq!(check.command, "df -h / | tail -1");
        assert!(parse_check("no-command").is_err());
        assert!(parse_check("=true").is_err());
    }

    #[test]
    fn test_parse_severity() {
        assert_eq!(parse_severity("Critical").unwrap(), AlertSeverity::Critical);
        assert_eq!(parse_severity("warn").unwrap(), AlertSeverity::Warning);
        assert!(parse_severity("loud").is_err());
    }
}
