//! Continuous health and metric monitoring
//!
//! A [`MonitoringTask`] runs a list of [`HealthCheck`]s against a set of
//! servers on a fixed interval. The scheduler loop wakes on every tick,
//! dispatches the tasks that are due and keeps the latest [`ServerMetrics`]
//! per server plus a bounded list of [`MonitoringAlert`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::MonitorSettings;
use crate::error::{FleetError, Result};
use crate::fanout::fan_out;
use crate::metrics::{parse_custom_metrics, ServerMetrics};
use crate::registry::{Registry, ServerStatus};
use crate::store::{EntityKind, Store};
use crate::utils::validate_name;

/// Check name used for alerts raised when the probe fails
pub const CONNECTIVITY_CHECK: &str = "connectivity";
/// Check name used for alerts raised when a server exceeds the task timeout
pub const TIMEOUT_CHECK: &str = "timeout";

const MAX_ALERT_OUTPUT: usize = 512;

/// Upper bound for task intervals and every timeout, 30 days
pub const MAX_SCHEDULE_SECS: u64 = 30 * 24 * 60 * 60;

fn default_check_timeout() -> u64 {
    10
}

fn default_interval() -> u64 {
    60
}

fn default_task_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// A command whose exit code and output decide pass or fail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub expected_exit_code: i32,
    /// Substring that must appear in the output
    #[serde(default)]
    pub expected_output: Option<String>,
    #[serde(default = "default_check_timeout")]
    pub timeout_secs: u64,
    /// Failures raise Critical instead of Warning alerts
    #[serde(default)]
    pub critical: bool,
}

impl HealthCheck {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            expected_exit_code: 0,
            expected_output: None,
            timeout_secs: default_check_timeout(),
            critical: false,
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn expect_exit(mut self, code: i32) -> Self {
        self.expected_exit_code = code;
        self
    }

    pub fn expect_output(mut self, needle: &str) -> Self {
        self.expected_output = Some(needle.to_string());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    fn failure_severity(&self) -> AlertSeverity {
        if self.critical {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    #[default]
    Idle,
    Running,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringTask {
    pub name: String,
    pub servers: Vec<String>,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Bound on one server's whole cycle
    #[serde(default = "default_task_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    /// `None` means due immediately
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub state: TaskState,
}

impl MonitoringTask {
    pub fn new(name: &str, servers: Vec<String>, checks: Vec<HealthCheck>) -> Self {
        Self {
            name: name.to_string(),
            servers,
            checks,
            interval_secs: default_interval(),
            timeout_secs: default_task_timeout(),
            enabled: true,
            last_run: None,
            next_run: None,
            state: TaskState::Idle,
        }
    }

    pub fn with_interval(mut self, secs: u64) -> Self {
        self.interval_secs = secs;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_name("monitoring task", &self.name)?;
        if self.servers.is_empty() {
            return Err(FleetError::Validation(format!("task '{}' has no servers", self.name)));
        }
        if !(1..=MAX_SCHEDULE_SECS).contains(&self.interval_secs)
            || !(1..=MAX_SCHEDULE_SECS).contains(&self.timeout_secs)
        {
            return Err(FleetError::Validation(format!(
                "task '{}' needs an interval and timeout between 1 and {} seconds",
                self.name, MAX_SCHEDULE_SECS
            )));
        }
        for check in &self.checks {
            if check.name.trim().is_empty() || check.command.trim().is_empty() {
                return Err(FleetError::Validation(format!(
                    "task '{}' has a check without a name or command",
                    self.name
                )));
            }
            if !(1..=MAX_SCHEDULE_SECS).contains(&check.timeout_secs) {
                return Err(FleetError::Validation(format!(
                    "check '{}' in task '{}' needs a timeout between 1 and {} seconds",
                    check.name, self.name, MAX_SCHEDULE_SECS
                )));
            }
        }
        Ok(())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && self.state == TaskState::Idle
            && self.next_run.map_or(true, |next| next <= now)
    }

    /// Record a dispatch at `now`. `next_run` only ever moves forward and is
    /// left untouched when `now + interval` is not representable.
    pub fn mark_dispatched(&mut self, now: DateTime<Utc>) {
        self.last_run = Some(now);
        self.state = TaskState::Running;

        let candidate = i64::try_from(self.interval_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|interval| now.checked_add_signed(interval));
        let Some(candidate) = candidate else {
            warn!(
                "Interval of {}s for task {} overflows the clock; keeping previous schedule",
                self.interval_secs, self.name
            );
            return;
        };
        self.next_run = Some(match self.next_run {
            Some(previous) if previous > candidate => previous,
            _ => candidate,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringAlert {
    pub id: String,
    pub severity: AlertSeverity,
    pub server: String,
    pub check_name: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
}

/// Selection for [`ClusterMonitor::get_alerts`]; the default matches everything
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub unresolved_only: bool,
    pub severity: Option<AlertSeverity>,
    pub server: Option<String>,
}

impl AlertFilter {
    pub fn matches(&self, alert: &MonitoringAlert) -> bool {
        (!self.unresolved_only || !alert.resolved)
            && self.severity.map_or(true, |s| alert.severity == s)
            && self.server.as_deref().map_or(true, |s| alert.server == s)
    }
}

/// What happened on one server during a task run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerCheckOutcome {
    pub status: ServerStatus,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub alerts_raised: usize,
    pub error: Option<String>,
}

impl ServerCheckOutcome {
    fn offline(error: String) -> Self {
        Self {
            status: ServerStatus::Offline,
            checks_passed: 0,
            checks_failed: 0,
            alerts_raised: 1,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunReport {
    pub task: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub servers: BTreeMap<String, ServerCheckOutcome>,
    pub alerts_raised: usize,
}

struct MonitorInner {
    registry: Arc<Registry>,
    tasks: RwLock<HashMap<String, MonitoringTask>>,
    metrics: RwLock<HashMap<String, ServerMetrics>>,
    alerts: RwLock<VecDeque<MonitoringAlert>>,
    settings: MonitorSettings,
    store: Option<Store>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

/// Scheduler, metric cache and alert log. Cheap to clone.
#[derive(Clone)]
pub struct ClusterMonitor {
    inner: Arc<MonitorInner>,
}

impl ClusterMonitor {
    pub fn new(registry: Arc<Registry>, settings: MonitorSettings) -> Self {
        Self::build(registry, settings, HashMap::new(), None)
    }

    pub fn with_store(registry: Arc<Registry>, settings: MonitorSettings, store: Store) -> Result<Self> {
        let tasks: Vec<MonitoringTask> = store.load_all(EntityKind::MonitoringTask)?;
        let tasks = tasks.into_iter().map(|t| (t.name.clone(), t)).collect();
        Ok(Self::build(registry, settings, tasks, Some(store)))
    }

    fn build(
        registry: Arc<Registry>,
        settings: MonitorSettings,
        tasks: HashMap<String, MonitoringTask>,
        store: Option<Store>,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                registry,
                tasks: RwLock::new(tasks),
                metrics: RwLock::new(HashMap::new()),
                alerts: RwLock::new(VecDeque::new()),
                settings,
                store,
                stop: Mutex::new(None),
            }),
        }
    }

    // ============== Tasks ==============

    pub async fn add_task(&self, mut task: MonitoringTask) -> Result<()> {
        task.validate()?;
        task.state = TaskState::Idle;

        let mut tasks = self.inner.tasks.write().await;
        if tasks.contains_key(&task.name) {
            return Err(FleetError::Validation(format!(
                "monitoring task '{}' already exists",
                task.name
            )));
        }
        self.inner.persist(&task)?;
        info!("Added monitoring task {} for {} servers", task.name, task.servers.len());
        tasks.insert(task.name.clone(), task);
        Ok(())
    }

    pub async fn get_task(&self, name: &str) -> Result<MonitoringTask> {
        self.inner
            .tasks
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| FleetError::not_found("monitoring task", name))
    }

    /// Replace a task definition, keeping its schedule and run state.
    pub async fn update_task(&self, name: &str, mut task: MonitoringTask) -> Result<()> {
        if task.name != name {
            return Err(FleetError::Validation(format!(
                "monitoring task name is immutable ('{}' != '{}')",
                task.name, name
            )));
        }
        task.validate()?;

        let mut tasks = self.inner.tasks.write().await;
        let existing = tasks
            .get(name)
            .ok_or_else(|| FleetError::not_found("monitoring task", name))?;
        task.last_run = existing.last_run;
        task.next_run = existing.next_run;
        task.state = existing.state;

        self.inner.persist(&task)?;
        tasks.insert(name.to_string(), task);
        Ok(())
    }

    pub async fn remove_task(&self, name: &str) -> Result<()> {
        let mut tasks = self.inner.tasks.write().await;
        if tasks.remove(name).is_none() {
            return Err(FleetError::not_found("monitoring task", name));
        }
        if let Some(store) = &self.inner.store {
            store.delete(EntityKind::MonitoringTask, name)?;
        }
        Ok(())
    }

    pub async fn list_tasks(&self) -> Vec<MonitoringTask> {
        let mut list: Vec<MonitoringTask> = self.inner.tasks.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub async fn set_task_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut tasks = self.inner.tasks.write().await;
        let task = tasks
            .get_mut(name)
            .ok_or_else(|| FleetError::not_found("monitoring task", name))?;
        task.enabled = enabled;
        self.inner.persist(task)
    }

    pub async fn task_state(&self, name: &str) -> Result<TaskState> {
        Ok(self.get_task(name).await?.state)
    }

    // ============== Scheduler ==============

    pub async fn start_monitoring(&self) -> Result<()> {
        let mut stop = self.inner.stop.lock().await;
        if stop.is_some() {
            return Err(FleetError::InvalidState("monitoring is already running".to_string()));
        }

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        *stop = Some(stop_tx);

        let monitor = self.clone();
        let tick = self.inner.settings.tick;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        monitor.schedule_due(Utc::now()).await;
                    }
                }
            }
            debug!("Monitor loop exited");
        });

        info!("Monitoring started (tick {:?})", tick);
        Ok(())
    }

    /// Stop the scheduler loop. Task runs already in flight finish on their own.
    pub async fn stop_monitoring(&self) -> Result<()> {
        let sender = self
            .inner
            .stop
            .lock()
            .await
            .take()
            .ok_or_else(|| FleetError::InvalidState("monitoring is not running".to_string()))?;
        let _ = sender.send(());
        info!("Monitoring stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.inner.stop.lock().await.is_some()
    }

    /// Dispatch every enabled, idle task whose `next_run` has passed.
    ///
    /// Each dispatched task runs in its own spawned future; returns the names
    /// dispatched.
    pub async fn schedule_due(&self, now: DateTime<Utc>) -> Vec<String> {
        let due: Vec<MonitoringTask> = {
            let mut tasks = self.inner.tasks.write().await;
            tasks
                .values_mut()
                .filter(|t| t.is_due(now))
                .map(|t| {
                    t.mark_dispatched(now);
                    t.clone()
                })
                .collect()
        };

        let mut names = Vec::with_capacity(due.len());
        for task in due {
            debug!("Dispatching monitoring task {}", task.name);
            if let Err(e) = self.inner.persist(&task) {
                warn!("Could not persist schedule for {}: {}", task.name, e);
            }
            names.push(task.name.clone());

            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let name = task.name.clone();
                inner.run_cycle(task).await;
                inner.set_idle(&name).await;
            });
        }
        names
    }

    /// Run a task immediately, outside the schedule.
    pub async fn run_task(&self, name: &str) -> Result<TaskRunReport> {
        let task = {
            let mut tasks = self.inner.tasks.write().await;
            let task = tasks
                .get_mut(name)
                .ok_or_else(|| FleetError::not_found("monitoring task", name))?;
            if task.state == TaskState::Running {
                return Err(FleetError::InvalidState(format!(
                    "monitoring task '{}' is already running",
                    name
                )));
            }
            task.state = TaskState::Running;
            task.last_run = Some(Utc::now());
            task.clone()
        };

        let report = self.inner.run_cycle(task).await;
        self.inner.set_idle(name).await;
        Ok(report)
    }

    // ============== Views ==============

    pub async fn get_metrics(&self, server: &str) -> Option<ServerMetrics> {
        self.inner.metrics.read().await.get(server).cloned()
    }

    /// Latest metrics for every monitored server, sorted by server name
    pub async fn all_metrics(&self) -> Vec<ServerMetrics> {
        let mut list: Vec<ServerMetrics> = self.inner.metrics.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.server.cmp(&b.server));
        list
    }

    /// Matching alerts, oldest first
    pub async fn get_alerts(&self, filter: &AlertFilter) -> Vec<MonitoringAlert> {
        self.inner
            .alerts
            .read()
            .await
            .iter()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect()
    }

    /// Mark an alert resolved. Resolving twice keeps the first timestamp.
    pub async fn resolve_alert(&self, id: &str) -> Result<MonitoringAlert> {
        let mut alerts = self.inner.alerts.write().await;
        let alert = alerts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| FleetError::not_found("alert", id))?;
        if !alert.resolved {
            alert.resolved = true;
            alert.resolved_at = Some(Utc::now());
        }
        Ok(alert.clone())
    }

    /// Drop resolved alerts, returning how many were removed.
    pub async fn clear_resolved_alerts(&self) -> usize {
        let mut alerts = self.inner.alerts.write().await;
        let before = alerts.len();
        alerts.retain(|a| !a.resolved);
        before - alerts.len()
    }
}

impl MonitorInner {
    fn persist(&self, task: &MonitoringTask) -> Result<()> {
        match &self.store {
            Some(store) => store.save(EntityKind::MonitoringTask, &task.name, task),
            None => Ok(()),
        }
    }

    async fn set_idle(&self, name: &str) {
        if let Some(task) = self.tasks.write().await.get_mut(name) {
            task.state = TaskState::Idle;
        }
    }

    async fn run_cycle(self: &Arc<Self>, task: MonitoringTask) -> TaskRunReport {
        let started_at = Utc::now();
        let started = Instant::now();
        let task = Arc::new(task);

        let outcomes = fan_out(&task.servers, |server| {
            let inner = Arc::clone(self);
            let task = Arc::clone(&task);
            async move { Ok(inner.check_server(&task, &server).await) }
        })
        .await;

        let servers: BTreeMap<String, ServerCheckOutcome> = outcomes
            .into_iter()
            .map(|(server, outcome)| {
                let outcome = outcome.unwrap_or_else(|e| ServerCheckOutcome {
                    alerts_raised: 0,
                    ..ServerCheckOutcome::offline(e.to_string())
                });
                (server, outcome)
            })
            .collect();
        let alerts_raised = servers.values().map(|o| o.alerts_raised).sum();

        debug!(
            "Task {} checked {} servers, {} alerts",
            task.name,
            servers.len(),
            alerts_raised
        );
        TaskRunReport {
            task: task.name.clone(),
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            servers,
            alerts_raised,
        }
    }

    async fn check_server(&self, task: &MonitoringTask, server: &str) -> ServerCheckOutcome {
        let deadline = Duration::from_secs(task.timeout_secs);
        match tokio::time::timeout(deadline, self.server_cycle(task, server)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let message = format!(
                    "monitoring of {} exceeded the {}s task timeout",
                    server, task.timeout_secs
                );
                let mut metadata = BTreeMap::new();
                metadata.insert("task".to_string(), task.name.clone());
                self.raise_alert(AlertSeverity::Warning, server, TIMEOUT_CHECK, &message, metadata)
                    .await;
                ServerCheckOutcome {
                    status: ServerStatus::Unknown,
                    checks_passed: 0,
                    checks_failed: 0,
                    alerts_raised: 1,
                    error: Some(message),
                }
            }
        }
    }

    async fn server_cycle(&self, task: &MonitoringTask, server: &str) -> ServerCheckOutcome {
        let health = match self.registry.check_server_health(server).await {
            Ok(health) if health.status == ServerStatus::Online => health,
            Ok(health) => {
                let error = health.error.unwrap_or_else(|| "probe failed".to_string());
                return self.offline(server, error).await;
            }
            Err(e) => return self.offline(server, e.to_string()).await,
        };

        let mut metrics = ServerMetrics::new(server, ServerStatus::Online);
        metrics.response_time_ms = health.response_time_ms;
        let mut outcome = ServerCheckOutcome {
            status: ServerStatus::Online,
            checks_passed: 0,
            checks_failed: 0,
            alerts_raised: 0,
            error: None,
        };

        for check in &task.checks {
            match self.run_check(check, server, &mut metrics).await {
                None => outcome.checks_passed += 1,
                Some((severity, message, metadata)) => {
                    outcome.checks_failed += 1;
                    outcome.alerts_raised += 1;
                    self.raise_alert(severity, server, &check.name, &message, metadata)
                        .await;
                }
            }
        }

        self.registry.collect_os_metrics(server, &mut metrics).await;
        self.metrics
            .write()
            .await
            .insert(server.to_string(), metrics);
        outcome
    }

    /// Run one check; `None` means it passed.
    async fn run_check(
        &self,
        check: &HealthCheck,
        server: &str,
        metrics: &mut ServerMetrics,
    ) -> Option<(AlertSeverity, String, BTreeMap<String, String>)> {
        let mut metadata = BTreeMap::new();
        metadata.insert("command".to_string(), check.command.clone());

        let timeout = Duration::from_secs(check.timeout_secs);
        let out = match self
            .registry
            .execute_command_with_timeout(server, &check.command, timeout)
            .await
        {
            Ok(out) => out,
            Err(e) => {
                let message = format!("check '{}' could not run: {}", check.name, e);
                return Some((check.failure_severity(), message, metadata));
            }
        };

        metrics.custom.extend(parse_custom_metrics(&out.output));

        if out.timed_out {
            let message = format!("check '{}' timed out after {}s", check.name, check.timeout_secs);
            return Some((check.failure_severity(), message, metadata));
        }

        if out.exit_code != check.expected_exit_code {
            metadata.insert("expected_exit_code".to_string(), check.expected_exit_code.to_string());
            metadata.insert("actual_exit_code".to_string(), out.exit_code.to_string());
            metadata.insert("output".to_string(), truncate(&out.output));
            let message = format!(
                "check '{}' exited with {} (expected {})",
                check.name, out.exit_code, check.expected_exit_code
            );
            return Some((check.failure_severity(), message, metadata));
        }

        if let Some(expected) = &check.expected_output {
            if !out.output.contains(expected.as_str()) {
                metadata.insert("expected_output".to_string(), expected.clone());
                metadata.insert("actual_output".to_string(), truncate(&out.output));
                let message = format!("check '{}' output did not contain '{}'", check.name, expected);
                return Some((check.failure_severity(), message, metadata));
            }
        }
        None
    }

    async fn offline(&self, server: &str, error: String) -> ServerCheckOutcome {
        self.metrics
            .write()
            .await
            .insert(server.to_string(), ServerMetrics::new(server, ServerStatus::Offline));
        let message = format!("{} is unreachable: {}", server, error);
        self.raise_alert(
            AlertSeverity::Critical,
            server,
            CONNECTIVITY_CHECK,
            &message,
            BTreeMap::new(),
        )
        .await;
        ServerCheckOutcome::offline(error)
    }

    async fn raise_alert(
        &self,
        severity: AlertSeverity,
        server: &str,
        check_name: &str,
        message: &str,
        metadata: BTreeMap<String, String>,
    ) {
        match severity {
            AlertSeverity::Critical => warn!("[{}] {} {}: {}", severity, server, check_name, message),
            _ => info!("[{}] {} {}: {}", severity, server, check_name, message),
        }

        let alert = MonitoringAlert {
            id: uuid::Uuid::new_v4().to_string(),
            severity,
            server: server.to_string(),
            check_name: check_name.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
            resolved: false,
            resolved_at: None,
            metadata,
        };

        let mut alerts = self.alerts.write().await;
        alerts.push_back(alert);
        while alerts.len() > self.settings.max_alerts {
            alerts.pop_front();
        }
    }
}

fn truncate(output: &str) -> String {
    output.chars().take(MAX_ALERT_OUTPUT).collect()
}
