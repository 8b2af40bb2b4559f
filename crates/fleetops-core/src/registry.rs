//! Server registry and command dispatcher
//!
//! The registry owns every server definition and the connection cache. All
//! other components reach remote hosts through it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::RegistrySettings;
use crate::error::{FleetError, Result};
use crate::metrics::{OsMetric, ServerMetrics};
use crate::remote::{CommandOutput, Connector, RemoteSession, SshConnector};
use crate::ssh::TunnelHandle;
use crate::store::{EntityKind, Store};
use crate::utils::validate_name;

const PROBE_COMMAND: &str = "echo fleetops-probe";
const SCRIPT_DELIMITER: &str = "FLEETOPS_SCRIPT";

fn default_port() -> u16 {
    22
}

/// Connection details for one server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Takes precedence over `password` when both are set
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ServerConfig {
    pub fn new(name: &str, host: &str, username: &str) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            port: default_port(),
            username: username.to_string(),
            password: None,
            private_key_path: None,
            tags: Vec::new(),
        }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn with_private_key(mut self, path: &str) -> Self {
        self.private_key_path = Some(path.to_string());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    /// Checks performed before any network activity
    pub fn validate(&self) -> Result<()> {
        validate_name("server", &self.name)?;
        if self.host.trim().is_empty() {
            return Err(FleetError::Validation(format!("server '{}' has no host", self.name)));
        }
        if self.port == 0 {
            return Err(FleetError::Validation(format!("server '{}' has port 0", self.name)));
        }
        if self.username.trim().is_empty() {
            return Err(FleetError::Validation(format!("server '{}' has no username", self.name)));
        }
        let has_key = self.private_key_path.as_deref().is_some_and(|p| !p.is_empty());
        let has_password = self.password.is_some();
        if !has_key && !has_password {
            return Err(FleetError::Validation(format!(
                "server '{}' needs a password or a private key path",
                self.name
            )));
        }
        Ok(())
    }
}

/// Last observed reachability of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Unknown,
    Online,
    Offline,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Unknown => "unknown",
            ServerStatus::Online => "online",
            ServerStatus::Offline => "offline",
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of a server record handed to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub config: ServerConfig,
    pub status: ServerStatus,
    pub last_checked: Option<DateTime<Utc>>,
    pub connected: bool,
}

/// Result of a single-server reachability probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerHealth {
    pub server: String,
    pub status: ServerStatus,
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

struct ServerRecord {
    config: ServerConfig,
    status: ServerStatus,
    last_checked: Option<DateTime<Utc>>,
    connection: Option<Arc<dyn RemoteSession>>,
}

impl ServerRecord {
    fn new(config: ServerConfig) -> Self {
        Self {
            config,
            status: ServerStatus::Unknown,
            last_checked: None,
            connection: None,
        }
    }

    fn info(&self) -> ServerInfo {
        ServerInfo {
            config: self.config.clone(),
            status: self.status,
            last_checked: self.last_checked,
            connected: self.connection.is_some(),
        }
    }
}

/// Server directory plus connection cache
pub struct Registry {
    servers: RwLock<HashMap<String, ServerRecord>>,
    connector: Arc<dyn Connector>,
    settings: RegistrySettings,
    store: Option<Store>,
}

impl Registry {
    pub fn new(connector: Arc<dyn Connector>, settings: RegistrySettings) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            connector,
            settings,
            store: None,
        }
    }

    /// Registry backed by real SSH connections
    pub fn ssh(settings: RegistrySettings) -> Self {
        Self::new(Arc::new(SshConnector), settings)
    }

    /// Registry that loads and persists server definitions through `store`
    pub fn with_store(
        connector: Arc<dyn Connector>,
        settings: RegistrySettings,
        store: Store,
    ) -> Result<Self> {
        let configs: Vec<ServerConfig> = store.load_all(EntityKind::Server)?;
        let servers = configs
            .into_iter()
            .map(|c| (c.name.clone(), ServerRecord::new(c)))
            .collect();
        Ok(Self {
            servers: RwLock::new(servers),
            connector,
            settings,
            store: Some(store),
        })
    }

    pub fn settings(&self) -> RegistrySettings {
        self.settings
    }

    fn persist(&self, config: &ServerConfig) -> Result<()> {
        match &self.store {
            Some(store) => store.save(EntityKind::Server, &config.name, config),
            None => Ok(()),
        }
    }

    // ============== Directory ==============

    pub async fn add_server(&self, config: ServerConfig) -> Result<()> {
        config.validate()?;

        let mut servers = self.servers.write().await;
        if servers.contains_key(&config.name) {
            return Err(FleetError::Validation(format!(
                "server '{}' already exists",
                config.name
            )));
        }
        self.persist(&config)?;
        info!("Added server {} ({}:{})", config.name, config.host, config.port);
        servers.insert(config.name.clone(), ServerRecord::new(config));
        Ok(())
    }

    pub async fn remove_server(&self, name: &str) -> Result<()> {
        let record = {
            let mut servers = self.servers.write().await;
            let record = servers
                .remove(name)
                .ok_or_else(|| FleetError::not_found("server", name))?;
            if let Some(store) = &self.store {
                store.delete(EntityKind::Server, name)?;
            }
            record
        };

        if let Some(conn) = record.connection {
            conn.close().await;
        }
        info!("Removed server {}", name);
        Ok(())
    }

    /// Replace a server's configuration. The name is its identity and cannot change.
    pub async fn update_server(&self, name: &str, config: ServerConfig) -> Result<()> {
        if config.name != name {
            return Err(FleetError::Validation(format!(
                "server name is immutable ('{}' != '{}')",
                config.name, name
            )));
        }
        config.validate()?;

        let stale = {
            let mut servers = self.servers.write().await;
            let record = servers
                .get_mut(name)
                .ok_or_else(|| FleetError::not_found("server", name))?;
            self.persist(&config)?;
            record.config = config;
            record.status = ServerStatus::Unknown;
            record.connection.take()
        };

        if let Some(conn) = stale {
            conn.close().await;
        }
        Ok(())
    }

    pub async fn get_server(&self, name: &str) -> Result<ServerInfo> {
        self.servers
            .read()
            .await
            .get(name)
            .map(ServerRecord::info)
            .ok_or_else(|| FleetError::not_found("server", name))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.servers.read().await.contains_key(name)
    }

    /// All servers, sorted by name
    pub async fn list_servers(&self) -> Vec<ServerInfo> {
        let mut list: Vec<ServerInfo> = self
            .servers
            .read()
            .await
            .values()
            .map(ServerRecord::info)
            .collect();
        list.sort_by(|a, b| a.config.name.cmp(&b.config.name));
        list
    }

    pub async fn servers_with_tag(&self, tag: &str) -> Vec<ServerInfo> {
        self.list_servers()
            .await
            .into_iter()
            .filter(|s| s.config.tags.iter().any(|t| t == tag))
            .collect()
    }

    // ============== Connections ==============

    /// Cached connection for `name`, opening one if needed
    async fn connection(&self, name: &str) -> Result<Arc<dyn RemoteSession>> {
        let config = {
            let servers = self.servers.read().await;
            let record = servers
                .get(name)
                .ok_or_else(|| FleetError::not_found("server", name))?;
            if let Some(conn) = &record.connection {
                return Ok(Arc::clone(conn));
            }
            record.config.clone()
        };

        let conn = self.connector.open(&config);
        if let Err(e) = conn.connect(self.settings.connect_timeout).await {
            warn!("Connection to {} failed: {}", name, e);
            self.set_status(name, ServerStatus::Offline).await;
            return Err(e);
        }

        let mut servers = self.servers.write().await;
        let winner = match servers.get_mut(name) {
            Some(record) if record.connection.is_none() => {
                record.connection = Some(Arc::clone(&conn));
                return Ok(conn);
            }
            Some(record) => record.connection.clone(),
            None => None,
        };
        drop(servers);

        // Lost a race with another caller, or the server was removed meanwhile.
        conn.close().await;
        winner.ok_or_else(|| FleetError::not_found("server", name))
    }

    async fn set_status(&self, name: &str, status: ServerStatus) {
        if let Some(record) = self.servers.write().await.get_mut(name) {
            record.status = status;
            record.last_checked = Some(Utc::now());
        }
    }

    /// Update status after a remote call and drop connections that failed at the transport level.
    async fn observe<T>(&self, name: &str, result: &Result<T>) {
        match result {
            Ok(_) => self.set_status(name, ServerStatus::Online).await,
            Err(e) if e.is_transient() => {
                let evicted = {
                    let mut servers = self.servers.write().await;
                    servers.get_mut(name).and_then(|record| {
                        record.status = ServerStatus::Offline;
                        record.last_checked = Some(Utc::now());
                        record.connection.take()
                    })
                };
                if let Some(conn) = evicted {
                    debug!("Evicting connection to {}: {}", name, e);
                    conn.close().await;
                }
            }
            Err(_) => {}
        }
    }

    /// Close every cached connection
    pub async fn disconnect_all(&self) {
        let conns: Vec<Arc<dyn RemoteSession>> = {
            let mut servers = self.servers.write().await;
            servers
                .values_mut()
                .filter_map(|record| record.connection.take())
                .collect()
        };
        for conn in conns {
            conn.close().await;
        }
    }

    // ============== Dispatch ==============

    pub async fn execute_command(&self, name: &str, command: &str) -> Result<CommandOutput> {
        self.execute_command_with_timeout(name, command, self.settings.command_timeout)
            .await
    }

    pub async fn execute_command_with_timeout(
        &self,
        name: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let conn = self.connection(name).await?;
        let result = conn.execute(command, timeout).await;
        self.observe(name, &result).await;
        if let Ok(out) = &result {
            debug!("{}: `{}` exited {} in {}ms", name, command, out.exit_code, out.duration_ms);
        }
        result
    }

    /// Run a multi-line script body through the remote shell
    pub async fn execute_script(&self, name: &str, script: &str) -> Result<CommandOutput> {
        if script.lines().any(|l| l.trim() == SCRIPT_DELIMITER) {
            return Err(FleetError::Validation(format!(
                "script may not contain a line consisting of {}",
                SCRIPT_DELIMITER
            )));
        }
        let command = format!(
            "sh -s <<'{delim}'\n{body}\n{delim}",
            delim = SCRIPT_DELIMITER,
            body = script.trim_end_matches('\n')
        );
        self.execute_command(name, &command).await
    }

    pub async fn upload_file(&self, name: &str, local: &Path, remote: &str) -> Result<u64> {
        let conn = self.connection(name).await?;
        let result = conn
            .upload_file(local, remote, self.settings.transfer_timeout)
            .await;
        self.observe(name, &result).await;
        result
    }

    pub async fn download_file(&self, name: &str, remote: &str, local: &Path) -> Result<u64> {
        let conn = self.connection(name).await?;
        let result = conn
            .download_file(remote, local, self.settings.transfer_timeout)
            .await;
        self.observe(name, &result).await;
        result
    }

    pub async fn create_tunnel(
        &self,
        name: &str,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<TunnelHandle> {
        let conn = self.connection(name).await?;
        let result = conn.create_tunnel(local_port, remote_host, remote_port).await;
        self.observe(name, &result).await;
        result
    }

    /// Connect, probe and disconnect without registering anything.
    ///
    /// Returns the probe round-trip time.
    pub async fn test_connection(&self, config: &ServerConfig) -> Result<Duration> {
        config.validate()?;

        let conn = self.connector.open(config);
        conn.connect(self.settings.connect_timeout).await?;

        let start = Instant::now();
        let probe = conn.execute(PROBE_COMMAND, self.settings.command_timeout).await;
        let elapsed = start.elapsed();
        conn.close().await;

        let out = probe?;
        if out.timed_out {
            return Err(FleetError::Timeout(format!("probe of {} timed out", config.host)));
        }
        if out.exit_code != 0 {
            return Err(FleetError::CommandFailed(format!(
                "probe of {} exited with {}",
                config.host, out.exit_code
            )));
        }
        Ok(elapsed)
    }

    // ============== Single-server views ==============

    pub async fn check_server_health(&self, name: &str) -> Result<ServerHealth> {
        if !self.contains(name).await {
            return Err(FleetError::not_found("server", name));
        }

        let start = Instant::now();
        let probe = self.execute_command(name, PROBE_COMMAND).await;
        let elapsed = start.elapsed().as_millis() as u64;

        let (status, response_time_ms, error) = match probe {
            Ok(out) if out.success() => (ServerStatus::Online, Some(elapsed), None),
            Ok(out) if out.timed_out => (ServerStatus::Offline, None, Some("probe timed out".to_string())),
            Ok(out) => (
                ServerStatus::Offline,
                Some(elapsed),
                Some(format!("probe exited with {}", out.exit_code)),
            ),
            Err(e @ FleetError::NotFound { .. }) => return Err(e),
            Err(e) => (ServerStatus::Offline, None, Some(e.to_string())),
        };

        if status == ServerStatus::Offline {
            self.set_status(name, ServerStatus::Offline).await;
        }

        Ok(ServerHealth {
            server: name.to_string(),
            status,
            response_time_ms,
            error,
            checked_at: Utc::now(),
        })
    }

    /// Probe the server and gather the standard OS metrics
    pub async fn get_server_metrics(&self, name: &str) -> Result<ServerMetrics> {
        let health = self.check_server_health(name).await?;
        let mut metrics = ServerMetrics::new(name, health.status);
        metrics.response_time_ms = health.response_time_ms;

        if health.status == ServerStatus::Online {
            self.collect_os_metrics(name, &mut metrics).await;
        }
        Ok(metrics)
    }

    /// Best-effort collection; failed commands and unparseable output are skipped.
    pub async fn collect_os_metrics(&self, name: &str, metrics: &mut ServerMetrics) {
        for metric in OsMetric::ALL {
            match self.execute_command(name, metric.command()).await {
                Ok(out) if out.success() => {
                    if !metrics.apply(metric, &out.output) {
                        debug!("{}: could not parse {:?} output", name, metric);
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("{}: {:?} collection failed: {}", name, metric, e),
            }
        }
        metrics.collected_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{registry_with, server, FakeConnector};

    #[tokio::test]
    async fn test_add_then_get_returns_equivalent_record() {
        let fake = FakeConnector::new();
        let registry = registry_with(&fake);

        let config = server("web1").with_port(2222).with_tags(&["web", "prod"]);
        registry.add_server(config.clone()).await.unwrap();

        let info = registry.get_server("web1").await.unwrap();
        assert_eq!(info.config, config);
        assert_eq!(info.status, ServerStatus::Unknown);
        assert!(!info.connected);
    }

    #[tokio::test]
    async fn test_duplicate_add_fails_without_mutation() {
        let fake = FakeConnector::new();
        let registry = registry_with(&fake);

        registry.add_server(server("web1")).await.unwrap();
        let other = ServerConfig::new("web1", "10.0.0.9", "root").with_password("x");
        let err = registry.add_server(other).await.unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));

        let info = registry.get_server("web1").await.unwrap();
        assert_eq!(info.config.host, "web1");
        assert_eq!(registry.list_servers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_validation_happens_before_network() {
        let fake = FakeConnector::new();
        let registry = registry_with(&fake);

        let no_auth = ServerConfig::new("web1", "web1", "deploy");
        assert!(matches!(
            registry.add_server(no_auth).await,
            Err(FleetError::Validation(_))
        ));
        let bad_port = server("web2").with_port(0);
        assert!(matches!(
            registry.add_server(bad_port).await,
            Err(FleetError::Validation(_))
        ));
        let bad_name = server("web 3");
        assert!(matches!(
            registry.add_server(bad_name).await,
            Err(FleetError::Validation(_))
        ));
        assert_eq!(fake.connect_count(), 0);
        assert!(registry.list_servers().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_unknown_and_removed() {
        let fake = FakeConnector::new();
        fake.add_host("web1");
        let registry = registry_with(&fake);
        registry.add_server(server("web1")).await.unwrap();

        let err = registry.remove_server("ghost").await.unwrap_err();
        assert!(matches!(err, FleetError::NotFound { .. }));
        assert_eq!(registry.list_servers().await.len(), 1);

        registry.execute_command("web1", "echo hi").await.unwrap();
        registry.remove_server("web1").await.unwrap();
        assert!(matches!(
            registry.get_server("web1").await,
            Err(FleetError::NotFound { .. })
        ));
        assert!(matches!(
            registry.execute_command("web1", "echo hi").await,
            Err(FleetError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_execute_reuses_cached_connection() {
        let fake = FakeConnector::new();
        fake.add_host("web1");
        let registry = registry_with(&fake);
        registry.add_server(server("web1")).await.unwrap();

        let out = registry.execute_command("web1", "echo hello").await.unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.output.trim(), "hello");
        registry.execute_command("web1", "exit 3").await.unwrap();

        assert_eq!(fake.connect_count(), 1);
        let info = registry.get_server("web1").await.unwrap();
        assert_eq!(info.status, ServerStatus::Online);
        assert!(info.connected);
        assert!(info.last_checked.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_marks_offline_and_evicts() {
        let fake = FakeConnector::new();
        fake.add_host("web1");
        let registry = registry_with(&fake);
        registry.add_server(server("web1")).await.unwrap();
        registry.execute_command("web1", "true").await.unwrap();

        fake.set_reachable("web1", false);
        let err = registry.execute_command("web1", "true").await.unwrap_err();
        assert!(err.is_transient());

        let info = registry.get_server("web1").await.unwrap();
        assert_eq!(info.status, ServerStatus::Offline);
        assert!(!info.connected);

        fake.set_reachable("web1", true);
        registry.execute_command("web1", "true").await.unwrap();
        assert_eq!(fake.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_update_server_keeps_identity_and_drops_connection() {
        let fake = FakeConnector::new();
        fake.add_host("web1");
        let registry = registry_with(&fake);
        registry.add_server(server("web1")).await.unwrap();
        registry.execute_command("web1", "true").await.unwrap();

        let renamed = server("web9");
        assert!(matches!(
            registry.update_server("web1", renamed).await,
            Err(FleetError::Validation(_))
        ));

        let updated = server("web1").with_tags(&["db"]);
        registry.update_server("web1", updated).await.unwrap();
        let info = registry.get_server("web1").await.unwrap();
        assert_eq!(info.config.tags, vec!["db".to_string()]);
        assert!(!info.connected);
        assert_eq!(registry.servers_with_tag("db").await.len(), 1);
    }

    #[tokio::test]
    async fn test_execute_script_runs_body() {
        let fake = FakeConnector::new();
        fake.add_host("web1");
        let registry = registry_with(&fake);
        registry.add_server(server("web1")).await.unwrap();

        let out = registry
            .execute_script("web1", "echo one\necho two\n")
            .await
            .unwrap();
        assert_eq!(out.output, "one\ntwo\n");

        let err = registry
            .execute_script("web1", "echo x\nFLEETOPS_SCRIPT\n")
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
    }

    #[tokio::test]
    async fn test_command_timeout_returns_result() {
        let fake = FakeConnector::new();
        fake.add_host("web1");
        fake.set_exec_delay("web1", Duration::from_secs(5));
        let registry = registry_with(&fake);
        registry.add_server(server("web1")).await.unwrap();

        let out = registry
            .execute_command_with_timeout("web1", "sleep 60", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, -1);
    }

    #[tokio::test]
    async fn test_test_connection_persists_nothing() {
        let fake = FakeConnector::new();
        fake.add_host("web1");
        let registry = registry_with(&fake);

        registry.test_connection(&server("web1")).await.unwrap();
        assert!(registry.list_servers().await.is_empty());

        let err = registry.test_connection(&server("ghost")).await.unwrap_err();
        assert!(matches!(err, FleetError::Network(_)));
    }

    #[tokio::test]
    async fn test_upload_and_download_pass_through() {
        let fake = FakeConnector::new();
        fake.add_host("web1");
        let registry = registry_with(&fake);
        registry.add_server(server("web1")).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("app.conf");
        std::fs::write(&local, b"port=80\n").unwrap();

        let sent = registry.upload_file("web1", &local, "/etc/app.conf").await.unwrap();
        assert_eq!(sent, 8);
        assert_eq!(fake.file("web1", "/etc/app.conf").unwrap(), b"port=80\n");

        let back = dir.path().join("back.conf");
        registry.download_file("web1", "/etc/app.conf", &back).await.unwrap();
        assert_eq!(std::fs::read(&back).unwrap(), b"port=80\n");
    }

    #[tokio::test]
    async fn test_health_and_metrics_views() {
        let fake = FakeConnector::new();
        fake.add_host("web1");
        fake.add_unreachable_host("web2");
        let registry = registry_with(&fake);
        registry.add_server(server("web1")).await.unwrap();
        registry.add_server(server("web2")).await.unwrap();

        let health = registry.check_server_health("web1").await.unwrap();
        assert_eq!(health.status, ServerStatus::Online);
        assert!(health.error.is_none());

        let health = registry.check_server_health("web2").await.unwrap();
        assert_eq!(health.status, ServerStatus::Offline);
        assert!(health.error.is_some());

        let metrics = registry.get_server_metrics("web1").await.unwrap();
        assert_eq!(metrics.status, ServerStatus::Online);
        assert_eq!(metrics.load_average, Some([0.5, 0.4, 0.3]));
        assert_eq!(metrics.cpu_percent, Some(7.0));
        assert_eq!(metrics.memory_percent, Some(25.0));
        assert_eq!(metrics.disk_percent, Some(40.0));
        assert_eq!(metrics.process_count, Some(120));
        assert_eq!(metrics.uptime_secs, Some(3600));

        let offline = registry.get_server_metrics("web2").await.unwrap();
        assert_eq!(offline.status, ServerStatus::Offline);
        assert!(offline.cpu_percent.is_none());

        assert!(matches!(
            registry.check_server_health("ghost").await,
            Err(FleetError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeConnector::new();
        let store = Store::open(dir.path()).unwrap();

        let registry =
            Registry::with_store(Arc::new(fake.clone()), RegistrySettings::default(), store.clone())
                .unwrap();
        registry.add_server(server("web1")).await.unwrap();
        registry.add_server(server("web2")).await.unwrap();
        registry.remove_server("web2").await.unwrap();

        let reloaded =
            Registry::with_store(Arc::new(fake), RegistrySettings::default(), store).unwrap();
        let names: Vec<String> = reloaded
            .list_servers()
            .await
            .into_iter()
            .map(|s| s.config.name)
            .collect();
        assert_eq!(names, vec!["web1".to_string()]);
    }
}
