//! In-memory remote hosts for unit tests
//!
//! `FakeConnector` hands out sessions backed by a shared map of fake hosts.
//! Each host has a file map and understands the handful of shell commands
//! the core issues.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::RegistrySettings;
use crate::error::{FleetError, Result};
use crate::metrics::OsMetric;
use crate::registry::{Registry, ServerConfig};
use crate::remote::{CommandOutput, Connector, RemoteSession};
use crate::ssh::TunnelHandle;

#[derive(Default)]
struct FakeHost {
    reachable: bool,
    files: BTreeMap<String, Vec<u8>>,
    responses: HashMap<String, (i32, String)>,
    executed: Vec<String>,
    exec_delay: Option<Duration>,
    corrupt_uploads: bool,
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    hosts: Arc<Mutex<HashMap<String, FakeHost>>>,
    connects: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&self, host: &str) {
        self.hosts.lock().unwrap().insert(
            host.to_string(),
            FakeHost {
                reachable: true,
                ..Default::default()
            },
        );
    }

    pub fn add_unreachable_host(&self, host: &str) {
        self.hosts
            .lock()
            .unwrap()
            .insert(host.to_string(), FakeHost::default());
    }

    pub fn set_reachable(&self, host: &str, reachable: bool) {
        self.with_host(host, |h| h.reachable = reachable);
    }

    pub fn respond(&self, host: &str, command: &str, exit_code: i32, output: &str) {
        self.with_host(host, |h| {
            h.responses
                .insert(command.to_string(), (exit_code, output.to_string()));
        });
    }

    pub fn set_exec_delay(&self, host: &str, delay: Duration) {
        self.with_host(host, |h| h.exec_delay = Some(delay));
    }

    pub fn corrupt_uploads(&self, host: &str) {
        self.with_host(host, |h| h.corrupt_uploads = true);
    }

    pub fn put_file(&self, host: &str, path: &str, data: &[u8]) {
        self.with_host(host, |h| {
            h.files.insert(path.to_string(), data.to_vec());
        });
    }

    pub fn file(&self, host: &str, path: &str) -> Option<Vec<u8>> {
        self.hosts
            .lock()
            .unwrap()
            .get(host)
            .and_then(|h| h.files.get(path).cloned())
    }

    pub fn files(&self, host: &str) -> Vec<String> {
        self.hosts
            .lock()
            .unwrap()
            .get(host)
            .map(|h| h.files.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn executed(&self, host: &str) -> Vec<String> {
        self.hosts
            .lock()
            .unwrap()
            .get(host)
            .map(|h| h.executed.clone())
            .unwrap_or_default()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn with_host<F: FnOnce(&mut FakeHost)>(&self, host: &str, f: F) {
        let mut hosts = self.hosts.lock().unwrap();
        f(hosts.get_mut(host).expect("unknown fake host"));
    }
}

impl Connector for FakeConnector {
    fn open(&self, config: &ServerConfig) -> Arc<dyn RemoteSession> {
        Arc::new(FakeSession {
            host: config.host.clone(),
            hosts: Arc::clone(&self.hosts),
            connects: Arc::clone(&self.connects),
            connected: AtomicBool::new(false),
        })
    }
}

struct FakeSession {
    host: String,
    hosts: Arc<Mutex<HashMap<String, FakeHost>>>,
    connects: Arc<AtomicUsize>,
    connected: AtomicBool,
}

impl FakeSession {
    /// Fails unless connected and the host is currently reachable
    fn check(&self) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(FleetError::NotConnected(self.host.clone()));
        }
        let hosts = self.hosts.lock().unwrap();
        match hosts.get(&self.host) {
            Some(h) if h.reachable => Ok(()),
            _ => Err(FleetError::Network(format!("{}: connection reset", self.host))),
        }
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn connect(&self, _deadline: Duration) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let reachable = self
            .hosts
            .lock()
            .unwrap()
            .get(&self.host)
            .is_some_and(|h| h.reachable);
        if !reachable {
            return Err(FleetError::Network(format!("{}: connection refused", self.host)));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&self, command: &str, deadline: Duration) -> Result<CommandOutput> {
        self.check()?;
        let start = Instant::now();

        let delay = self.hosts.lock().unwrap()[&self.host].exec_delay;
        if let Some(delay) = delay {
            if delay >= deadline {
                tokio::time::sleep(deadline).await;
                return Ok(CommandOutput::deadline_exceeded(command, deadline));
            }
            tokio::time::sleep(delay).await;
        }

        let (exit_code, output) = {
            let mut hosts = self.hosts.lock().unwrap();
            let host = hosts.get_mut(&self.host).unwrap();
            host.executed.push(command.to_string());
            run(host, command)
        };

        Ok(CommandOutput {
            command: command.to_string(),
            exit_code,
            output,
            duration_ms: start.elapsed().as_millis() as u64,
            timestamp: chrono::Utc::now(),
            timed_out: false,
        })
    }

    async fn upload_file(&self, local: &Path, remote: &str, _deadline: Duration) -> Result<u64> {
        self.check()?;
        let mut data = std::fs::read(local)?;
        let len = data.len() as u64;

        let mut hosts = self.hosts.lock().unwrap();
        let host = hosts.get_mut(&self.host).unwrap();
        if host.corrupt_uploads {
            data.push(b'!');
        }
        host.files.insert(remote.to_string(), data);
        Ok(len)
    }

    async fn download_file(&self, remote: &str, local: &Path, _deadline: Duration) -> Result<u64> {
        self.check()?;
        let data = self.hosts.lock().unwrap()[&self.host]
            .files
            .get(remote)
            .cloned()
            .ok_or_else(|| FleetError::CommandFailed(format!("{}: no such file", remote)))?;
        std::fs::write(local, &data)?;
        Ok(data.len() as u64)
    }

    async fn create_tunnel(&self, _local: u16, _host: &str, _port: u16) -> Result<TunnelHandle> {
        self.check()?;
        Err(FleetError::Network("fake hosts cannot forward ports".to_string()))
    }

    async fn is_connected(&self) -> bool {
        self.check().is_ok()
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Split a command line into words, honouring single quotes and backslashes.
fn words(command: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(n) = chars.next() {
                    current.push(n);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    out.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        out.push(current);
    }
    out
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn exists(host: &FakeHost, path: &str) -> bool {
    let prefix = format!("{}/", path.trim_end_matches('/'));
    host.files.contains_key(path) || host.files.keys().any(|k| k.starts_with(&prefix))
}

fn metric_output(metric: OsMetric) -> &'static str {
    match metric {
        OsMetric::LoadAverage => "0.50 0.40 0.30 1/200 1234\n",
        OsMetric::Cpu => "%Cpu(s):  5.0 us,  2.0 sy,  0.0 ni, 93.0 id,  0.0 wa\n",
        OsMetric::Memory => "Mem:           1000         250         500          10         250         700\n",
        OsMetric::Disk => "/dev/sda1  100000  40000  60000  40% /\n",
        OsMetric::Processes => "120\n",
        OsMetric::Uptime => "3600.25 7000.00\n",
    }
}

/// Interpret one command against the fake host's state
fn run(host: &mut FakeHost, command: &str) -> (i32, String) {
    if let Some((code, out)) = host.responses.get(command) {
        return (*code, out.clone());
    }
    if let Some(metric) = OsMetric::ALL.iter().find(|m| m.command() == command) {
        return (0, metric_output(*metric).to_string());
    }
    if let Some(rest) = command.strip_prefix("sh -s <<") {
        // Heredoc: first line names the delimiter, last line closes it
        let body: Vec<&str> = rest.lines().skip(1).collect();
        let body = &body[..body.len().saturating_sub(1)];
        let mut output = String::new();
        let mut code = 0;
        for line in body.iter().filter(|l| !l.trim().is_empty()) {
            let (c, o) = run(host, line);
            output.push_str(&o);
            code = c;
        }
        return (code, output);
    }

    let argv = words(command);
    let args: Vec<&str> = argv.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["echo", rest @ ..] => (0, format!("{}\n", rest.join(" "))),
        ["exit", code] => (code.parse().unwrap_or(1), String::new()),
        ["true"] => (0, String::new()),
        ["false"] => (1, String::new()),
        ["test", "-e", path] => (if exists(host, path) { 0 } else { 1 }, String::new()),
        ["mkdir", "-p", ..] | ["chmod", ..] | ["chown", ..] | ["chgrp", ..] => (0, String::new()),
        ["mv", "-f", from, to] => match host.files.remove(*from) {
            Some(data) => {
                host.files.insert(to.to_string(), data);
                (0, String::new())
            }
            None => (1, format!("mv: cannot stat '{}'\n", from)),
        },
        ["cp", "-a", from, to] => {
            let prefix = format!("{}/", from.trim_end_matches('/'));
            let copies: Vec<(String, Vec<u8>)> = host
                .files
                .iter()
                .filter_map(|(path, data)| {
                    if path == from {
                        Some((to.to_string(), data.clone()))
                    } else {
                        path.strip_prefix(&prefix)
                            .map(|rel| (format!("{}/{}", to, rel), data.clone()))
                    }
                })
                .collect();
            if copies.is_empty() {
                return (1, format!("cp: cannot stat '{}'\n", from));
            }
            host.files.extend(copies);
            (0, String::new())
        }
        ["sha256sum", paths @ ..] => {
            let mut output = String::new();
            for path in paths {
                match host.files.get(*path) {
                    Some(data) => output.push_str(&format!("{}  {}\n", sha256_hex(data), path)),
                    None => {
                        return (1, format!("sha256sum: {}: No such file or directory\n", path))
                    }
                }
            }
            (0, output)
        }
        _ => (127, format!("sh: {}: command not found\n", args.first().unwrap_or(&""))),
    }
}

/// Password-authenticated config whose host is the server name
pub fn server(name: &str) -> ServerConfig {
    ServerConfig::new(name, name, "deploy").with_password("secret")
}

pub fn registry_with(fake: &FakeConnector) -> Arc<Registry> {
    Arc::new(Registry::new(
        Arc::new(fake.clone()),
        RegistrySettings::default(),
    ))
}

/// Registry with one registered server per name; the `reachable` ones answer.
pub async fn fleet(reachable: &[&str], unreachable: &[&str]) -> (FakeConnector, Arc<Registry>) {
    let fake = FakeConnector::new();
    let registry = registry_with(&fake);
    for name in reachable {
        fake.add_host(name);
        registry.add_server(server(name)).await.unwrap();
    }
    for name in unreachable {
        fake.add_unreachable_host(name);
        registry.add_server(server(name)).await.unwrap();
    }
    (fake, registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_words_handles_quotes() {
        assert_eq!(words("mv -f 'a b' c"), vec!["mv", "-f", "a b", "c"]);
        assert_eq!(words(r"echo 'it'\''s'"), vec!["echo", "it's"]);
        assert_eq!(words("echo ''"), vec!["echo", ""]);
    }
}
