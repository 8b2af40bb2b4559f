//! Configuration sync across servers
//!
//! A [`SyncProfile`] names a local source (file or directory), a remote
//! target path and a set of servers. A sync scans the source once, then runs
//! the same sequence on every server concurrently:
//!
//! 1. pre-commands (the first failure aborts that server)
//! 2. backup of the existing target (best-effort)
//! 3. transfer
//! 4. permissions and ownership (best-effort)
//! 5. checksum validation against the source fingerprint
//! 6. post-commands
//!
//! Only an unknown profile or an unreadable source fails the whole call.
//! Everything else is reported per server in the returned [`SyncEvent`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::SyncSettings;
use crate::error::{FleetError, Result};
use crate::fanout::{distinct, fan_out};
use crate::fingerprint::{compile_excludes, remote_fingerprint, scan_source, SourceSnapshot};
use crate::registry::Registry;
use crate::store::{EntityKind, Store};
use crate::utils::{expand_tilde, shell_quote, validate_name};

const UPLOAD_SUFFIX: &str = ".fleetops-tmp";
const HISTORY_DOCUMENT: &str = "events";

fn default_true() -> bool {
    true
}

/// Where a configuration comes from and where it goes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncProfile {
    pub name: String,
    /// Local file or directory, `~` allowed
    pub source: String,
    /// Remote path the source is written to
    pub target: String,
    pub servers: Vec<String>,
    /// Glob patterns matched against paths local to the source and file names
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub pre_commands: Vec<String>,
    #[serde(default)]
    pub post_commands: Vec<String>,
    #[serde(default = "default_true")]
    pub backup_before: bool,
    #[serde(default = "default_true")]
    pub validate: bool,
    /// Octal mode applied to every transferred file, e.g. `0640`
    #[serde(default)]
    pub permissions: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncProfile {
    pub fn new(name: &str, source: &str, target: &str, servers: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            servers,
            excludes: Vec::new(),
            pre_commands: Vec::new(),
            post_commands: Vec::new(),
            backup_before: true,
            validate: true,
            permissions: None,
            owner: None,
            group: None,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Structural checks that need neither the filesystem nor the registry
    pub fn validate(&self) -> Result<()> {
        validate_name("sync profile", &self.name)?;
        if self.source.trim().is_empty() {
            return Err(FleetError::Validation(format!("profile '{}' has no source", self.name)));
        }
        if self.target.trim().is_empty() {
            return Err(FleetError::Validation(format!("profile '{}' has no target", self.name)));
        }
        if self.servers.is_empty() {
            return Err(FleetError::Validation(format!(
                "profile '{}' has no servers",
                self.name
            )));
        }
        compile_excludes(&self.excludes)?;

        if let Some(mode) = &self.permissions {
            let valid = (3..=4).contains(&mode.len()) && mode.chars().all(|c| ('0'..='7').contains(&c));
            if !valid {
                return Err(FleetError::Validation(format!(
                    "profile '{}' has invalid permissions '{}', expected an octal mode like 0644",
                    self.name, mode
                )));
            }
        }
        for (field, value) in [("owner", &self.owner), ("group", &self.group)] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty() || v.contains(':')) {
                return Err(FleetError::Validation(format!(
                    "profile '{}' has an invalid {}",
                    self.name, field
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventType {
    Sync,
    DryRun,
}

/// Per-server outcome of a sync
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub files_updated: usize,
    pub files_skipped: usize,
    pub bytes_transferred: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub backup_path: Option<String>,
    /// Fingerprint recomputed from the server's copy
    pub checksum: Option<String>,
}

impl SyncResult {
    fn failed(error: String) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Record of one sync or dry run across a profile's servers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: String,
    pub profile: String,
    pub event_type: SyncEventType,
    pub timestamp: DateTime<Utc>,
    pub results: BTreeMap<String, SyncResult>,
    pub success_count: usize,
    pub failure_count: usize,
    pub total_files: usize,
    pub total_bytes: u64,
    pub source_checksum: String,
    pub duration_ms: u64,
}

impl SyncEvent {
    fn new(
        profile: &str,
        event_type: SyncEventType,
        snapshot: &SourceSnapshot,
        results: BTreeMap<String, SyncResult>,
        started: Instant,
    ) -> Self {
        let success_count = results.values().filter(|r| r.success).count();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            profile: profile.to_string(),
            event_type,
            timestamp: Utc::now(),
            failure_count: results.len() - success_count,
            success_count,
            results,
            total_files: snapshot.files.len(),
            total_bytes: snapshot.total_bytes,
            source_checksum: snapshot.fingerprint.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

pub struct ConfigSyncManager {
    registry: Arc<Registry>,
    profiles: RwLock<HashMap<String, SyncProfile>>,
    history: RwLock<VecDeque<SyncEvent>>,
    settings: SyncSettings,
    store: Option<Store>,
}

impl ConfigSyncManager {
    pub fn new(registry: Arc<Registry>, settings: SyncSettings) -> Self {
        Self {
            registry,
            profiles: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            settings,
            store: None,
        }
    }

    pub fn with_store(registry: Arc<Registry>, settings: SyncSettings, store: Store) -> Result<Self> {
        let profiles: Vec<SyncProfile> = store.load_all(EntityKind::SyncProfile)?;
        let mut history: VecDeque<SyncEvent> = store
            .load(EntityKind::SyncHistory, HISTORY_DOCUMENT)?
            .unwrap_or_default();
        while history.len() > settings.max_history {
            history.pop_front();
        }

        let mut manager = Self::new(registry, settings);
        manager.profiles = RwLock::new(profiles.into_iter().map(|p| (p.name.clone(), p)).collect());
        manager.history = RwLock::new(history);
        manager.store = Some(store);
        Ok(manager)
    }

    fn persist(&self, profile: &SyncProfile) -> Result<()> {
        match &self.store {
            Some(store) => store.save(EntityKind::SyncProfile, &profile.name, profile),
            None => Ok(()),
        }
    }

    // ============== Profiles ==============

    pub async fn create_sync_profile(&self, mut profile: SyncProfile) -> Result<SyncProfile> {
        profile.validate()?;

        let mut profiles = self.profiles.write().await;
        if profiles.contains_key(&profile.name) {
            return Err(FleetError::Validation(format!(
                "sync profile '{}' already exists",
                profile.name
            )));
        }
        let now = Utc::now();
        profile.created_at = now;
        profile.updated_at = now;

        self.persist(&profile)?;
        profiles.insert(profile.name.clone(), profile.clone());
        info!("Created sync profile {} -> {}", profile.name, profile.target);
        Ok(profile)
    }

    pub async fn get_sync_profile(&self, name: &str) -> Result<SyncProfile> {
        self.profiles
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| FleetError::not_found("sync profile", name))
    }

    /// Replace a profile. The name cannot change and `created_at` is kept.
    pub async fn update_sync_profile(&self, name: &str, mut profile: SyncProfile) -> Result<SyncProfile> {
        if profile.name != name {
            return Err(FleetError::Validation(format!(
                "sync profile name is immutable ('{}' != '{}')",
                profile.name, name
            )));
        }
        profile.validate()?;

        let mut profiles = self.profiles.write().await;
        let existing = profiles
            .get(name)
            .ok_or_else(|| FleetError::not_found("sync profile", name))?;
        profile.created_at = existing.created_at;
        profile.updated_at = Utc::now();

        self.persist(&profile)?;
        profiles.insert(name.to_string(), profile.clone());
        Ok(profile)
    }

    pub async fn delete_sync_profile(&self, name: &str) -> Result<()> {
        let mut profiles = self.profiles.write().await;
        if profiles.remove(name).is_none() {
            return Err(FleetError::not_found("sync profile", name));
        }
        if let Some(store) = &self.store {
            store.delete(EntityKind::SyncProfile, name)?;
        }
        Ok(())
    }

    pub async fn list_sync_profiles(&self) -> Vec<SyncProfile> {
        let mut list: Vec<SyncProfile> = self.profiles.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Full pre-flight check: structure, source on disk, servers registered.
    pub async fn validate_profile(&self, name: &str) -> Result<()> {
        let profile = self.get_sync_profile(name).await?;
        profile.validate()?;

        let mut problems = Vec::new();
        let source = PathBuf::from(expand_tilde(&profile.source));
        if !source.exists() {
            problems.push(format!("source {} does not exist", source.display()));
        }
        for server in distinct(&profile.servers) {
            if !self.registry.contains(&server).await {
                problems.push(format!("server '{}' is not registered", server));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(FleetError::Validation(format!(
                "profile '{}': {}",
                name,
                problems.join("; ")
            )))
        }
    }

    // ============== Sync ==============

    async fn snapshot(&self, profile: &SyncProfile) -> Result<SourceSnapshot> {
        let source = PathBuf::from(expand_tilde(&profile.source));
        let excludes = compile_excludes(&profile.excludes)?;
        tokio::task::spawn_blocking(move || scan_source(&source, &excludes))
            .await
            .map_err(|e| FleetError::InvalidState(format!("source scan panicked: {}", e)))?
    }

    pub async fn sync_configuration(&self, name: &str) -> Result<SyncEvent> {
        let started = Instant::now();
        let profile = Arc::new(self.get_sync_profile(name).await?);
        let snapshot = Arc::new(self.snapshot(&profile).await?);
        info!(
            "Syncing {} ({} files, {} bytes) to {} servers",
            name,
            snapshot.files.len(),
            snapshot.total_bytes,
            profile.servers.len()
        );

        let outcomes = fan_out(&profile.servers, |server| {
            let registry = Arc::clone(&self.registry);
            let profile = Arc::clone(&profile);
            let snapshot = Arc::clone(&snapshot);
            async move {
                let job = ServerSync {
                    registry: &registry,
                    profile: &profile,
                    snapshot: &snapshot,
                    server: &server,
                };
                Ok(job.run().await)
            }
        })
        .await;

        let results = outcomes
            .into_iter()
            .map(|(server, outcome)| {
                (server, outcome.unwrap_or_else(|e| SyncResult::failed(e.to_string())))
            })
            .collect();
        let event = SyncEvent::new(name, SyncEventType::Sync, &snapshot, results, started);
        info!(
            "Sync {} finished: {} ok, {} failed",
            name, event.success_count, event.failure_count
        );

        let mut history = self.history.write().await;
        history.push_back(event.clone());
        while history.len() > self.settings.max_history {
            history.pop_front();
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.save(EntityKind::SyncHistory, HISTORY_DOCUMENT, &*history) {
                warn!("Could not persist sync history: {}", e);
            }
        }
        Ok(event)
    }

    /// Plan a sync without touching any server. Not recorded in history.
    pub async fn dry_run(&self, name: &str) -> Result<SyncEvent> {
        let started = Instant::now();
        let profile = self.get_sync_profile(name).await?;
        let snapshot = self.snapshot(&profile).await?;

        let mut results = BTreeMap::new();
        for server in distinct(&profile.servers) {
            let result = if self.registry.contains(&server).await {
                SyncResult {
                    success: true,
                    files_updated: snapshot.files.len(),
                    files_skipped: snapshot.skipped,
                    bytes_transferred: snapshot.total_bytes,
                    ..Default::default()
                }
            } else {
                SyncResult::failed(FleetError::not_found("server", server.as_str()).to_string())
            };
            results.insert(server, result);
        }

        Ok(SyncEvent::new(name, SyncEventType::DryRun, &snapshot, results, started))
    }

    /// Recorded syncs, newest first
    pub async fn get_sync_history(&self, profile: Option<&str>, limit: Option<usize>) -> Vec<SyncEvent> {
        self.history
            .read()
            .await
            .iter()
            .rev()
            .filter(|e| profile.map_or(true, |p| e.profile == p))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

/// Parent directory of a remote path, if it has one worth creating
fn remote_parent(path: &str) -> Option<&str> {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) | None => None,
        Some((parent, _)) => Some(parent),
    }
}

fn quoted(paths: &[String]) -> String {
    paths.iter().map(|p| shell_quote(p)).collect::<Vec<_>>().join(" ")
}

/// The step sequence for one server
struct ServerSync<'a> {
    registry: &'a Registry,
    profile: &'a SyncProfile,
    snapshot: &'a SourceSnapshot,
    server: &'a str,
}

impl ServerSync<'_> {
    async fn run(&self) -> SyncResult {
        let started = Instant::now();
        let mut result = SyncResult {
            files_skipped: self.snapshot.skipped,
            ..Default::default()
        };

        match self.steps(&mut result).await {
            Ok(()) => result.success = true,
            Err(e) => {
                warn!("Sync {} on {} failed: {}", self.profile.name, self.server, e);
                result.error = Some(e.to_string());
            }
        }
        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    async fn steps(&self, result: &mut SyncResult) -> Result<()> {
        for command in &self.profile.pre_commands {
            self.run_hook("pre-command", command).await?;
        }

        if self.profile.backup_before {
            result.backup_path = self.backup().await;
        }

        let remote_paths = self.snapshot.remote_paths(&self.profile.target);
        self.transfer(&remote_paths, result).await?;
        self.apply_metadata(&remote_paths).await;

        if self.profile.validate && !remote_paths.is_empty() {
            result.checksum = Some(self.verify(&remote_paths).await?);
        }

        for command in &self.profile.post_commands {
            self.run_hook("post-command", command).await?;
        }
        Ok(())
    }

    async fn run_hook(&self, stage: &str, command: &str) -> Result<()> {
        let out = self.registry.execute_command(self.server, command).await?;
        if out.success() {
            return Ok(());
        }
        let reason = if out.timed_out {
            "timed out".to_string()
        } else {
            format!("exited with {}", out.exit_code)
        };
        Err(FleetError::CommandFailed(format!("{} `{}` {}", stage, command, reason)))
    }

    /// Copy the current target aside. Returns the backup path when one was made.
    async fn backup(&self) -> Option<String> {
        let target = &self.profile.target;
        let exists = self
            .registry
            .execute_command(self.server, &format!("test -e {}", shell_quote(target)))
            .await
            .map(|out| out.success())
            .unwrap_or(false);
        if !exists {
            return None;
        }

        let backup = format!(
            "{}.backup.{}",
            target.trim_end_matches('/'),
            Utc::now().format("%Y%m%d%H%M%S")
        );
        let command = format!("cp -a {} {}", shell_quote(target), shell_quote(&backup));
        match self.registry.execute_command(self.server, &command).await {
            Ok(out) if out.success() => {
                debug!("{}: backed up {} to {}", self.server, target, backup);
                Some(backup)
            }
            Ok(out) => {
                warn!("{}: backup of {} exited with {}", self.server, target, out.exit_code);
                None
            }
            Err(e) => {
                warn!("{}: backup of {} failed: {}", self.server, target, e);
                None
            }
        }
    }

    async fn transfer(&self, remote_paths: &[String], result: &mut SyncResult) -> Result<()> {
        let mut dirs: BTreeSet<String> = remote_paths
            .iter()
            .filter_map(|p| remote_parent(p))
            .map(str::to_string)
            .collect();
        if self.snapshot.is_dir {
            dirs.insert(self.profile.target.trim_end_matches('/').to_string());
        }
        if !dirs.is_empty() {
            let dirs: Vec<String> = dirs.into_iter().collect();
            self.run_hook("mkdir", &format!("mkdir -p {}", quoted(&dirs))).await?;
        }

        if !self.snapshot.is_dir {
            let (file, target) = match (self.snapshot.files.first(), remote_paths.first()) {
                (Some(file), Some(target)) => (file, target),
                _ => return Ok(()),
            };
            let staging = format!("{}{}", target, UPLOAD_SUFFIX);
            let sent = self.registry.upload_file(self.server, &file.path, &staging).await?;
            self.run_hook(
                "rename",
                &format!("mv -f {} {}", shell_quote(&staging), shell_quote(target)),
            )
            .await?;
            result.files_updated = 1;
            result.bytes_transferred = sent;
            return Ok(());
        }

        for (file, remote) in self.snapshot.files.iter().zip(remote_paths) {
            let sent = self.registry.upload_file(self.server, &file.path, remote).await?;
            result.files_updated += 1;
            result.bytes_transferred += sent;
        }
        Ok(())
    }

    /// chmod / chown on every transferred file. Failures are logged only.
    async fn apply_metadata(&self, remote_paths: &[String]) {
        if remote_paths.is_empty() {
            return;
        }
        let files = quoted(remote_paths);

        let mut commands = Vec::new();
        if let Some(mode) = &self.profile.permissions {
            commands.push(format!("chmod {} {}", mode, files));
        }
        match (&self.profile.owner, &self.profile.group) {
            (Some(owner), Some(group)) => {
                commands.push(format!("chown {} {}", shell_quote(&format!("{}:{}", owner, group)), files))
            }
            (Some(owner), None) => commands.push(format!("chown {} {}", shell_quote(owner), files)),
            (None, Some(group)) => commands.push(format!("chgrp {} {}", shell_quote(group), files)),
            (None, None) => {}
        }

        for command in commands {
            if let Err(e) = self.run_hook("metadata", &command).await {
                warn!("{}: {}", self.server, e);
            }
        }
    }

    async fn verify(&self, remote_paths: &[String]) -> Result<String> {
        let command = format!("sha256sum {}", quoted(remote_paths));
        let out = self.registry.execute_command(self.server, &command).await?;
        if out.timed_out {
            return Err(FleetError::Timeout(format!("checksum on {}", self.server)));
        }

        let actual = remote_fingerprint(self.snapshot, remote_paths, &out.output)?;
        if actual != self.snapshot.fingerprint {
            return Err(FleetError::ChecksumMismatch {
                expected: self.snapshot.fingerprint.clone(),
                actual,
            });
        }
        debug!("{}: checksum verified for {}", self.server, self.profile.target);
        Ok(actual)
    }
}
