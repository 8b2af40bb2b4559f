//! On-disk persistence for entity definitions
//!
//! One pretty-printed JSON document per entity under
//! `<root>/<kind>/<name>.json`. Writes go to a temp file in the same
//! directory and are renamed into place.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{FleetError, Result};

/// Kinds of persisted entities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Server,
    Cluster,
    SyncProfile,
    MonitoringTask,
    SyncHistory,
}

impl EntityKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            EntityKind::Server => "servers",
            EntityKind::Cluster => "clusters",
            EntityKind::SyncProfile => "profiles",
            EntityKind::MonitoringTask => "tasks",
            EntityKind::SyncHistory => "history",
        }
    }
}

/// JSON document store rooted at the fleet state directory
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Open (and create if needed) a store at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for kind in [
            EntityKind::Server,
            EntityKind::Cluster,
            EntityKind::SyncProfile,
            EntityKind::MonitoringTask,
            EntityKind::SyncHistory,
        ] {
            fs::create_dir_all(root.join(kind.dir_name()))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entity_path(&self, kind: EntityKind, name: &str) -> PathBuf {
        self.root.join(kind.dir_name()).join(format!("{}.json", name))
    }

    /// Atomically write `value` as the document for `name`.
    pub fn save<T: Serialize>(&self, kind: EntityKind, name: &str, value: &T) -> Result<()> {
        let path = self.entity_path(kind, name);
        let tmp = path.with_extension("json.tmp");

        let content = serde_json::to_vec_pretty(value)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&content)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        debug!("Saved {} {}", kind.dir_name(), name);
        Ok(())
    }

    /// Load a single document, `None` if it was never written.
    pub fn load<T: DeserializeOwned>(&self, kind: EntityKind, name: &str) -> Result<Option<T>> {
        let path = self.entity_path(kind, name);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FleetError::Io(e)),
        }
    }

    /// Remove the document for `name`. Missing documents are not an error.
    pub fn delete(&self, kind: EntityKind, name: &str) -> Result<()> {
        match fs::remove_file(self.entity_path(kind, name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FleetError::Io(e)),
        }
    }

    /// Load every document of `kind`, sorted by file name.
    ///
    /// Unparseable documents are skipped with a warning so one bad file does
    /// not block startup.
    pub fn load_all<T: DeserializeOwned>(&self, kind: EntityKind) -> Result<Vec<T>> {
        let dir = self.root.join(kind.dir_name());
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut paths: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut items = Vec::with_capacity(paths.len());
        for path in paths {
            let content = fs::read_to_string(&path)?;
            match serde_json::from_str(&content) {
                Ok(item) => items.push(item),
                Err(e) => warn!("Skipping unreadable {}: {}", path.display(), e),
            }
        }
        Ok(items)
    }
}
