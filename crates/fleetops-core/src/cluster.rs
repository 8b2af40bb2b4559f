//! Logical server groups and cluster-wide command execution

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{FleetError, Result};
use crate::fanout::{fan_out, FanOutReport, ServerExecResult};
use crate::registry::Registry;
use crate::store::{EntityKind, Store};
use crate::utils::validate_name;

/// A named group of servers. Members are resolved by name at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub servers: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update; `None` fields are left unchanged
#[derive(Debug, Clone, Default)]
pub struct ClusterUpdate {
    pub description: Option<String>,
    pub servers: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
}

pub struct ClusterManager {
    registry: Arc<Registry>,
    clusters: RwLock<HashMap<String, Cluster>>,
    store: Option<Store>,
}

impl ClusterManager {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            clusters: RwLock::new(HashMap::new()),
            store: None,
        }
    }

    pub fn with_store(registry: Arc<Registry>, store: Store) -> Result<Self> {
        let clusters: Vec<Cluster> = store.load_all(EntityKind::Cluster)?;
        Ok(Self {
            registry,
            clusters: RwLock::new(clusters.into_iter().map(|c| (c.name.clone(), c)).collect()),
            store: Some(store),
        })
    }

    fn persist(&self, cluster: &Cluster) -> Result<()> {
        match &self.store {
            Some(store) => store.save(EntityKind::Cluster, &cluster.name, cluster),
            None => Ok(()),
        }
    }

    pub async fn create_cluster(
        &self,
        name: &str,
        description: &str,
        servers: Vec<String>,
        tags: Vec<String>,
    ) -> Result<Cluster> {
        validate_name("cluster", name)?;
        if servers.is_empty() {
            return Err(FleetError::Validation(format!(
                "cluster '{}' needs at least one server",
                name
            )));
        }

        let mut clusters = self.clusters.write().await;
        if clusters.contains_key(name) {
            return Err(FleetError::Validation(format!("cluster '{}' already exists", name)));
        }

        let now = Utc::now();
        let cluster = Cluster {
            name: name.to_string(),
            description: description.to_string(),
            servers,
            tags,
            created_at: now,
            updated_at: now,
        };
        self.persist(&cluster)?;
        clusters.insert(name.to_string(), cluster.clone());

        info!("Created cluster {} with {} servers", name, cluster.servers.len());
        Ok(cluster)
    }

    pub async fn get_cluster(&self, name: &str) -> Result<Cluster> {
        self.clusters
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| FleetError::not_found("cluster", name))
    }

    pub async fn update_cluster(&self, name: &str, update: ClusterUpdate) -> Result<Cluster> {
        if update.servers.as_ref().is_some_and(|s| s.is_empty()) {
            return Err(FleetError::Validation(format!(
                "cluster '{}' needs at least one server",
                name
            )));
        }

        self.modify(name, |cluster| {
            if let Some(description) = update.description {
                cluster.description = description;
            }
            if let Some(servers) = update.servers {
                cluster.servers = servers;
            }
            if let Some(tags) = update.tags {
                cluster.tags = tags;
            }
            Ok(())
        })
        .await
    }

    pub async fn delete_cluster(&self, name: &str) -> Result<()> {
        let mut clusters = self.clusters.write().await;
        if !clusters.contains_key(name) {
            return Err(FleetError::not_found("cluster", name));
        }
        if let Some(store) = &self.store {
            store.delete(EntityKind::Cluster, name)?;
        }
        clusters.remove(name);
        info!("Deleted cluster {}", name);
        Ok(())
    }

    /// All clusters, sorted by name
    pub async fn list_clusters(&self) -> Vec<Cluster> {
        let mut list: Vec<Cluster> = self.clusters.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub async fn add_server_to_cluster(&self, cluster: &str, server: &str) -> Result<Cluster> {
        self.modify(cluster, |c| {
            if c.servers.iter().any(|s| s == server) {
                return Err(FleetError::Validation(format!(
                    "server '{}' is already in cluster '{}'",
                    server, c.name
                )));
            }
            c.servers.push(server.to_string());
            Ok(())
        })
        .await
    }

    pub async fn remove_server_from_cluster(&self, cluster: &str, server: &str) -> Result<Cluster> {
        self.modify(cluster, |c| {
            let pos = c
                .servers
                .iter()
                .position(|s| s == server)
                .ok_or_else(|| FleetError::not_found("cluster member", server))?;
            if c.servers.len() == 1 {
                return Err(FleetError::Validation(format!(
                    "cannot remove the last server of cluster '{}'",
                    c.name
                )));
            }
            c.servers.remove(pos);
            Ok(())
        })
        .await
    }

    /// Apply `f` to a copy of the cluster and commit only if it succeeds.
    async fn modify<F>(&self, name: &str, f: F) -> Result<Cluster>
    where
        F: FnOnce(&mut Cluster) -> Result<()>,
    {
        let mut clusters = self.clusters.write().await;
        let current = clusters
            .get(name)
            .ok_or_else(|| FleetError::not_found("cluster", name))?;

        let mut updated = current.clone();
        f(&mut updated)?;
        updated.updated_at = Utc::now();

        self.persist(&updated)?;
        clusters.insert(name.to_string(), updated.clone());
        Ok(updated)
    }

    pub async fn execute_on_cluster(&self, name: &str, command: &str) -> Result<FanOutReport> {
        let cluster = self.get_cluster(name).await?;
        info!("Executing on cluster {}: {}", name, command);
        Ok(self.execute_on_servers(&cluster.servers, command).await)
    }

    /// Run `command` on every listed server concurrently.
    ///
    /// Per-server failures (unknown server, unreachable host, non-zero exit)
    /// are reported in the result map, never raised.
    pub async fn execute_on_servers(&self, servers: &[String], command: &str) -> FanOutReport {
        let started = Instant::now();
        let results = fan_out(servers, |server| {
            let registry = Arc::clone(&self.registry);
            let command = command.to_string();
            async move { registry.execute_command(&server, &command).await }
        })
        .await;

        let results = results
            .into_iter()
            .map(|(server, result)| (server, ServerExecResult::from(result)))
            .collect();
        FanOutReport::new(results, started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fleet;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_create_requires_members() {
        let (_fake, registry) = fleet(&["web1"], &[]).await;
        let manager = ClusterManager::new(registry);

        let err = manager
            .create_cluster("db-tier", "", vec![], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
        assert!(manager.list_clusters().await.is_empty());

        let cluster = manager
            .create_cluster("web-tier", "", names(&["web1"]), vec![])
            .await
            .unwrap();
        assert_eq!(cluster.description, "");

        assert!(matches!(
            manager.create_cluster("web-tier", "again", names(&["web1"]), vec![]).await,
            Err(FleetError::Validation(_))
        ));
        assert!(matches!(
            manager.create_cluster("", "x", names(&["web1"]), vec![]).await,
            Err(FleetError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_update_and_membership() {
        let (_fake, registry) = fleet(&["web1", "web2"], &[]).await;
        let manager = ClusterManager::new(registry);
        manager
            .create_cluster("web", "frontends", names(&["web1"]), vec![])
            .await
            .unwrap();

        let updated = manager
            .update_cluster(
                "web",
                ClusterUpdate {
                    tags: Some(names(&["prod"])),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.description, "frontends");
        assert_eq!(updated.tags, names(&["prod"]));
        assert!(updated.updated_at >= updated.created_at);

        let empty = ClusterUpdate {
            servers: Some(vec![]),
            ..Default::default()
        };
        assert!(matches!(
            manager.update_cluster("web", empty).await,
            Err(FleetError::Validation(_))
        ));

        manager.add_server_to_cluster("web", "web2").await.unwrap();
        assert!(manager.add_server_to_cluster("web", "web2").await.is_err());
        manager.remove_server_from_cluster("web", "web1").await.unwrap();
        assert!(matches!(
            manager.remove_server_from_cluster("web", "web2").await,
            Err(FleetError::Validation(_))
        ));
        assert_eq!(manager.get_cluster("web").await.unwrap().servers, names(&["web2"]));

        manager.delete_cluster("web").await.unwrap();
        assert!(matches!(
            manager.get_cluster("web").await,
            Err(FleetError::NotFound { .. })
        ));
        assert!(matches!(
            manager.delete_cluster("web").await,
            Err(FleetError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_mixed_reachability() {
        let (_fake, registry) = fleet(&["web1"], &["web2"]).await;
        let manager = ClusterManager::new(registry);
        manager
            .create_cluster("web", "", names(&["web1", "web2"]), vec![])
            .await
            .unwrap();

        let report = manager.execute_on_cluster("web", "echo ok").await.unwrap();
        assert_eq!(report.success_count, 1);
        assert_eq!(report.failure_count, 1);
        assert_eq!(report.success_rate, 50.0);
        assert!(report.results["web1"].success);
        assert_eq!(
            report.results["web1"].output.as_ref().unwrap().output.trim(),
            "ok"
        );
        assert!(report.results["web2"].error.is_some());
    }

    #[tokio::test]
    async fn test_total_failure_still_reports_every_server() {
        let (_fake, registry) = fleet(&[], &["a", "b", "c"]).await;
        let manager = ClusterManager::new(registry);

        let servers = names(&["a", "b", "c", "ghost", "a"]);
        let report = manager.execute_on_servers(&servers, "true").await;
        assert_eq!(report.results.len(), 4);
        assert_eq!(report.success_count, 0);
        assert_eq!(report.failure_count, 4);
        assert_eq!(report.success_rate, 0.0);
        assert!(report.results["ghost"]
            .error
            .as_deref()
            .unwrap()
            .contains("not found"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let (_fake, registry) = fleet(&["web1"], &[]).await;
        let manager = ClusterManager::new(registry);
        let report = manager.execute_on_servers(&names(&["web1"]), "exit 2").await;
        assert!(!report.results["web1"].success);
        assert_eq!(report.results["web1"].output.as_ref().unwrap().exit_code, 2);
    }

    #[tokio::test]
    async fn test_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let (_fake, registry) = fleet(&["web1"], &[]).await;

        let manager = ClusterManager::with_store(Arc::clone(&registry), store.clone()).unwrap();
        manager
            .create_cluster("web", "", names(&["web1"]), vec![])
            .await
            .unwrap();

        let reloaded = ClusterManager::with_store(registry, store).unwrap();
        assert_eq!(reloaded.get_cluster("web").await.unwrap().servers, names(&["web1"]));
    }
}
