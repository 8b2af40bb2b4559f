//! Concurrent per-server fan-out
//!
//! One task per distinct server, all joined before the call returns. Every
//! server named in the input gets exactly one entry in the output, even if
//! its task panicked.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{FleetError, Result};
use crate::remote::CommandOutput;

/// Drop duplicate names, keeping first occurrence order.
pub fn distinct(servers: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    servers
        .iter()
        .filter(|s| seen.insert(s.as_str()))
        .cloned()
        .collect()
}

/// Run `op` once per distinct server concurrently and collect every outcome.
pub async fn fan_out<T, F, Fut>(servers: &[String], op: F) -> BTreeMap<String, Result<T>>
where
    T: Send + 'static,
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let servers = distinct(servers);
    let mut set = JoinSet::new();
    for server in &servers {
        let fut = op(server.clone());
        let server = server.clone();
        set.spawn(async move { (server, fut.await) });
    }

    let mut results = BTreeMap::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((server, result)) => {
                results.insert(server, result);
            }
            Err(e) => warn!("Fan-out task failed to complete: {}", e),
        }
    }

    for server in servers {
        results.entry(server).or_insert_with(|| {
            Err(FleetError::InvalidState(
                "server task ended without a result".to_string(),
            ))
        });
    }
    results
}

/// Outcome of one command on one server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerExecResult {
    pub success: bool,
    pub output: Option<CommandOutput>,
    pub error: Option<String>,
}

impl From<Result<CommandOutput>> for ServerExecResult {
    fn from(result: Result<CommandOutput>) -> Self {
        match result {
            Ok(out) => {
                let error = if out.timed_out {
                    Some("command timed out".to_string())
                } else if out.exit_code != 0 {
                    Some(format!("exit code {}", out.exit_code))
                } else {
                    None
                };
                Self {
                    success: out.success(),
                    output: Some(out),
                    error,
                }
            }
            Err(e) => Self {
                success: false,
                output: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Aggregated results of a command fan-out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOutReport {
    pub results: BTreeMap<String, ServerExecResult>,
    pub success_count: usize,
    pub failure_count: usize,
    /// Percentage of servers that succeeded, 0 when there were none
    pub success_rate: f64,
    pub duration_ms: u64,
}

impl FanOutReport {
    pub fn new(results: BTreeMap<String, ServerExecResult>, started: Instant) -> Self {
        let success_count = results.values().filter(|r| r.success).count();
        let failure_count = results.len() - success_count;
        let success_rate = success_rate(success_count, results.len());
        let duration_ms = started.elapsed().as_millis() as u64;

        debug!(
            "Fan-out finished: {} ok, {} failed in {}ms",
            success_count, failure_count, duration_ms
        );
        Self {
            results,
            success_count,
            failure_count,
            success_rate,
            duration_ms,
        }
    }
}

pub fn success_rate(successes: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        successes as f64 / total as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_distinct_keeps_first_order() {
        assert_eq!(distinct(&names(&["b", "a", "b", "c", "a"])), names(&["b", "a", "c"]));
    }

    #[tokio::test]
    async fn test_every_server_gets_a_result() {
        let servers = names(&["ok", "fail", "panic", "ok"]);
        let results = fan_out(&servers, |server| async move {
            match server.as_str() {
                "ok" => Ok(1),
                "fail" => Err(FleetError::Network("down".into())),
                _ => panic!("boom"),
            }
        })
        .await;

        assert_eq!(results.len(), 3);
        assert!(matches!(results["ok"], Ok(1)));
        assert!(matches!(results["fail"], Err(FleetError::Network(_))));
        assert!(matches!(results["panic"], Err(FleetError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_runs_concurrently() {
        let servers = names(&["a", "b", "c", "d"]);
        let start = Instant::now();
        let results = fan_out(&servers, |_| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        })
        .await;
        assert_eq!(results.len(), 4);
        assert!(start.elapsed() < Duration::from_millis(350));
    }

    #[test]
    fn test_report_counts() {
        let mut results = BTreeMap::new();
        results.insert(
            "web1".to_string(),
            ServerExecResult::from(Ok(CommandOutput {
                command: "true".into(),
                exit_code: 0,
                output: String::new(),
                duration_ms: 1,
                timestamp: chrono::Utc::now(),
                timed_out: false,
            })),
        );
        results.insert(
            "web2".to_string(),
            ServerExecResult::from(Err(FleetError::Network("refused".into()))),
        );
        let report = FanOutReport::new(results, Instant::now());
        assert_eq!(report.success_count, 1);
        assert_eq!(report.failure_count, 1);
        assert_eq!(report.success_rate, 50.0);
        assert_eq!(report.results["web2"].error.as_deref(), Some("Network error: refused"));

        let empty = FanOutReport::new(BTreeMap::new(), Instant::now());
        assert_eq!(empty.success_rate, 0.0);
    }
}
