//! Parsing of remote metric command output
//!
//! Everything here is pure string handling so it can be tested without a
//! remote host. Parse failures yield `None` and are skipped by callers.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::registry::ServerStatus;

/// Prefix of a custom metric line in health check output, e.g. `METRIC:queue_depth=42`
pub const METRIC_MARKER: &str = "METRIC:";

/// Latest metrics snapshot for one server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMetrics {
    pub server: String,
    pub status: ServerStatus,
    pub response_time_ms: Option<u64>,
    pub uptime_secs: Option<u64>,
    pub load_average: Option<[f64; 3]>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub process_count: Option<u32>,
    pub custom: BTreeMap<String, String>,
    pub collected_at: DateTime<Utc>,
}

impl ServerMetrics {
    pub fn new(server: &str, status: ServerStatus) -> Self {
        Self {
            server: server.to_string(),
            status,
            response_time_ms: None,
            uptime_secs: None,
            load_average: None,
            cpu_percent: None,
            memory_percent: None,
            disk_percent: None,
            process_count: None,
            custom: BTreeMap::new(),
            collected_at: Utc::now(),
        }
    }

    /// Fold one metric command's output into the snapshot.
    ///
    /// Returns false if the output could not be parsed.
    pub fn apply(&mut self, metric: OsMetric, output: &str) -> bool {
        match metric {
            OsMetric::LoadAverage => parse_load_average(output).map(|v| self.load_average = Some(v)),
            OsMetric::Cpu => parse_cpu_percent(output).map(|v| self.cpu_percent = Some(v)),
            OsMetric::Memory => parse_memory_percent(output).map(|v| self.memory_percent = Some(v)),
            OsMetric::Disk => parse_disk_percent(output).map(|v| self.disk_percent = Some(v)),
            OsMetric::Processes => parse_process_count(output).map(|v| self.process_count = Some(v)),
            OsMetric::Uptime => parse_uptime_secs(output).map(|v| self.uptime_secs = Some(v)),
        }
        .is_some()
    }
}

/// Standard OS metrics gathered from every monitored server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsMetric {
    LoadAverage,
    Cpu,
    Memory,
    Disk,
    Processes,
    Uptime,
}

impl OsMetric {
    pub const ALL: [OsMetric; 6] = [
        OsMetric::LoadAverage,
        OsMetric::Cpu,
        OsMetric::Memory,
        OsMetric::Disk,
        OsMetric::Processes,
        OsMetric::Uptime,
    ];

    /// Remote command producing this metric
    pub fn command(&self) -> &'static str {
        match self {
            OsMetric::LoadAverage => "cat /proc/loadavg",
            OsMetric::Cpu => "top -bn1 | grep -m1 'Cpu(s)'",
            OsMetric::Memory => "free -m | grep '^Mem:'",
            OsMetric::Disk => "df -P / | tail -1",
            OsMetric::Processes => "ps -e --no-headers | wc -l",
            OsMetric::Uptime => "cat /proc/uptime",
        }
    }
}

/// `0.15 0.10 0.05 1/123 4567`
pub fn parse_load_average(output: &str) -> Option<[f64; 3]> {
    let mut parts = output.split_whitespace().map(|p| p.parse::<f64>());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(a)), Some(Ok(b)), Some(Ok(c))) => Some([a, b, c]),
        _ => None,
    }
}

/// `%Cpu(s):  3.1 us,  1.0 sy,  0.0 ni, 95.5 id, ...` → 100 - idle
pub fn parse_cpu_percent(output: &str) -> Option<f64> {
    static IDLE: OnceLock<Regex> = OnceLock::new();
    let re = IDLE.get_or_init(|| Regex::new(r"([0-9]+(?:[.,][0-9]+)?)\s*%?\s*id").expect("valid regex"));

    let caps = re.captures(output)?;
    let idle: f64 = caps[1].replace(',', ".").parse().ok()?;
    Some(round2((100.0 - idle).clamp(0.0, 100.0)))
}

/// `Mem:  7821  2345  1200 ...` → used / total
pub fn parse_memory_percent(output: &str) -> Option<f64> {
    let line = output.lines().find(|l| l.trim_start().starts_with("Mem:"))?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    let total: f64 = fields.get(1)?.parse().ok()?;
    let used: f64 = fields.get(2)?.parse().ok()?;
    if total <= 0.0 {
        return None;
    }
    Some(round2(used / total * 100.0))
}

/// `/dev/sda1  41152736 18234560 20821012  47% /` → 47
pub fn parse_disk_percent(output: &str) -> Option<f64> {
    let line = output.lines().rev().find(|l| !l.trim().is_empty())?;
    line.split_whitespace()
        .find_map(|field| field.strip_suffix('%'))
        .and_then(|v| v.parse().ok())
}

pub fn parse_process_count(output: &str) -> Option<u32> {
    output.trim().parse().ok()
}

/// `12345.67 54321.00` → 12345
pub fn parse_uptime_secs(output: &str) -> Option<u64> {
    let first: f64 = output.split_whitespace().next()?.parse().ok()?;
    (first >= 0.0).then_some(first as u64)
}

/// Extract `METRIC:key=value` lines from arbitrary command output.
pub fn parse_custom_metrics(output: &str) -> BTreeMap<String, String> {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    let re = MARKER.get_or_init(|| {
        Regex::new(r"^\s*METRIC:\s*([A-Za-z0-9_.\-]+)\s*=\s*(.*?)\s*$").expect("valid regex")
    });

    output
        .lines()
        .filter_map(|line| re.captures(line))
        .filter(|caps| !caps[2].is_empty())
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_load_average() {
        assert_eq!(
            parse_load_average("0.15 0.10 0.05 1/123 4567\n"),
            Some([0.15, 0.10, 0.05])
        );
        assert_eq!(parse_load_average("garbage"), None);
        assert_eq!(parse_load_average(""), None);
    }

    #[test]
    fn test_parse_cpu_percent() {
        let line = "%Cpu(s):  3.1 us,  1.0 sy,  0.0 ni, 95.5 id,  0.4 wa,  0.0 hi,  0.0 si,  0.0 st";
        assert_eq!(parse_cpu_percent(line), Some(4.5));
        // Older procps format
        let old = "Cpu(s): 12.0%us,  3.0%sy,  0.0%ni, 85.0%id,  0.0%wa";
        assert_eq!(parse_cpu_percent(old), Some(15.0));
        assert_eq!(parse_cpu_percent("bash: top: command not found"), None);
    }

    #[test]
    fn test_parse_memory_percent() {
        let out = "Mem:           8000        2000        3000         100        3000        5800";
        assert_eq!(parse_memory_percent(out), Some(25.0));
        assert_eq!(parse_memory_percent("Mem: 0 0"), None);
        assert_eq!(parse_memory_percent(""), None);
    }

    #[test]
    fn test_parse_disk_percent() {
        let out = "/dev/sda1  41152736 18234560 20821012      47% /\n";
        assert_eq!(parse_disk_percent(out), Some(47.0));
        assert_eq!(parse_disk_percent("no percentage here"), None);
    }

    #[test]
    fn test_parse_process_count_and_uptime() {
        assert_eq!(parse_process_count(" 213\n"), Some(213));
        assert_eq!(parse_process_count("x"), None);
        assert_eq!(parse_uptime_secs("12345.67 54321.00\n"), Some(12345));
        assert_eq!(parse_uptime_secs(""), None);
    }

    #[test]
    fn test_parse_custom_metrics() {
        let out = "starting\nMETRIC:queue_depth=42\n  METRIC: cache.hit-rate = 0.93 \nMETRIC:empty=\nnoise METRIC:x=1\n";
        let metrics = parse_custom_metrics(out);
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics["queue_depth"], "42");
        assert_eq!(metrics["cache.hit-rate"], "0.93");
    }

    #[test]
    fn test_apply_skips_unparseable_output() {
        let mut metrics = ServerMetrics::new("web1", ServerStatus::Online);
        assert!(metrics.apply(OsMetric::LoadAverage, "1.00 0.50 0.25 2/100 99"));
        assert!(!metrics.apply(OsMetric::Disk, "df: command not found"));
        assert_eq!(metrics.load_average, Some([1.0, 0.5, 0.25]));
        assert_eq!(metrics.disk_percent, None);
    }
}
