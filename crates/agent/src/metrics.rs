//! Health metrics snapshots
//!
//! Point-in-time samples of process, connection and streaming state with
//! JSON serialization support.

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Snapshot taken on every metrics tick
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HealthMetrics {
    pub uptime_secs: u64,
    /// Resident memory of the agent process
    pub memory_rss_mb: u64,
    pub memory_used_percent: f32,
    pub cpu_usage_percent: f32,
    pub connection_connected: bool,
    pub connection_ready: bool,
    pub connection_latency_ms: Option<u64>,
    pub voice_connected: bool,
    /// Voice session valid and an encoder running
    pub streaming: bool,
    pub encoder_running: bool,
    pub error_count: u64,
    pub warning_count: u64,
    pub timestamp_unix_ms: i64,
}

/// System-level part of a snapshot
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemSample {
    pub memory_rss_mb: u64,
    pub memory_used_percent: f32,
    pub cpu_usage_percent: f32,
}

/// Collects system metrics using sysinfo
///
/// Holds on to its `System` so CPU usage is measured between consecutive
/// samples rather than from a cold start.
pub struct SystemSampler {
    sys: System,
    pid: Option<Pid>,
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSampler {
    pub fn new() -> Self {
        Self {
            sys: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    pub fn sample(&mut self) -> SystemSample {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let memory_rss_mb = match self.pid {
            Some(pid) => {
                self.sys.refresh_processes_specifics(
                    ProcessesToUpdate::Some(&[pid]),
                    ProcessRefreshKind::new().with_memory(),
                );
                self.sys
                    .process(pid)
                    .map(|p| p.memory() / (1024 * 1024))
                    .unwrap_or(0)
            }
            None => 0,
        };

        let total_memory = self.sys.total_memory();
        let memory_used_percent = if total_memory > 0 {
            (self.sys.used_memory() as f64 / total_memory as f64 * 100.0) as f32
        } else {
            0.0
        };

        SystemSample {
            memory_rss_mb,
            memory_used_percent,
            cpu_usage_percent: self.sys.global_cpu_usage(),
        }
    }
}

/// Current wall-clock time in milliseconds
pub fn unix_timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_metrics_json_fields() {
        let metrics = HealthMetrics {
            uptime_secs: 3600,
            memory_rss_mb: 412,
            connection_connected: true,
            connection_latency_ms: Some(42),
            streaming: true,
            ..Default::default()
        };

        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["uptime_secs"], 3600);
        assert_eq!(json["memory_rss_mb"], 412);
        assert_eq!(json["connection_latency_ms"], 42);
        assert_eq!(json["streaming"], true);
        assert_eq!(json["voice_connected"], false);
        assert!(json.get("timestamp_unix_ms").is_some());
    }

    #[test]
    fn test_sampler_reports_own_process() {
        let mut sampler = SystemSampler::new();
        let sample = sampler.sample();
        assert!(sample.memory_rss_mb < 1024 * 1024);
        assert!((0.0..=100.0).contains(&sample.memory_used_percent));
    }

    #[test]
    fn test_unix_timestamp_ms() {
        // after Jan 1, 2020
        assert!(unix_timestamp_ms() > 1577836800000);
    }
}
