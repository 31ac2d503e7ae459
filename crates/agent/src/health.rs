//! Composite health checks.
//!
//! The monitor samples process, connection and switcher state on the metrics
//! tick and derives a pass/warn/fail verdict per check on the health tick.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::Config;
use crate::connection::ConnectionState;
use crate::metrics::{unix_timestamp_ms, HealthMetrics, SystemSample};
use crate::quality::{QualityStatus, StreamHealthStatus};
use crate::switcher::SwitcherStatus;

const HISTORY_LIMIT: usize = 50;
const LATENCY_WARNING_MS: u64 = 1000;

pub const CHECK_CONNECTION: &str = "connection";
pub const CHECK_VOICE: &str = "voice";
pub const CHECK_MEMORY: &str = "memory";
pub const CHECK_STREAM: &str = "stream";
pub const CHECK_ENCODER: &str = "encoder";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub status: CheckStatus,
    pub message: String,
}

impl CheckOutcome {
    fn pass(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Pass,
            message: message.into(),
        }
    }

    fn warn(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Warn,
            message: message.into(),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Fail,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: OverallStatus,
    pub checks: BTreeMap<String, CheckOutcome>,
    pub timestamp_unix_ms: i64,
}

impl HealthCheckResult {
    /// Any fail is unhealthy, otherwise any warn is degraded.
    pub fn from_checks(checks: BTreeMap<String, CheckOutcome>) -> Self {
        let status = if checks.values().any(|c| c.status == CheckStatus::Fail) {
            OverallStatus::Unhealthy
        } else if checks.values().any(|c| c.status == CheckStatus::Warn) {
            OverallStatus::Degraded
        } else {
            OverallStatus::Healthy
        };
        Self {
            status,
            checks,
            timestamp_unix_ms: unix_timestamp_ms(),
        }
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &str> {
        self.checks
            .iter()
            .filter(|(_, c)| c.status == CheckStatus::Fail)
            .map(|(name, _)| name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    pub memory_warning_mb: u64,
    pub memory_critical_mb: u64,
    pub stream_grace: Duration,
    /// `is_healthy` turns false at this many recorded errors.
    pub error_ceiling: u64,
    /// `is_live` turns false at this many consecutive errors.
    pub critical_error_threshold: u32,
}

impl HealthThresholds {
    pub fn from_config(config: &Config) -> Self {
        Self {
            memory_warning_mb: config.health.memory_warning_mb,
            memory_critical_mb: config.health.memory_critical_mb,
            stream_grace: Duration::from_secs(config.health.stream_grace_secs),
            error_ceiling: config.health.error_ceiling,
            critical_error_threshold: config.recovery.critical_error_threshold,
        }
    }
}

pub struct HealthMonitor {
    thresholds: HealthThresholds,
    started_at: Instant,
    metrics: HealthMetrics,
    /// Start of the live session, if there is one.
    session_started: Option<Instant>,
    /// The session's source finished and its encoder exited cleanly.
    stream_ended: bool,
    consecutive_errors: u32,
    last_result: Option<HealthCheckResult>,
    history: VecDeque<HealthCheckResult>,
    events: broadcast::Sender<HealthCheckResult>,
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds, started_at: Instant) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            thresholds,
            started_at,
            metrics: HealthMetrics::default(),
            session_started: None,
            stream_ended: false,
            consecutive_errors: 0,
            last_result: None,
            history: VecDeque::new(),
            events,
        }
    }

    /// Completed health checks, one per health tick.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthCheckResult> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> &HealthMetrics {
        &self.metrics
    }

    pub fn last_result(&self) -> Option<&HealthCheckResult> {
        self.last_result.as_ref()
    }

    pub fn history(&self) -> impl Iterator<Item = &HealthCheckResult> {
        self.history.iter()
    }

    /// Keep only the most recent check.
    pub fn trim_history(&mut self) {
        let keep = self.history.len().saturating_sub(1);
        self.history.drain(..keep);
    }

    pub fn uptime(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn record_error(&mut self) {
        self.metrics.error_count += 1;
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
    }

    pub fn record_warning(&mut self) {
        self.metrics.warning_count += 1;
    }

    /// Take a fresh snapshot.
    ///
    /// `voice_healthy` is the connection layer's own verdict on the voice
    /// session. Streaming means that verdict holds and an encoder is running.
    pub fn sample(
        &mut self,
        system: SystemSample,
        connection: ConnectionState,
        voice_healthy: bool,
        switcher: &SwitcherStatus,
        now: Instant,
    ) -> &HealthMetrics {
        self.session_started = switcher
            .session
            .as_ref()
            .filter(|_| switcher.has_active_session())
            .map(|s| s.started_at);
        self.stream_ended = switcher.session.is_some() && switcher.ended;

        let m = &mut self.metrics;
        m.uptime_secs = now.saturating_duration_since(self.started_at).as_secs();
        m.memory_rss_mb = system.memory_rss_mb;
        m.memory_used_percent = system.memory_used_percent;
        m.cpu_usage_percent = system.cpu_usage_percent;
        m.connection_connected = connection.connected;
        m.connection_ready = connection.ready;
        m.connection_latency_ms = connection.latency_ms;
        m.voice_connected = voice_healthy;
        m.encoder_running = switcher.encoder_running;
        m.streaming = voice_healthy && switcher.encoder_running;
        m.timestamp_unix_ms = unix_timestamp_ms();
        &self.metrics
    }

    /// Run every check against the latest snapshot.
    pub fn perform_health_check(
        &mut self,
        quality: Option<&StreamHealthStatus>,
        now: Instant,
    ) -> HealthCheckResult {
        let in_grace = self
            .session_started
            .map_or(false, |t| now.saturating_duration_since(t) < self.thresholds.stream_grace);

        let mut checks = BTreeMap::new();
        checks.insert(CHECK_CONNECTION.to_string(), self.check_connection());
        checks.insert(CHECK_VOICE.to_string(), self.check_voice());
        checks.insert(CHECK_MEMORY.to_string(), self.check_memory());
        if self.metrics.streaming {
            checks.insert(CHECK_STREAM.to_string(), check_stream(quality, in_grace));
        }
        checks.insert(CHECK_ENCODER.to_string(), self.check_encoder(in_grace));

        let result = HealthCheckResult::from_checks(checks);
        if result.status == OverallStatus::Healthy {
            self.consecutive_errors = 0;
        }
        debug!(status = ?result.status, "health check completed");

        self.history.push_back(result.clone());
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.last_result = Some(result.clone());
        let _ = self.events.send(result.clone());
        result
    }

    /// Connection up, errors under the ceiling, memory under the hard cap.
    pub fn is_healthy(&self) -> bool {
        self.metrics.connection_connected
            && self.metrics.error_count < self.thresholds.error_ceiling
            && self.metrics.memory_rss_mb < self.thresholds.memory_critical_mb
    }

    pub fn is_ready(&self) -> bool {
        self.metrics.connection_ready
    }

    pub fn is_live(&self) -> bool {
        self.is_ready() && !self.critical_condition()
    }

    fn critical_condition(&self) -> bool {
        self.metrics.memory_rss_mb >= self.thresholds.memory_critical_mb
            || self.consecutive_errors >= self.thresholds.critical_error_threshold
    }

    fn check_connection(&self) -> CheckOutcome {
        let m = &self.metrics;
        if !m.connection_connected {
            return CheckOutcome::fail("not connected");
        }
        if !m.connection_ready {
            return CheckOutcome::warn("connected, handshake incomplete");
        }
        match m.connection_latency_ms {
            Some(latency) if latency > LATENCY_WARNING_MS => {
                CheckOutcome::warn(format!("high latency: {}ms", latency))
            }
            Some(latency) => CheckOutcome::pass(format!("connected ({}ms)", latency)),
            None => CheckOutcome::pass("connected"),
        }
    }

    fn check_voice(&self) -> CheckOutcome {
        if self.metrics.voice_connected {
            CheckOutcome::pass("voice session ready")
        } else if self.session_started.is_some() {
            CheckOutcome::fail("stream live without a usable voice session")
        } else {
            CheckOutcome::warn("no voice session")
        }
    }

    fn check_memory(&self) -> CheckOutcome {
        let rss = self.metrics.memory_rss_mb;
        if rss >= self.thresholds.memory_critical_mb {
            CheckOutcome::fail(format!("memory critical: {}MB", rss))
        } else if rss >= self.thresholds.memory_warning_mb {
            CheckOutcome::warn(format!("memory high: {}MB", rss))
        } else {
            CheckOutcome::pass(format!("{}MB", rss))
        }
    }

    fn check_encoder(&self, in_grace: bool) -> CheckOutcome {
        if self.stream_ended && !self.metrics.encoder_running {
            return CheckOutcome::pass("stream ended");
        }
        match (self.session_started.is_some(), self.metrics.encoder_running) {
            (_, true) => CheckOutcome::pass("encoder running"),
            (false, false) => CheckOutcome::pass("idle"),
            (true, false) if in_grace => CheckOutcome::warn("encoder not running yet"),
            (true, false) => CheckOutcome::fail("encoder not running for live session"),
        }
    }
}

fn check_stream(quality: Option<&StreamHealthStatus>, in_grace: bool) -> CheckOutcome {
    if in_grace {
        return CheckOutcome::pass("stream starting");
    }
    match quality {
        None => CheckOutcome::pass("no quality data yet"),
        Some(q) => match q.status {
            QualityStatus::Critical => {
                CheckOutcome::fail(format!("stream quality critical (score {})", q.score))
            }
            QualityStatus::Poor | QualityStatus::Degraded => {
                CheckOutcome::warn(format!("stream quality {:?} (score {})", q.status, q.score))
            }
            QualityStatus::Good | QualityStatus::Excellent => {
                CheckOutcome::pass(format!("score {}", q.score))
            }
        },
    }
}
