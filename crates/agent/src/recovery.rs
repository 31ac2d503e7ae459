//! Automatic recovery.
//!
//! Maps health, quality and connection signals to a fixed catalog of
//! recovery actions and executes them under per-action cooldowns, per-incident
//! retry limits and a rolling hourly rate limit. Only one batch runs at a
//! time; a request arriving mid-batch is dropped. Repeated fully-failed
//! batches are fatal so an outside supervisor can restart the agent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, RecoveryActionsConfig};
use crate::connection::ConnectionEvent;
use crate::health::{
    HealthCheckResult, OverallStatus, CHECK_CONNECTION, CHECK_ENCODER, CHECK_MEMORY, CHECK_STREAM,
    CHECK_VOICE,
};
use crate::metrics::{unix_timestamp_ms, HealthMetrics};
use crate::quality::QualityEvent;

const HISTORY_LIMIT: usize = 100;
const ROLLING_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    ReconnectConnection,
    ReconnectVoice,
    RestartStream,
    MemoryCleanup,
    RestartEncoder,
    NetworkReset,
}

impl ActionKind {
    pub const ALL: [ActionKind; 6] = [
        ActionKind::ReconnectConnection,
        ActionKind::ReconnectVoice,
        ActionKind::RestartStream,
        ActionKind::MemoryCleanup,
        ActionKind::RestartEncoder,
        ActionKind::NetworkReset,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ActionKind::ReconnectConnection => "reconnect-connection",
            ActionKind::ReconnectVoice => "reconnect-voice",
            ActionKind::RestartStream => "restart-stream",
            ActionKind::MemoryCleanup => "memory-cleanup",
            ActionKind::RestartEncoder => "restart-encoder",
            ActionKind::NetworkReset => "network-reset",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Connection-level reconnects run even inside a stream's grace window.
    pub fn is_connection_level(self) -> bool {
        matches!(
            self,
            ActionKind::ReconnectConnection | ActionKind::ReconnectVoice
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryAction {
    pub kind: ActionKind,
    pub severity: Severity,
    #[serde(rename = "cooldown_ms", serialize_with = "serialize_millis")]
    pub cooldown: Duration,
    /// Failures tolerated per incident before the action is given up on.
    pub max_retries: u32,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

pub fn default_catalog() -> Vec<RecoveryAction> {
    let entry = |kind, severity, cooldown_secs, max_retries| RecoveryAction {
        kind,
        severity,
        cooldown: Duration::from_secs(cooldown_secs),
        max_retries,
    };
    vec![
        entry(ActionKind::ReconnectConnection, Severity::Medium, 30, 3),
        entry(ActionKind::ReconnectVoice, Severity::Medium, 15, 5),
        entry(ActionKind::RestartStream, Severity::High, 60, 2),
        entry(ActionKind::MemoryCleanup, Severity::Low, 10, 10),
        entry(ActionKind::RestartEncoder, Severity::High, 30, 3),
        entry(ActionKind::NetworkReset, Severity::Critical, 120, 1),
    ]
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RecoveryError {
    #[error("recovery already in progress")]
    InProgress,

    #[error("automatic recovery is disabled")]
    Disabled,

    #[error("rate limited: {attempts} attempts in the last hour (max {max})")]
    RateLimited { attempts: usize, max: u32 },

    #[error("unknown recovery action: {0}")]
    UnknownAction(String),

    #[error("no recovery actions requested")]
    NothingRequested,

    #[error("action failed: {0}")]
    ActionFailed(String),

    #[error("recovery cancelled")]
    Cancelled,
}

/// Carries out recovery actions against the rest of the agent.
#[async_trait]
pub trait RecoveryEffects: Send + Sync {
    async fn execute(&self, action: ActionKind) -> Result<(), RecoveryError>;
}

/// Why the agent must exit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalReason {
    #[error("{consecutive_failures} consecutive recovery batches failed")]
    RecoveryExhausted { consecutive_failures: u32 },

    #[error("memory still critical after cleanup: {rss_mb}MB")]
    MemoryCritical { rss_mb: u64 },
}

pub type FatalHandler = Arc<dyn Fn(&FatalReason) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAttempt {
    pub action: ActionKind,
    pub timestamp_unix_ms: i64,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(skip)]
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SkipReason {
    Disabled,
    GracePeriod,
    Cooldown { remaining_ms: u64 },
    RetriesExhausted,
    RateLimited,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedAction {
    pub action: ActionKind,
    #[serde(flatten)]
    pub reason: SkipReason,
}

/// Result of one executed batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub attempts: Vec<RecoveryAttempt>,
    pub skipped: Vec<SkippedAction>,
}

impl RecoveryReport {
    pub fn any_success(&self) -> bool {
        self.attempts.iter().any(|a| a.success)
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryRequest {
    pub actions: Vec<ActionKind>,
    pub reason: String,
    /// Operator-triggered: skips cooldowns and the auto-recovery switch.
    pub manual: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStats {
    pub total_attempts: u64,
    pub successful_attempts: u64,
    pub failed_attempts: u64,
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub in_progress: bool,
    pub attempts_last_hour: usize,
    pub last_attempt_unix_ms: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryPolicy {
    pub enabled: bool,
    pub max_attempts_per_hour: u32,
    pub critical_error_threshold: u32,
    pub auto_restart_threshold: u32,
    pub action_delay: Duration,
    pub grace_period: Duration,
    pub memory_warning_mb: u64,
    pub memory_critical_mb: u64,
    pub actions: RecoveryActionsConfig,
}

impl RecoveryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enabled: config.recovery.enabled,
            max_attempts_per_hour: config.recovery.max_retries_per_hour,
            critical_error_threshold: config.recovery.critical_error_threshold,
            auto_restart_threshold: config.recovery.auto_restart_threshold,
            action_delay: Duration::from_millis(config.recovery.action_delay_ms),
            grace_period: Duration::from_secs(config.recovery.grace_period_secs),
            memory_warning_mb: config.health.memory_warning_mb,
            memory_critical_mb: config.health.memory_critical_mb,
            actions: config.recovery.actions.clone(),
        }
    }
}

#[derive(Default)]
struct State {
    last_run: HashMap<ActionKind, Instant>,
    last_run_unix_ms: BTreeMap<String, i64>,
    /// Failures per action in the current incident.
    failures: HashMap<ActionKind, u32>,
    recent: VecDeque<Instant>,
    history: VecDeque<RecoveryAttempt>,
    consecutive_failures: u32,
    total: u64,
    successful: u64,
    stream_started: Option<Instant>,
    memory_critical: bool,
    cleaned_while_critical: bool,
}

impl State {
    fn prune(&mut self, now: Instant) {
        while let Some(at) = self.recent.front() {
            if now.saturating_duration_since(*at) >= ROLLING_WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    fn record(&mut self, attempt: &RecoveryAttempt) {
        self.last_run.insert(attempt.action, attempt.at);
        self.last_run_unix_ms
            .insert(attempt.action.to_string(), attempt.timestamp_unix_ms);
        self.recent.push_back(attempt.at);
        self.total += 1;
        if attempt.success {
            self.successful += 1;
            self.failures.remove(&attempt.action);
        } else {
            *self.failures.entry(attempt.action).or_insert(0) += 1;
        }
        if attempt.action == ActionKind::MemoryCleanup && self.memory_critical {
            self.cleaned_while_critical = true;
        }
        self.history.push_back(attempt.clone());
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }
}

/// Clears the in-progress flag when a batch ends, however it ends.
struct BatchGuard<'a>(&'a AtomicBool);

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct AutoRecoverySystem {
    policy: RecoveryPolicy,
    catalog: HashMap<ActionKind, RecoveryAction>,
    effects: Arc<dyn RecoveryEffects>,
    on_fatal: FatalHandler,
    in_progress: AtomicBool,
    state: Mutex<State>,
}

impl AutoRecoverySystem {
    pub fn new(
        policy: RecoveryPolicy,
        effects: Arc<dyn RecoveryEffects>,
        on_fatal: FatalHandler,
    ) -> Self {
        Self::with_catalog(policy, default_catalog(), effects, on_fatal)
    }

    pub fn with_catalog(
        policy: RecoveryPolicy,
        catalog: Vec<RecoveryAction>,
        effects: Arc<dyn RecoveryEffects>,
        on_fatal: FatalHandler,
    ) -> Self {
        Self {
            policy,
            catalog: catalog.into_iter().map(|a| (a.kind, a)).collect(),
            effects,
            on_fatal,
            in_progress: AtomicBool::new(false),
            state: Mutex::new(State::default()),
        }
    }

    pub fn catalog(&self) -> Vec<RecoveryAction> {
        let mut actions: Vec<_> = self.catalog.values().cloned().collect();
        actions.sort_by_key(|a| a.kind);
        actions
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A stream (re)started; opens its grace window.
    pub fn note_stream_started(&self, at: Instant) {
        self.lock().stream_started = Some(at);
    }

    /// The problem that caused the current failures is gone.
    pub fn resolve_incident(&self) {
        let mut state = self.lock();
        if !state.failures.is_empty() {
            debug!("recovery incident resolved");
            state.failures.clear();
        }
    }

    pub fn stats(&self, now: Instant) -> RecoveryStats {
        let mut state = self.lock();
        state.prune(now);
        let failed = state.total - state.successful;
        RecoveryStats {
            total_attempts: state.total,
            successful_attempts: state.successful,
            failed_attempts: failed,
            success_rate: if state.total > 0 {
                state.successful as f64 / state.total as f64
            } else {
                1.0
            },
            consecutive_failures: state.consecutive_failures,
            in_progress: self.is_in_progress(),
            attempts_last_hour: state.recent.len(),
            last_attempt_unix_ms: state.last_run_unix_ms.clone(),
        }
    }

    /// Most recent attempts, newest last.
    pub fn history(&self, limit: usize) -> Vec<RecoveryAttempt> {
        let state = self.lock();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    /// Drop attempt history; rate-limit accounting is kept.
    pub fn trim_history(&self) {
        self.lock().history.clear();
    }

    /// Operator trigger by action name. Cooldowns do not apply.
    pub async fn trigger(
        &self,
        names: &[String],
        now: Instant,
        cancel: &CancellationToken,
    ) -> Result<RecoveryReport, RecoveryError> {
        let actions = names
            .iter()
            .map(|name| {
                ActionKind::from_name(name).ok_or_else(|| RecoveryError::UnknownAction(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if actions.is_empty() {
            return Err(RecoveryError::NothingRequested);
        }
        self.execute(
            RecoveryRequest {
                actions,
                reason: "manual trigger".to_string(),
                manual: true,
            },
            now,
            cancel,
        )
        .await
    }

    /// React to a completed health check.
    ///
    /// Returns `None` when nothing needed doing.
    pub async fn handle_health_check(
        &self,
        result: &HealthCheckResult,
        metrics: &HealthMetrics,
        consecutive_errors: u32,
        now: Instant,
        cancel: &CancellationToken,
    ) -> Option<Result<RecoveryReport, RecoveryError>> {
        if result.status == OverallStatus::Healthy {
            self.resolve_incident();
        }

        let mut actions = Vec::new();
        for (check, action) in [
            (CHECK_CONNECTION, ActionKind::ReconnectConnection),
            (CHECK_VOICE, ActionKind::ReconnectVoice),
            (CHECK_MEMORY, ActionKind::MemoryCleanup),
            (CHECK_STREAM, ActionKind::RestartStream),
            (CHECK_ENCODER, ActionKind::RestartEncoder),
        ] {
            if result.failed_checks().any(|failed| failed == check) {
                actions.push(action);
            }
        }

        if consecutive_errors >= self.policy.critical_error_threshold {
            warn!(consecutive_errors, "critical error threshold reached");
            actions.push(ActionKind::RestartEncoder);
            actions.push(ActionKind::NetworkReset);
        }

        let rss = metrics.memory_rss_mb;
        let fatal = {
            let mut state = self.lock();
            if rss >= self.policy.memory_critical_mb {
                let exhausted = state.cleaned_while_critical;
                state.memory_critical = true;
                exhausted
            } else {
                state.memory_critical = false;
                state.cleaned_while_critical = false;
                false
            }
        };
        if fatal {
            self.escalate(FatalReason::MemoryCritical { rss_mb: rss });
            return None;
        }
        if rss >= self.policy.memory_warning_mb {
            actions.push(ActionKind::MemoryCleanup);
        }

        if actions.is_empty() {
            return None;
        }
        let reason = format!(
            "health check {:?}: {}",
            result.status,
            result.failed_checks().collect::<Vec<_>>().join(", ")
        );
        Some(
            self.execute(
                RecoveryRequest {
                    actions,
                    reason,
                    manual: false,
                },
                now,
                cancel,
            )
            .await,
        )
    }

    pub async fn handle_connection_event(
        &self,
        event: ConnectionEvent,
        now: Instant,
        cancel: &CancellationToken,
    ) -> Option<Result<RecoveryReport, RecoveryError>> {
        let action = match event {
            ConnectionEvent::Disconnected => ActionKind::ReconnectConnection,
            ConnectionEvent::VoiceDisconnected => ActionKind::ReconnectVoice,
            ConnectionEvent::Reconnected => return None,
        };
        Some(
            self.execute(
                RecoveryRequest {
                    actions: vec![action],
                    reason: format!("connection event {:?}", event),
                    manual: false,
                },
                now,
                cancel,
            )
            .await,
        )
    }

    pub async fn handle_quality_event(
        &self,
        event: &QualityEvent,
        now: Instant,
        cancel: &CancellationToken,
    ) -> Option<Result<RecoveryReport, RecoveryError>> {
        let QualityEvent::Alert { session_id, health } = event else {
            return None;
        };
        Some(
            self.execute(
                RecoveryRequest {
                    actions: vec![ActionKind::RestartEncoder],
                    reason: format!(
                        "quality alert for {}: {:?} (score {})",
                        session_id, health.status, health.score
                    ),
                    manual: false,
                },
                now,
                cancel,
            )
            .await,
        )
    }

    /// Run one batch of actions in order.
    pub async fn execute(
        &self,
        request: RecoveryRequest,
        now: Instant,
        cancel: &CancellationToken,
    ) -> Result<RecoveryReport, RecoveryError> {
        if !self.policy.enabled && !request.manual {
            return Err(RecoveryError::Disabled);
        }
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(reason = %request.reason, "recovery in progress, dropping request");
            return Err(RecoveryError::InProgress);
        }
        let _batch = BatchGuard(&self.in_progress);

        let max = self.policy.max_attempts_per_hour;
        {
            let mut state = self.lock();
            state.prune(now);
            if state.recent.len() >= max as usize {
                warn!(
                    attempts = state.recent.len(),
                    max, "recovery rate limit reached, rejecting request"
                );
                return Err(RecoveryError::RateLimited {
                    attempts: state.recent.len(),
                    max,
                });
            }
        }

        let mut actions = request.actions.clone();
        let mut seen = std::collections::HashSet::new();
        actions.retain(|a| seen.insert(*a));

        info!(reason = %request.reason, actions = ?actions, "starting recovery");
        let mut report = RecoveryReport::default();
        let mut first_started: Option<Instant> = None;

        for kind in actions {
            if let Some(reason) = self.gate(kind, &request, now) {
                debug!(action = %kind, ?reason, "recovery action skipped");
                report.skipped.push(SkippedAction {
                    action: kind,
                    reason,
                });
                continue;
            }

            if !report.attempts.is_empty() && !self.policy.action_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RecoveryError::Cancelled),
                    _ = tokio::time::sleep(self.policy.action_delay) => {}
                }
            }

            // the first action runs at `now`; later ones are offset by the time spent since
            let started = Instant::now();
            let at = now + started.saturating_duration_since(*first_started.get_or_insert(started));
            let timestamp_unix_ms = unix_timestamp_ms();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(RecoveryError::Cancelled),
                outcome = self.effects.execute(kind) => outcome,
            };
            let attempt = RecoveryAttempt {
                action: kind,
                timestamp_unix_ms,
                success: outcome.is_ok(),
                error: outcome.as_ref().err().map(|e| e.to_string()),
                duration_ms: started.elapsed().as_millis() as u64,
                at,
            };
            match &attempt.error {
                None => info!(action = %kind, duration_ms = attempt.duration_ms, "recovery action succeeded"),
                Some(e) => warn!(action = %kind, "recovery action failed: {}", e),
            }
            self.lock().record(&attempt);
            report.attempts.push(attempt);
        }

        if !report.attempts.is_empty() {
            let consecutive = {
                let mut state = self.lock();
                if report.any_success() {
                    state.consecutive_failures = state.consecutive_failures.saturating_sub(1);
                } else {
                    state.consecutive_failures += 1;
                }
                state.consecutive_failures
            };
            if consecutive >= self.policy.auto_restart_threshold {
                self.escalate(FatalReason::RecoveryExhausted {
                    consecutive_failures: consecutive,
                });
            }
        }

        Ok(report)
    }

    /// Why `kind` must not run now, if anything.
    fn gate(&self, kind: ActionKind, request: &RecoveryRequest, now: Instant) -> Option<SkipReason> {
        if !self.policy.actions.is_enabled(kind.name()) {
            return Some(SkipReason::Disabled);
        }
        let Some(action) = self.catalog.get(&kind) else {
            return Some(SkipReason::Disabled);
        };
        let state = self.lock();

        if !request.manual && !kind.is_connection_level() {
            if let Some(started) = state.stream_started {
                if now.saturating_duration_since(started) < self.policy.grace_period {
                    return Some(SkipReason::GracePeriod);
                }
            }
        }
        if !request.manual {
            if let Some(last) = state.last_run.get(&kind) {
                let elapsed = now.saturating_duration_since(*last);
                if elapsed < action.cooldown {
                    return Some(SkipReason::Cooldown {
                        remaining_ms: (action.cooldown - elapsed).as_millis() as u64,
                    });
                }
            }
        }
        if state.failures.get(&kind).copied().unwrap_or(0) >= action.max_retries {
            return Some(SkipReason::RetriesExhausted);
        }
        if state.recent.len() >= self.policy.max_attempts_per_hour as usize {
            return Some(SkipReason::RateLimited);
        }
        None
    }

    fn escalate(&self, reason: FatalReason) {
        error!("fatal condition: {}", reason);
        (self.on_fatal)(&reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{CheckOutcome, CheckStatus};
    use crate::quality::{QualityStatus, SessionPhase, StreamHealthStatus};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct MockEffects {
        executed: Mutex<Vec<ActionKind>>,
        failing: Mutex<HashSet<ActionKind>>,
        gate: Option<Arc<Notify>>,
    }

    impl MockEffects {
        fn failing(actions: &[ActionKind]) -> Self {
            Self {
                failing: Mutex::new(actions.iter().copied().collect()),
                ..Default::default()
            }
        }

        fn executed(&self) -> Vec<ActionKind> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RecoveryEffects for MockEffects {
        async fn execute(&self, action: ActionKind) -> Result<(), RecoveryError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.executed.lock().unwrap().push(action);
            if self.failing.lock().unwrap().contains(&action) {
                Err(RecoveryError::ActionFailed(format!("{} failed", action)))
            } else {
                Ok(())
            }
        }
    }

    fn policy() -> RecoveryPolicy {
        RecoveryPolicy {
            enabled: true,
            max_attempts_per_hour: 10,
            critical_error_threshold: 5,
            auto_restart_threshold: 3,
            action_delay: Duration::ZERO,
            grace_period: Duration::from_secs(30),
            memory_warning_mb: 1536,
            memory_critical_mb: 2560,
            actions: RecoveryActionsConfig::default(),
        }
    }

    /// Catalog without cooldowns so consecutive batches are not throttled.
    fn no_cooldown_catalog() -> Vec<RecoveryAction> {
        default_catalog()
            .into_iter()
            .map(|a| RecoveryAction {
                cooldown: Duration::ZERO,
                max_retries: 100,
                ..a
            })
            .collect()
    }

    fn fatal_counter() -> (FatalHandler, Arc<AtomicU32>) {
        let count = Arc::new(AtomicU32::new(0));
        let handler_count = count.clone();
        let handler: FatalHandler = Arc::new(move |_reason: &FatalReason| {
            handler_count.fetch_add(1, Ordering::SeqCst);
        });
        (handler, count)
    }

    fn request(actions: &[ActionKind]) -> RecoveryRequest {
        RecoveryRequest {
            actions: actions.to_vec(),
            reason: "test".to_string(),
            manual: false,
        }
    }

    fn check_result(failed: &[&str]) -> HealthCheckResult {
        let checks = [CHECK_CONNECTION, CHECK_VOICE, CHECK_MEMORY, CHECK_ENCODER]
            .into_iter()
            .map(|name| {
                let status = if failed.contains(&name) {
                    CheckStatus::Fail
                } else {
                    CheckStatus::Pass
                };
                (
                    name.to_string(),
                    CheckOutcome {
                        status,
                        message: String::new(),
                    },
                )
            })
            .collect();
        HealthCheckResult::from_checks(checks)
    }

    fn metrics(rss: u64) -> HealthMetrics {
        HealthMetrics {
            memory_rss_mb: rss,
            ..Default::default()
        }
    }

    #[test]
    fn test_catalog_reference_values() {
        let catalog = default_catalog();
        assert_eq!(catalog.len(), 6);
        let network = catalog
            .iter()
            .find(|a| a.kind == ActionKind::NetworkReset)
            .unwrap();
        assert_eq!(network.severity, Severity::Critical);
        assert_eq!(network.cooldown, Duration::from_secs(120));
        assert_eq!(network.max_retries, 1);

        for kind in ActionKind::ALL {
            assert_eq!(ActionKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ActionKind::from_name("reboot"), None);
    }

    #[tokio::test]
    async fn test_eleventh_attempt_in_an_hour_is_rejected() {
        let effects = Arc::new(MockEffects::default());
        let (on_fatal, _) = fatal_counter();
        let recovery =
            AutoRecoverySystem::with_catalog(policy(), no_cooldown_catalog(), effects.clone(), on_fatal);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        for i in 0..10u64 {
            let now = start + Duration::from_secs(i * 60);
            let report = recovery
                .execute(request(&[ActionKind::RestartEncoder]), now, &cancel)
                .await
                .unwrap();
            assert_eq!(report.attempts.len(), 1);
        }

        let err = recovery
            .execute(
                request(&[ActionKind::RestartEncoder]),
                start + Duration::from_secs(600),
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err, RecoveryError::RateLimited { attempts: 10, max: 10 });
        assert_eq!(effects.executed().len(), 10);

        // the first attempt has aged out of the window
        let later = start + Duration::from_secs(3600);
        assert!(recovery
            .execute(request(&[ActionKind::RestartEncoder]), later, &cancel)
            .await
            .is_ok());
        assert_eq!(recovery.stats(later).attempts_last_hour, 10);
    }

    #[tokio::test]
    async fn test_three_failed_batches_are_fatal_two_are_not() {
        let effects = Arc::new(MockEffects::failing(&[ActionKind::RestartEncoder]));
        let (on_fatal, fatal) = fatal_counter();
        let recovery =
            AutoRecoverySystem::with_catalog(policy(), no_cooldown_catalog(), effects, on_fatal);
        let cancel = CancellationToken::new();
        let now = Instant::now();

        for _ in 0..2 {
            let report = recovery
                .execute(request(&[ActionKind::RestartEncoder]), now, &cancel)
                .await
                .unwrap();
            assert!(!report.any_success());
        }
        assert_eq!(fatal.load(Ordering::SeqCst), 0);
        assert_eq!(recovery.stats(now).consecutive_failures, 2);

        recovery
            .execute(request(&[ActionKind::RestartEncoder]), now, &cancel)
            .await
            .unwrap();
        assert_eq!(fatal.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_partial_success_decrements_consecutive_failures() {
        let effects = Arc::new(MockEffects::failing(&[ActionKind::RestartEncoder]));
        let (on_fatal, fatal) = fatal_counter();
        let recovery =
            AutoRecoverySystem::with_catalog(policy(), no_cooldown_catalog(), effects, on_fatal);
        let cancel = CancellationToken::new();
        let now = Instant::now();

        for _ in 0..2 {
            recovery
                .execute(request(&[ActionKind::RestartEncoder]), now, &cancel)
                .await
                .unwrap();
        }
        let report = recovery
            .execute(
                request(&[ActionKind::RestartEncoder, ActionKind::ReconnectVoice]),
                now,
                &cancel,
            )
            .await
            .unwrap();
        assert!(report.any_success());
        assert_eq!(recovery.stats(now).consecutive_failures, 1);

        // bounded at zero
        for _ in 0..3 {
            recovery
                .execute(request(&[ActionKind::ReconnectVoice]), now, &cancel)
                .await
                .unwrap();
        }
        assert_eq!(recovery.stats(now).consecutive_failures, 0);
        assert_eq!(fatal.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_attempts_are_stamped_when_they_run() {
        let effects = Arc::new(MockEffects::default());
        let (on_fatal, _) = fatal_counter();
        let policy = RecoveryPolicy {
            action_delay: Duration::from_millis(50),
            ..policy()
        };
        let recovery =
            AutoRecoverySystem::with_catalog(policy, no_cooldown_catalog(), effects, on_fatal);
        let now = Instant::now();

        let report = recovery
            .execute(
                request(&[ActionKind::ReconnectConnection, ActionKind::RestartEncoder]),
                now,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let [first, second] = &report.attempts[..] else {
            panic!("expected two attempts, got {:?}", report.attempts);
        };
        assert_eq!(first.at, now);
        assert!(second.at >= first.at + Duration::from_millis(50));
        assert!(second.timestamp_unix_ms >= first.timestamp_unix_ms + 50);
    }

    #[tokio::test]
    async fn test_cooldown_skips_unless_manual() {
        let effects = Arc::new(MockEffects::default());
        let (on_fatal, _) = fatal_counter();
        let recovery = AutoRecoverySystem::new(policy(), effects.clone(), on_fatal);
        let cancel = CancellationToken::new();
        let t0 = Instant::now();

        recovery
            .execute(request(&[ActionKind::ReconnectVoice]), t0, &cancel)
            .await
            .unwrap();
        let report = recovery
            .execute(
                request(&[ActionKind::ReconnectVoice]),
                t0 + Duration::from_secs(5),
                &cancel,
            )
            .await
            .unwrap();
        assert!(report.attempts.is_empty());
        assert!(matches!(
            report.skipped[0].reason,
            SkipReason::Cooldown { remaining_ms: 10_000 }
        ));

        let report = recovery
            .trigger(
                &["reconnect-voice".to_string()],
                t0 + Duration::from_secs(5),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(report.attempts.len(), 1);

        let report = recovery
            .execute(
                request(&[ActionKind::ReconnectVoice]),
                t0 + Duration::from_secs(21),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(effects.executed().len(), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_until_incident_resolved() {
        let effects = Arc::new(MockEffects::failing(&[ActionKind::RestartStream]));
        let (on_fatal, _) = fatal_counter();
        let catalog = no_cooldown_catalog()
            .into_iter()
            .map(|a| RecoveryAction {
                max_retries: if a.kind == ActionKind::RestartStream { 2 } else { a.max_retries },
                ..a
            })
            .collect();
        let mut policy = policy();
        policy.auto_restart_threshold = 100;
        let recovery = AutoRecoverySystem::with_catalog(policy, catalog, effects.clone(), on_fatal);
        let cancel = CancellationToken::new();
        let now = Instant::now();

        for _ in 0..2 {
            let report = recovery
                .execute(request(&[ActionKind::RestartStream]), now, &cancel)
                .await
                .unwrap();
            assert_eq!(report.attempts.len(), 1);
        }
        let report = recovery
            .execute(request(&[ActionKind::RestartStream]), now, &cancel)
            .await
            .unwrap();
        assert!(report.attempts.is_empty());
        assert_eq!(report.skipped[0].reason, SkipReason::RetriesExhausted);

        recovery.resolve_incident();
        let report = recovery
            .execute(request(&[ActionKind::RestartStream]), now, &cancel)
            .await
            .unwrap();
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(effects.executed().len(), 3);
    }

    #[tokio::test]
    async fn test_grace_period_allows_only_reconnects() {
        let effects = Arc::new(MockEffects::default());
        let (on_fatal, _) = fatal_counter();
        let recovery = AutoRecoverySystem::new(policy(), effects.clone(), on_fatal);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        recovery.note_stream_started(start);

        let report = recovery
            .execute(
                request(&[ActionKind::RestartEncoder, ActionKind::ReconnectConnection]),
                start + Duration::from_secs(10),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(effects.executed(), vec![ActionKind::ReconnectConnection]);
        assert_eq!(report.skipped[0].action, ActionKind::RestartEncoder);
        assert_eq!(report.skipped[0].reason, SkipReason::GracePeriod);

        let report = recovery
            .execute(
                request(&[ActionKind::RestartEncoder]),
                start + Duration::from_secs(31),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(report.attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_request_during_batch_is_dropped() {
        let gate = Arc::new(Notify::new());
        let effects = Arc::new(MockEffects {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let (on_fatal, _) = fatal_counter();
        let recovery = Arc::new(AutoRecoverySystem::new(policy(), effects.clone(), on_fatal));
        let now = Instant::now();

        let running = {
            let recovery = recovery.clone();
            tokio::spawn(async move {
                recovery
                    .execute(
                        request(&[ActionKind::RestartEncoder]),
                        now,
                        &CancellationToken::new(),
                    )
                    .await
            })
        };
        while !recovery.is_in_progress() {
            tokio::task::yield_now().await;
        }

        let err = recovery
            .execute(
                request(&[ActionKind::NetworkReset]),
                now,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, RecoveryError::InProgress);

        gate.notify_one();
        running.await.unwrap().unwrap();
        assert!(!recovery.is_in_progress());
        assert_eq!(effects.executed(), vec![ActionKind::RestartEncoder]);
    }

    #[tokio::test]
    async fn test_disabled_recovery_and_disabled_actions() {
        let effects = Arc::new(MockEffects::default());
        let (on_fatal, _) = fatal_counter();
        let mut disabled = policy();
        disabled.enabled = false;
        let recovery = AutoRecoverySystem::new(disabled, effects.clone(), on_fatal.clone());
        let cancel = CancellationToken::new();
        let now = Instant::now();

        assert_eq!(
            recovery
                .execute(request(&[ActionKind::RestartEncoder]), now, &cancel)
                .await
                .unwrap_err(),
            RecoveryError::Disabled
        );
        // an operator can still trigger actions
        assert!(recovery
            .trigger(&["restart-encoder".to_string()], now, &cancel)
            .await
            .is_ok());

        let mut policy = policy();
        policy.actions.network_reset = false;
        let recovery = AutoRecoverySystem::new(policy, effects.clone(), on_fatal);
        let report = recovery
            .execute(request(&[ActionKind::NetworkReset]), now, &cancel)
            .await
            .unwrap();
        assert_eq!(report.skipped[0].reason, SkipReason::Disabled);
        assert_eq!(effects.executed(), vec![ActionKind::RestartEncoder]);
    }

    #[tokio::test]
    async fn test_unknown_action_is_rejected() {
        let (on_fatal, _) = fatal_counter();
        let recovery = AutoRecoverySystem::new(policy(), Arc::new(MockEffects::default()), on_fatal);
        let err = recovery
            .trigger(
                &["restart-encoder".to_string(), "reboot-host".to_string()],
                Instant::now(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, RecoveryError::UnknownAction("reboot-host".to_string()));
    }

    #[tokio::test]
    async fn test_health_check_maps_failures_to_actions() {
        let effects = Arc::new(MockEffects::default());
        let (on_fatal, _) = fatal_counter();
        let recovery = AutoRecoverySystem::new(policy(), effects.clone(), on_fatal);
        let cancel = CancellationToken::new();
        let now = Instant::now();

        let result = check_result(&[CHECK_ENCODER, CHECK_CONNECTION]);
        let report = recovery
            .handle_health_check(&result, &metrics(200), 0, now, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.attempts.len(), 2);
        assert_eq!(
            effects.executed(),
            vec![ActionKind::ReconnectConnection, ActionKind::RestartEncoder]
        );

        // healthy and nothing to do
        let healthy = check_result(&[]);
        assert!(recovery
            .handle_health_check(&healthy, &metrics(200), 0, now, &cancel)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_finished_source_triggers_no_recovery() {
        use crate::connection::ConnectionState;
        use crate::health::{HealthMonitor, HealthThresholds};
        use crate::metrics::SystemSample;
        use crate::planner::EncodeProfile;
        use crate::switcher::{SessionInfo, SwitchState, SwitcherStatus};

        let effects = Arc::new(MockEffects::default());
        let (on_fatal, _) = fatal_counter();
        let recovery = AutoRecoverySystem::new(policy(), effects.clone(), on_fatal);
        let start = Instant::now();
        let now = start + Duration::from_secs(120);
        recovery.note_stream_started(start);

        let mut monitor = HealthMonitor::new(
            HealthThresholds {
                memory_warning_mb: 1536,
                memory_critical_mb: 2560,
                stream_grace: Duration::from_secs(60),
                error_ceiling: 50,
                critical_error_threshold: 5,
            },
            start,
        );
        // what the switcher publishes once a finite source's encoder exits with 0
        let finished = SwitcherStatus {
            state: SwitchState::Live,
            session: Some(SessionInfo {
                id: "s1".to_string(),
                source_url: "/media/clip.mkv".to_string(),
                profile: EncodeProfile {
                    width: 1280,
                    height: 720,
                    fps: 30,
                    bitrate_kbps: 2500,
                    max_bitrate_kbps: 3250,
                    codec: "h264".to_string(),
                    hardware_accel: false,
                },
                started_at_unix_ms: 0,
                started_at: start,
            }),
            pid: None,
            encoder_running: false,
            ended: true,
            draining: 0,
        };
        let system = SystemSample {
            memory_rss_mb: 200,
            memory_used_percent: 20.0,
            cpu_usage_percent: 5.0,
        };
        let connection = ConnectionState {
            connected: true,
            ready: true,
            latency_ms: Some(30),
        };
        monitor.sample(system, connection, true, &finished, now);
        let result = monitor.perform_health_check(None, now);

        let outcome = recovery
            .handle_health_check(
                &result,
                monitor.metrics(),
                monitor.consecutive_errors(),
                now,
                &CancellationToken::new(),
            )
            .await;
        assert!(outcome.is_none());
        assert!(effects.executed().is_empty());
    }

    #[tokio::test]
    async fn test_consecutive_errors_escalate_to_network_reset() {
        let effects = Arc::new(MockEffects::default());
        let (on_fatal, _) = fatal_counter();
        let recovery = AutoRecoverySystem::new(policy(), effects.clone(), on_fatal);

        recovery
            .handle_health_check(
                &check_result(&[]),
                &metrics(200),
                5,
                Instant::now(),
                &CancellationToken::new(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            effects.executed(),
            vec![ActionKind::RestartEncoder, ActionKind::NetworkReset]
        );
    }

    #[tokio::test]
    async fn test_memory_critical_after_cleanup_is_fatal() {
        let effects = Arc::new(MockEffects::default());
        let (on_fatal, fatal) = fatal_counter();
        let recovery = AutoRecoverySystem::new(policy(), effects.clone(), on_fatal);
        let cancel = CancellationToken::new();
        let t0 = Instant::now();

        // warning level: cleanup only
        recovery
            .handle_health_check(&check_result(&[]), &metrics(1600), 0, t0, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(effects.executed(), vec![ActionKind::MemoryCleanup]);

        // critical: one more cleanup first
        let t1 = t0 + Duration::from_secs(30);
        recovery
            .handle_health_check(&check_result(&[CHECK_MEMORY]), &metrics(2600), 0, t1, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(effects.executed().len(), 2);
        assert_eq!(fatal.load(Ordering::SeqCst), 0);

        // still critical after cleaning up
        let t2 = t1 + Duration::from_secs(30);
        assert!(recovery
            .handle_health_check(&check_result(&[CHECK_MEMORY]), &metrics(2700), 0, t2, &cancel)
            .await
            .is_none());
        assert_eq!(fatal.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connection_and_quality_events() {
        let effects = Arc::new(MockEffects::default());
        let (on_fatal, _) = fatal_counter();
        let recovery = AutoRecoverySystem::new(policy(), effects.clone(), on_fatal);
        let cancel = CancellationToken::new();
        let now = Instant::now();

        assert!(recovery
            .handle_connection_event(ConnectionEvent::Reconnected, now, &cancel)
            .await
            .is_none());
        recovery
            .handle_connection_event(ConnectionEvent::VoiceDisconnected, now, &cancel)
            .await
            .unwrap()
            .unwrap();

        let alert = QualityEvent::Alert {
            session_id: "s1".to_string(),
            health: StreamHealthStatus {
                status: QualityStatus::Critical,
                score: 12,
                phase: SessionPhase::Steady,
                issues: vec![],
                recommendations: vec![],
                timestamp_unix_ms: 0,
            },
        };
        recovery
            .handle_quality_event(&alert, now, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            effects.executed(),
            vec![ActionKind::ReconnectVoice, ActionKind::RestartEncoder]
        );

        let stats = recovery.stats(now);
        assert_eq!(stats.total_attempts, 2);
        assert_eq!(stats.successful_attempts, 2);
        assert_eq!(stats.success_rate, 1.0);
        assert!(stats.last_attempt_unix_ms.contains_key("restart-encoder"));
        assert_eq!(recovery.history(1)[0].action, ActionKind::RestartEncoder);
    }
}
