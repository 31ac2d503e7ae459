//! Agent runtime
//!
//! Builds the control plane from configuration and runs its periodic ticks,
//! event pumps and the HTTP server until shutdown.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analyzer::{SourceProber, StreamAnalyzer};
use crate::config::Config;
use crate::connection::{ConnectionEvent, ConnectionLayer};
use crate::encode::{EncoderLauncher, FfmpegLauncher};
use crate::health::{HealthCheckResult, HealthMonitor, HealthThresholds, OverallStatus};
use crate::metrics::SystemSampler;
use crate::planner::ProfileError;
use crate::quality::{QualityEvent, QualitySettings, StreamQualityMonitor};
use crate::recovery::{
    ActionKind, AutoRecoverySystem, FatalHandler, FatalReason, RecoveryEffects, RecoveryError,
    RecoveryPolicy, RecoveryReport,
};
use crate::server::{run_server, AppState, ServerError, SharedHealth, SharedQuality};
use crate::sink::{OutputTarget, SinkProvider};
use crate::startup::StartupError;
use crate::switcher::{StreamSwitcher, SwitchError, SwitcherEvent, SwitcherSettings};
use crate::telemetry::{parse_line, TelemetryLine};

/// Error type for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    /// Default encode profile is unusable
    #[error("Invalid encode profile: {0}")]
    Profile(#[from] ProfileError),

    #[error("Invalid listen address: {0}")]
    InvalidListen(String),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// The control plane gave up; the process should exit so a supervisor
    /// can restart it.
    #[error("Fatal condition: {0}")]
    Fatal(FatalReason),
}

/// Recovery actions carried out against the running agent.
struct AgentEffects {
    switcher: Arc<StreamSwitcher>,
    connection: Arc<dyn ConnectionLayer>,
    health: SharedHealth,
    quality: SharedQuality,
    shutdown: CancellationToken,
}

impl AgentEffects {
    fn switch_outcome<T>(action: ActionKind, result: Result<T, SwitchError>) -> Result<(), RecoveryError> {
        match result {
            Ok(_) => Ok(()),
            Err(SwitchError::NoSession) => {
                debug!(%action, "no live session, nothing to restart");
                Ok(())
            }
            Err(SwitchError::Cancelled) => Err(RecoveryError::Cancelled),
            Err(e) => Err(RecoveryError::ActionFailed(e.to_string())),
        }
    }
}

#[async_trait]
impl RecoveryEffects for AgentEffects {
    async fn execute(&self, action: ActionKind) -> Result<(), RecoveryError> {
        let failed = |e: crate::connection::ConnectionError| RecoveryError::ActionFailed(e.to_string());
        match action {
            ActionKind::ReconnectConnection => self.connection.reconnect().await.map_err(failed),
            ActionKind::ReconnectVoice => self.connection.reconnect_voice().await.map_err(failed),
            ActionKind::NetworkReset => self.connection.reset_network().await.map_err(failed),
            ActionKind::RestartEncoder => Self::switch_outcome(
                action,
                self.switcher
                    .restart_encoder(self.shutdown.child_token())
                    .await,
            ),
            ActionKind::RestartStream => Self::switch_outcome(
                action,
                self.switcher.restart_stream(self.shutdown.child_token()).await,
            ),
            ActionKind::MemoryCleanup => {
                self.health.write().await.trim_history();
                self.quality.write().await.trim_history();
                Ok(())
            }
        }
    }
}

fn log_recovery(trigger: &str, outcome: Option<Result<RecoveryReport, RecoveryError>>) {
    match outcome {
        None => {}
        Some(Ok(report)) if report.attempts.is_empty() => {
            debug!(trigger, skipped = report.skipped.len(), "recovery skipped");
        }
        Some(Ok(report)) => {
            let succeeded = report.attempts.iter().filter(|a| a.success).count();
            info!(
                trigger,
                executed = report.attempts.len(),
                succeeded,
                skipped = report.skipped.len(),
                "recovery batch finished"
            );
        }
        Some(Err(RecoveryError::InProgress | RecoveryError::Cancelled)) => {
            debug!(trigger, "recovery request dropped");
        }
        Some(Err(e)) => warn!(trigger, "recovery not run: {}", e),
    }
}

/// Agent state containing all runtime components
pub struct Agent {
    config: Config,
    switcher: Arc<StreamSwitcher>,
    health: SharedHealth,
    quality: SharedQuality,
    recovery: Arc<AutoRecoverySystem>,
    connection: Arc<dyn ConnectionLayer>,
    shutdown: CancellationToken,
    fatal: Arc<Mutex<Option<FatalReason>>>,
}

impl Agent {
    /// Build an agent that probes with ffprobe, encodes with ffmpeg and
    /// writes to the configured output target.
    pub fn new(config: Config, connection: Arc<dyn ConnectionLayer>) -> Result<Self, AgentError> {
        let prober = Arc::new(StreamAnalyzer::new(
            config.encoder.ffprobe_binary.clone(),
            Duration::from_secs(config.encoder.probe_timeout_secs),
        ));
        let launcher = Arc::new(FfmpegLauncher::new(config.encoder.ffmpeg_binary.clone()));
        let sinks = Arc::new(OutputTarget::parse(&config.encoder.output));
        Self::with_components(config, prober, launcher, sinks, connection)
    }

    /// Build an agent from explicit collaborators.
    pub fn with_components(
        config: Config,
        prober: Arc<dyn SourceProber>,
        launcher: Arc<dyn EncoderLauncher>,
        sinks: Arc<dyn SinkProvider>,
        connection: Arc<dyn ConnectionLayer>,
    ) -> Result<Self, AgentError> {
        let shutdown = CancellationToken::new();
        let switcher = Arc::new(StreamSwitcher::new(
            prober,
            launcher,
            sinks,
            SwitcherSettings::from_config(&config)?,
        ));
        let health = Arc::new(RwLock::new(HealthMonitor::new(
            HealthThresholds::from_config(&config),
            Instant::now(),
        )));
        let quality = Arc::new(RwLock::new(StreamQualityMonitor::new(
            QualitySettings::from_config(&config.monitoring),
        )));

        let fatal = Arc::new(Mutex::new(None));
        let on_fatal: FatalHandler = {
            let fatal = fatal.clone();
            let shutdown = shutdown.clone();
            Arc::new(move |reason: &FatalReason| {
                let mut slot = fatal.lock().unwrap_or_else(|p| p.into_inner());
                slot.get_or_insert_with(|| reason.clone());
                shutdown.cancel();
            })
        };
        let effects = Arc::new(AgentEffects {
            switcher: switcher.clone(),
            connection: connection.clone(),
            health: health.clone(),
            quality: quality.clone(),
            shutdown: shutdown.clone(),
        });
        let recovery = Arc::new(AutoRecoverySystem::new(
            RecoveryPolicy::from_config(&config),
            effects,
            on_fatal,
        ));

        Ok(Self {
            config,
            switcher,
            health,
            quality,
            recovery,
            connection,
            shutdown,
            fatal,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn switcher(&self) -> Arc<StreamSwitcher> {
        self.switcher.clone()
    }

    pub fn health(&self) -> SharedHealth {
        self.health.clone()
    }

    pub fn quality(&self) -> SharedQuality {
        self.quality.clone()
    }

    pub fn recovery(&self) -> Arc<AutoRecoverySystem> {
        self.recovery.clone()
    }

    /// Cancel to shut the agent down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            health: self.health.clone(),
            quality: self.quality.clone(),
            recovery: self.recovery.clone(),
            switcher: self.switcher.clone(),
            connection: self.connection.clone(),
            recovery_endpoints: self.config.server.recovery_endpoints,
            shutdown: self.shutdown.clone(),
        }
    }

    /// Run until the shutdown token is cancelled or a fatal condition is hit.
    ///
    /// With a `source`, streaming starts immediately.
    pub async fn run(&self, source: Option<String>) -> Result<(), AgentError> {
        let addr: SocketAddr = self
            .config
            .server
            .listen
            .parse()
            .map_err(|_| AgentError::InvalidListen(self.config.server.listen.clone()))?;

        // subscribe before anything can publish
        let health_rx = self.health.read().await.subscribe();
        let quality_rx = self.quality.read().await.subscribe();
        let switcher_rx = self.switcher.subscribe();

        let mut tasks = vec![
            self.start_metrics_updater(),
            self.start_health_checker(),
            self.start_health_pump(health_rx),
            self.start_switcher_pump(switcher_rx),
        ];
        if self.config.monitoring.stream_monitoring {
            tasks.push(self.start_quality_analyzer());
            tasks.push(self.start_quality_pump(quality_rx));
        }
        if let Some(rx) = self.connection.subscribe() {
            tasks.push(self.start_connection_pump(rx));
        }
        let server = self.start_server(addr);
        if let Some(url) = source {
            tasks.push(self.start_stream(url));
        }

        info!(
            listen = %addr,
            recovery = self.config.recovery.enabled,
            "agent running"
        );
        self.shutdown.cancelled().await;
        info!("shutting down");

        self.switcher.cleanup().await;
        for task in &tasks {
            task.abort();
        }

        let fatal = self.fatal.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(reason) = fatal {
            return Err(AgentError::Fatal(reason));
        }
        match server.await {
            Ok(Err(e)) => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn start_server(&self, addr: SocketAddr) -> JoinHandle<Result<(), ServerError>> {
        let state = self.app_state();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let result = run_server(addr, state, shutdown.clone()).await;
            if let Err(e) = &result {
                error!("health server error: {}", e);
                shutdown.cancel();
            }
            result
        })
    }

    fn start_stream(&self, url: String) -> JoinHandle<()> {
        let switcher = self.switcher.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            match switcher.switch_to(&url, shutdown.child_token()).await {
                Ok(session) => info!(session = %session.id, source = %url, "stream started"),
                Err(SwitchError::Cancelled) => debug!("initial stream start cancelled"),
                Err(e) => error!(source = %url, "failed to start stream: {}", e),
            }
        })
    }

    /// Periodically refresh the health snapshot.
    fn start_metrics_updater(&self) -> JoinHandle<()> {
        let health = self.health.clone();
        let switcher = self.switcher.clone();
        let connection = self.connection.clone();
        let shutdown = self.shutdown.clone();
        let period = Duration::from_secs(self.config.health.metrics_interval_secs.max(1));
        tokio::spawn(async move {
            let mut sampler = SystemSampler::new();
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let system = sampler.sample();
                let status = switcher.status();
                health.write().await.sample(
                    system,
                    connection.state(),
                    connection.is_connection_healthy(),
                    &status,
                    Instant::now(),
                );
            }
        })
    }

    fn start_health_checker(&self) -> JoinHandle<()> {
        let health = self.health.clone();
        let quality = self.quality.clone();
        let shutdown = self.shutdown.clone();
        let period = Duration::from_secs(self.config.health.check_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // the first tick fires at once; give the metrics tick a head start
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let latest = quality.read().await.latest().cloned();
                let result = health
                    .write()
                    .await
                    .perform_health_check(latest.as_ref(), Instant::now());
                if result.status == OverallStatus::Unhealthy {
                    warn!(
                        failed = ?result.failed_checks().collect::<Vec<_>>(),
                        "health check unhealthy"
                    );
                }
            }
        })
    }

    fn start_quality_analyzer(&self) -> JoinHandle<()> {
        let quality = self.quality.clone();
        let shutdown = self.shutdown.clone();
        let period = Duration::from_secs(self.config.monitoring.analysis_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Some(status) = quality.write().await.analyze(Instant::now()) {
                    debug!(score = status.score, status = ?status.status, "stream quality");
                }
            }
        })
    }

    /// Health results drive recovery.
    fn start_health_pump(&self, mut rx: broadcast::Receiver<HealthCheckResult>) -> JoinHandle<()> {
        let health = self.health.clone();
        let recovery = self.recovery.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let result = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = rx.recv() => result,
                };
                let result = match result {
                    Ok(result) => result,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "health results lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let (metrics, consecutive_errors) = {
                    let health = health.read().await;
                    (health.metrics().clone(), health.consecutive_errors())
                };
                let recovery = recovery.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let outcome = recovery
                        .handle_health_check(
                            &result,
                            &metrics,
                            consecutive_errors,
                            Instant::now(),
                            &shutdown,
                        )
                        .await;
                    log_recovery("health check", outcome);
                });
            }
        })
    }

    /// Switcher events feed the quality monitor and the error counters.
    fn start_switcher_pump(&self, mut rx: broadcast::Receiver<SwitcherEvent>) -> JoinHandle<()> {
        let health = self.health.clone();
        let quality = self.quality.clone();
        let recovery = self.recovery.clone();
        let shutdown = self.shutdown.clone();
        let monitoring = self.config.monitoring.stream_monitoring;
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => event,
                };
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "switcher events lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                match &event {
                    SwitcherEvent::SessionStarted(session) => {
                        recovery.note_stream_started(session.started_at);
                        info!(session = %session.id, source = %session.source_url, "stream live");
                    }
                    SwitcherEvent::Diagnostic { line, .. } => match parse_line(line) {
                        Ok(TelemetryLine::Error(_)) => health.write().await.record_error(),
                        Ok(TelemetryLine::Warning(_)) => health.write().await.record_warning(),
                        _ => {}
                    },
                    SwitcherEvent::EncoderExited { session_id, exit } => {
                        info!(session = %session_id, %exit, "encoder exited");
                    }
                    SwitcherEvent::Stopped => info!("stream stopped"),
                }

                if monitoring {
                    quality.write().await.handle_event(&event, Instant::now());
                }
            }
        })
    }

    /// Sustained poor quality triggers recovery.
    fn start_quality_pump(&self, mut rx: broadcast::Receiver<QualityEvent>) -> JoinHandle<()> {
        let recovery = self.recovery.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => event,
                };
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "quality events lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                match &event {
                    QualityEvent::Alert { session_id, health } => {
                        warn!(
                            session = %session_id,
                            score = health.score,
                            issues = ?health.issues,
                            "stream quality alert"
                        );
                        let alert = event.clone();
                        let recovery = recovery.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            let outcome = recovery
                                .handle_quality_event(&alert, Instant::now(), &shutdown)
                                .await;
                            log_recovery("quality alert", outcome);
                        });
                    }
                    QualityEvent::StreamEnded {
                        session_id, reason, ..
                    } => info!(session = %session_id, ?reason, "stream ended"),
                    QualityEvent::EncoderError { .. } => {}
                }
            }
        })
    }

    fn start_connection_pump(&self, mut rx: broadcast::Receiver<ConnectionEvent>) -> JoinHandle<()> {
        let recovery = self.recovery.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => event,
                };
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "connection events lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                info!(?event, "connection event");
                let recovery = recovery.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let outcome = recovery
                        .handle_connection_event(event, Instant::now(), &shutdown)
                        .await;
                    log_recovery("connection event", outcome);
                });
            }
        })
    }
}
