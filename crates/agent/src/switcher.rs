//! Hot-switchable encode pipeline.
//!
//! The switcher owns the active encoder and the downstream sink. A switch
//! launches the replacement encoder, waits until its first output chunk has
//! reached the sink and only then retires the previous encoder, so the sink
//! never sees a gap. Switch requests are serialized; a newer request cancels
//! one still in flight.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analyzer::SourceProber;
use crate::config::Config;
use crate::encode::{EncodeJob, EncoderHandle, EncoderLauncher, ExitInfo, LaunchedEncoder};
use crate::metrics::unix_timestamp_ms;
use crate::planner::{plan, EncodeProfile, ProfileError};
use crate::sink::{MediaSink, SinkProvider};

/// Diagnostic lines held back until a session is confirmed live.
const PENDING_DIAGNOSTICS: usize = 512;
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SwitchError {
    /// Superseded by a newer request or stopped. Not a failure.
    #[error("switch cancelled")]
    Cancelled,

    #[error("encoder failed to start: {0}")]
    StartFailed(String),

    #[error("no active session")]
    NoSession,

    #[error("failed to open output sink: {0}")]
    Sink(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SwitchState {
    #[default]
    Idle,
    Starting,
    Live,
    Switching,
    Aborted,
}

/// One live encoding session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub source_url: String,
    pub profile: EncodeProfile,
    pub started_at_unix_ms: i64,
    #[serde(skip)]
    pub started_at: Instant,
}

/// Published on every state change.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SwitcherStatus {
    pub state: SwitchState,
    pub session: Option<SessionInfo>,
    pub pid: Option<u32>,
    pub encoder_running: bool,
    /// The session's encoder exited cleanly: the source finished.
    pub ended: bool,
    /// Retired encoders still being drained.
    pub draining: usize,
}

impl SwitcherStatus {
    /// A session is live and its encoder is still running.
    pub fn is_streaming(&self) -> bool {
        self.session.is_some() && self.encoder_running
    }

    /// A session exists whose source has not finished.
    pub fn has_active_session(&self) -> bool {
        self.session.is_some() && !self.ended
    }
}

#[derive(Debug, Clone)]
pub enum SwitcherEvent {
    SessionStarted(SessionInfo),
    Diagnostic { session_id: String, line: String },
    EncoderExited { session_id: String, exit: ExitInfo },
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitcherSettings {
    /// Probe each source and plan a profile for it.
    pub adaptive: bool,
    pub hardware_acceleration: bool,
    pub default_profile: EncodeProfile,
    /// How long a new encoder gets to produce its first output.
    pub start_timeout: Duration,
    /// Bound on waiting for a retired encoder to exit.
    pub drain_timeout: Duration,
    pub terminate_grace: Duration,
}

impl SwitcherSettings {
    pub fn from_config(config: &Config) -> Result<Self, ProfileError> {
        Ok(Self {
            adaptive: config.encode.adaptive_settings,
            hardware_acceleration: config.encode.hardware_acceleration,
            default_profile: EncodeProfile::from_config(&config.encode)?,
            start_timeout: Duration::from_secs(config.encoder.start_timeout_secs),
            drain_timeout: Duration::from_millis(config.encoder.drain_timeout_ms),
            terminate_grace: Duration::from_millis(config.encoder.terminate_grace_ms),
        })
    }
}

struct Pipeline {
    session: SessionInfo,
    handle: EncoderHandle,
    forward: CancellationToken,
}

#[derive(Default)]
struct Inner {
    current: Option<Pipeline>,
    sink: Option<Arc<dyn MediaSink>>,
    last_profile: Option<EncodeProfile>,
}

#[derive(Default)]
struct InFlight {
    generation: u64,
    token: Option<CancellationToken>,
}

pub struct StreamSwitcher {
    prober: Arc<dyn SourceProber>,
    launcher: Arc<dyn EncoderLauncher>,
    sinks: Arc<dyn SinkProvider>,
    settings: SwitcherSettings,
    inner: Mutex<Inner>,
    in_flight: std::sync::Mutex<InFlight>,
    status: Arc<watch::Sender<SwitcherStatus>>,
    events: broadcast::Sender<SwitcherEvent>,
    draining: Arc<AtomicUsize>,
}

impl StreamSwitcher {
    pub fn new(
        prober: Arc<dyn SourceProber>,
        launcher: Arc<dyn EncoderLauncher>,
        sinks: Arc<dyn SinkProvider>,
        settings: SwitcherSettings,
    ) -> Self {
        let (status, _) = watch::channel(SwitcherStatus::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            prober,
            launcher,
            sinks,
            settings,
            inner: Mutex::new(Inner::default()),
            in_flight: std::sync::Mutex::new(InFlight::default()),
            status: Arc::new(status),
            events,
            draining: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn status(&self) -> SwitcherStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SwitcherStatus> {
        self.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwitcherEvent> {
        self.events.subscribe()
    }

    pub fn current_session(&self) -> Option<SessionInfo> {
        self.status.borrow().session.clone()
    }

    /// Switch the live output to `url`, probing it for a fresh profile.
    pub async fn switch_to(
        &self,
        url: &str,
        cancel: CancellationToken,
    ) -> Result<SessionInfo, SwitchError> {
        let token = cancel.child_token();
        let generation = self.supersede(token.clone());
        let result = self.run_switch(url, None, &token).await;
        self.finish(generation);
        result
    }

    /// Relaunch the encoder on the current source with the current profile.
    /// No probe is made.
    pub async fn restart_encoder(
        &self,
        cancel: CancellationToken,
    ) -> Result<SessionInfo, SwitchError> {
        let (url, profile) = self.current_source().await?;
        let token = cancel.child_token();
        let generation = self.supersede(token.clone());
        let result = self.run_switch(&url, Some(profile), &token).await;
        self.finish(generation);
        result
    }

    /// Restart the current source from scratch, re-probing it.
    pub async fn restart_stream(
        &self,
        cancel: CancellationToken,
    ) -> Result<SessionInfo, SwitchError> {
        let (url, _) = self.current_source().await?;
        self.switch_to(&url, cancel).await
    }

    /// Terminate the active encoder and close the sink. Safe to repeat.
    pub async fn stop(&self) {
        if let Some(token) = self.lock_in_flight().token.take() {
            token.cancel();
        }

        let mut inner = self.inner.lock().await;
        let had_session = inner.current.is_some();
        if let Some(pipeline) = inner.current.take() {
            pipeline.forward.cancel();
            let exit = pipeline.handle.terminate(self.settings.terminate_grace).await;
            info!(
                session = %pipeline.session.id,
                exit = ?exit,
                "encoder stopped"
            );
        }
        if let Some(sink) = inner.sink.take() {
            if let Err(e) = sink.close().await {
                warn!("failed to close output sink: {}", e);
            }
        }
        self.publish(SwitchState::Idle, &inner);

        if had_session {
            let _ = self.events.send(SwitcherEvent::Stopped);
        }
    }

    pub async fn cleanup(&self) {
        self.stop().await
    }

    async fn current_source(&self) -> Result<(String, EncodeProfile), SwitchError> {
        let inner = self.inner.lock().await;
        inner
            .current
            .as_ref()
            .map(|p| (p.session.source_url.clone(), p.session.profile.clone()))
            .ok_or(SwitchError::NoSession)
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, InFlight> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `token` as the in-flight switch, cancelling the previous one.
    fn supersede(&self, token: CancellationToken) -> u64 {
        let mut in_flight = self.lock_in_flight();
        if let Some(previous) = in_flight.token.replace(token) {
            debug!("superseding switch in flight");
            previous.cancel();
        }
        in_flight.generation += 1;
        in_flight.generation
    }

    fn finish(&self, generation: u64) {
        let mut in_flight = self.lock_in_flight();
        if in_flight.generation == generation {
            in_flight.token = None;
        }
    }

    async fn run_switch(
        &self,
        url: &str,
        profile: Option<EncodeProfile>,
        token: &CancellationToken,
    ) -> Result<SessionInfo, SwitchError> {
        let mut inner = tokio::select! {
            _ = token.cancelled() => return Err(SwitchError::Cancelled),
            guard = self.inner.lock() => guard,
        };

        let transitional = if inner.current.is_some() {
            SwitchState::Switching
        } else {
            SwitchState::Starting
        };
        self.set_state(transitional);

        let profile = match profile {
            Some(profile) => profile,
            None => {
                let last = inner.last_profile.clone();
                tokio::select! {
                    _ = token.cancelled() => {
                        self.settle(&inner, SwitchState::Aborted);
                        return Err(SwitchError::Cancelled);
                    }
                    profile = self.resolve_profile(url, last) => profile,
                }
            }
        };

        let sink = match inner.sink.clone() {
            Some(sink) => sink,
            None => match self.sinks.open().await {
                Ok(sink) => {
                    let sink: Arc<dyn MediaSink> = Arc::from(sink);
                    inner.sink = Some(sink.clone());
                    sink
                }
                Err(e) => {
                    self.settle(&inner, SwitchState::Idle);
                    return Err(SwitchError::Sink(e.to_string()));
                }
            },
        };

        let job = EncodeJob {
            source_url: url.to_string(),
            profile: profile.clone(),
        };
        let launched = tokio::select! {
            _ = token.cancelled() => {
                self.settle(&inner, SwitchState::Aborted);
                return Err(SwitchError::Cancelled);
            }
            launched = self.launcher.launch(&job) => launched,
        };
        let LaunchedEncoder {
            handle,
            output,
            diagnostics,
        } = match launched {
            Ok(launched) => launched,
            Err(e) => {
                warn!(url, "encoder launch failed: {}", e);
                self.settle(&inner, SwitchState::Idle);
                return Err(SwitchError::StartFailed(e.to_string()));
            }
        };

        let session_id = Uuid::new_v4().to_string();
        let forward = CancellationToken::new();
        let (confirm_tx, confirm_rx) = oneshot::channel();
        let (live_tx, live_rx) = oneshot::channel();
        tokio::spawn(forward_output(output, sink, confirm_tx, forward.clone()));
        tokio::spawn(forward_diagnostics(
            diagnostics,
            self.events.clone(),
            session_id.clone(),
            live_rx,
        ));

        // Once the first chunk is in the sink the switch is committed, even if
        // cancellation arrives in the same poll.
        let confirmed = tokio::select! {
            biased;
            confirmed = tokio::time::timeout(self.settings.start_timeout, confirm_rx) => match confirmed {
                Ok(Ok(Ok(()))) => Ok(()),
                Ok(Ok(Err(e))) => Err(SwitchError::StartFailed(format!(
                    "output sink rejected first chunk: {}",
                    e
                ))),
                Ok(Err(_)) => Err(SwitchError::StartFailed(match handle.exit_info() {
                    Some(exit) => format!("encoder exited before producing output ({})", exit),
                    None => "encoder closed its output before producing any".to_string(),
                })),
                Err(_) => Err(SwitchError::StartFailed(format!(
                    "no output within {}s",
                    self.settings.start_timeout.as_secs_f64()
                ))),
            },
            _ = token.cancelled() => Err(SwitchError::Cancelled),
        };

        if let Err(e) = confirmed {
            forward.cancel();
            handle.terminate(self.settings.terminate_grace).await;
            let fallback = if e == SwitchError::Cancelled {
                SwitchState::Aborted
            } else {
                warn!(url, "switch failed: {}", e);
                SwitchState::Idle
            };
            self.settle(&inner, fallback);
            return Err(e);
        }

        let session = SessionInfo {
            id: session_id,
            source_url: url.to_string(),
            profile: profile.clone(),
            started_at_unix_ms: unix_timestamp_ms(),
            started_at: Instant::now(),
        };

        tokio::spawn(watch_exit(
            handle.exit_watch(),
            session.id.clone(),
            self.events.clone(),
            self.status.clone(),
        ));

        let previous = inner.current.replace(Pipeline {
            session: session.clone(),
            handle,
            forward,
        });
        inner.last_profile = Some(profile);
        self.publish(SwitchState::Live, &inner);

        let _ = self.events.send(SwitcherEvent::SessionStarted(session.clone()));
        let _ = live_tx.send(());

        info!(
            session = %session.id,
            url,
            width = session.profile.width,
            height = session.profile.height,
            fps = session.profile.fps,
            bitrate_kbps = session.profile.bitrate_kbps,
            "session live"
        );

        if let Some(old) = previous {
            self.retire(old);
        }

        Ok(session)
    }

    async fn resolve_profile(&self, url: &str, last: Option<EncodeProfile>) -> EncodeProfile {
        if !self.settings.adaptive {
            return self.settings.default_profile.clone();
        }
        match self.prober.analyze(url).await {
            Ok(probe) => plan(&probe, self.settings.hardware_acceleration),
            Err(e) => {
                let fallback = last.unwrap_or_else(|| self.settings.default_profile.clone());
                warn!(
                    url,
                    width = fallback.width,
                    height = fallback.height,
                    fps = fallback.fps,
                    "{}, using fallback profile",
                    e
                );
                fallback
            }
        }
    }

    /// Terminate a replaced pipeline in the background.
    fn retire(&self, old: Pipeline) {
        old.forward.cancel();
        let draining = self.draining.fetch_add(1, Ordering::SeqCst) + 1;
        self.status.send_modify(|s| s.draining = draining);

        let counter = self.draining.clone();
        let status = self.status.clone();
        let grace = self.settings.terminate_grace;
        let drain = self.settings.drain_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(drain, old.handle.terminate(grace)).await {
                Ok(exit) => {
                    debug!(session = %old.session.id, exit = ?exit, "previous encoder drained")
                }
                Err(_) => warn!(
                    session = %old.session.id,
                    "previous encoder still running after drain interval, discarding"
                ),
            }
            drop(old);
            let left = counter.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
            status.send_modify(|s| s.draining = left);
        });
    }

    fn set_state(&self, state: SwitchState) {
        self.status.send_modify(|s| s.state = state);
    }

    fn publish(&self, state: SwitchState, inner: &Inner) {
        let current = inner.current.as_ref();
        self.status.send_modify(|s| {
            let same_session = s.session.as_ref().map(|x| &x.id) == current.map(|p| &p.session.id);
            if !same_session {
                s.ended = false;
            }
            s.state = state;
            s.session = current.map(|p| p.session.clone());
            s.pid = current.and_then(|p| p.handle.pid());
            s.encoder_running = current.map_or(false, |p| p.handle.is_running());
        });
    }

    /// Back to Live if a pipeline survives, otherwise `otherwise`.
    fn settle(&self, inner: &Inner, otherwise: SwitchState) {
        let state = if inner.current.is_some() {
            SwitchState::Live
        } else {
            otherwise
        };
        self.publish(state, inner);
    }
}

/// Pump encoder output into the sink.
///
/// The outcome of writing the first chunk confirms or fails the switch;
/// dropping `confirm` without sending means the encoder never produced
/// output. The previous pipeline keeps its own pump until the switch
/// commits and retires it.
async fn forward_output(
    mut output: mpsc::Receiver<Bytes>,
    sink: Arc<dyn MediaSink>,
    confirm: oneshot::Sender<Result<(), String>>,
    token: CancellationToken,
) {
    let first = tokio::select! {
        _ = token.cancelled() => return,
        chunk = output.recv() => chunk,
    };
    let Some(first) = first else {
        return;
    };

    if let Err(e) = sink.write(first).await {
        warn!("output sink rejected first chunk: {}", e);
        let _ = confirm.send(Err(e.to_string()));
        return;
    }
    let _ = confirm.send(Ok(()));

    loop {
        let chunk = tokio::select! {
            _ = token.cancelled() => break,
            chunk = output.recv() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        if let Err(e) = sink.write(chunk).await {
            warn!("output sink write failed: {}", e);
            break;
        }
    }
}

async fn forward_diagnostics(
    mut lines: mpsc::Receiver<String>,
    events: broadcast::Sender<SwitcherEvent>,
    session_id: String,
    mut live: oneshot::Receiver<()>,
) {
    let mut pending = Vec::new();
    loop {
        tokio::select! {
            went_live = &mut live => {
                if went_live.is_err() {
                    return;
                }
                break;
            }
            line = lines.recv() => match line {
                Some(line) if pending.len() < PENDING_DIAGNOSTICS => pending.push(line),
                Some(_) => {}
                None => {
                    // encoder gone before the switch resolved
                    if live.await.is_err() {
                        return;
                    }
                    break;
                }
            },
        }
    }

    for line in pending {
        let _ = events.send(SwitcherEvent::Diagnostic {
            session_id: session_id.clone(),
            line,
        });
    }
    while let Some(line) = lines.recv().await {
        let _ = events.send(SwitcherEvent::Diagnostic {
            session_id: session_id.clone(),
            line,
        });
    }
}

async fn watch_exit(
    mut exit: watch::Receiver<Option<ExitInfo>>,
    session_id: String,
    events: broadcast::Sender<SwitcherEvent>,
    status: Arc<watch::Sender<SwitcherStatus>>,
) {
    let info = match exit.wait_for(|info| info.is_some()).await {
        Ok(info) => info.clone(),
        Err(_) => None,
    };
    let info = info.unwrap_or(ExitInfo {
        code: None,
        signal: None,
    });

    status.send_modify(|s| {
        if s.session.as_ref().map(|x| x.id.as_str()) == Some(session_id.as_str()) {
            s.encoder_running = false;
            s.pid = None;
            s.ended = info.success();
        }
    });
    debug!(session = %session_id, exit = %info, "encoder exited");
    let _ = events.send(SwitcherEvent::EncoderExited {
        session_id,
        exit: info,
    });
}
