//! Stream quality scoring.
//!
//! Follows the active session's encoder telemetry, keeps running metrics and
//! turns them into a 0-100 score on every analysis tick. Each session moves
//! through `Startup -> Steady -> Ended`; during start-up penalties are scaled
//! down and only a long run of critical ticks raises an alert.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::config::MonitoringConfig;
use crate::encode::ExitInfo;
use crate::metrics::unix_timestamp_ms;
use crate::planner::EncodeProfile;
use crate::switcher::{SessionInfo, SwitcherEvent};
use crate::telemetry::{parse_line, ProgressSample, TelemetryLine};

const STARTUP_PENALTY_SCALE: f64 = 0.1;
const STEADY_ALERT_TICKS: u32 = 3;
const STARTUP_ALERT_TICKS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityStatus {
    Critical,
    Poor,
    Degraded,
    Good,
    Excellent,
}

impl QualityStatus {
    pub fn from_score(score: u8) -> Self {
        match score {
            90..=u8::MAX => QualityStatus::Excellent,
            75..=89 => QualityStatus::Good,
            60..=74 => QualityStatus::Degraded,
            40..=59 => QualityStatus::Poor,
            _ => QualityStatus::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Startup,
    Steady,
    Ended,
}

/// Derived from encode speed: a sub-real-time encoder drains its input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BufferHealth {
    #[default]
    Good,
    Degraded,
    Critical,
}

impl BufferHealth {
    fn from_speed(speed: f64) -> Self {
        if speed >= 0.95 {
            BufferHealth::Good
        } else if speed >= 0.8 {
            BufferHealth::Degraded
        } else {
            BufferHealth::Critical
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StreamQualityMetrics {
    pub frame_rate: f64,
    pub bitrate_kbps: f64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frames: u64,
    pub dropped_frames: u64,
    pub duplicate_frames: u64,
    pub encoding_speed: f64,
    pub buffer_health: BufferHealth,
    pub error_count: u64,
    pub warning_count: u64,
    pub timestamp_unix_ms: i64,
}

impl StreamQualityMetrics {
    fn apply_progress(&mut self, p: &ProgressSample) {
        self.frames = p.frame;
        self.frame_rate = p.fps;
        if let Some(bitrate) = p.bitrate_kbps {
            self.bitrate_kbps = bitrate;
        }
        if let Some(speed) = p.speed {
            self.encoding_speed = speed;
            self.buffer_health = BufferHealth::from_speed(speed);
        }
        self.dropped_frames = p.drop;
        self.duplicate_frames = p.dup;
        self.timestamp_unix_ms = unix_timestamp_ms();
    }
}

/// What the session is expected to achieve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityTargets {
    pub fps: f64,
    pub bitrate_kbps: f64,
}

impl From<&EncodeProfile> for QualityTargets {
    fn from(profile: &EncodeProfile) -> Self {
        Self {
            fps: profile.fps as f64,
            bitrate_kbps: profile.bitrate_kbps as f64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamHealthStatus {
    pub status: QualityStatus,
    pub score: u8,
    pub phase: SessionPhase,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
    pub timestamp_unix_ms: i64,
}

/// Score `metrics` against `targets`.
///
/// Starts from 100 and subtracts weighted penalties; in `Startup` every
/// penalty is scaled down.
pub fn score(
    metrics: &StreamQualityMetrics,
    targets: &QualityTargets,
    phase: SessionPhase,
) -> StreamHealthStatus {
    let mut penalty = 0.0;
    let mut issues = Vec::new();
    let mut recommendations = Vec::new();

    let fps_ratio = ratio(metrics.frame_rate, targets.fps);
    let fps_penalty = if fps_ratio < 0.5 {
        30.0
    } else if fps_ratio < 0.8 {
        20.0
    } else if fps_ratio < 0.95 {
        10.0
    } else {
        0.0
    };
    if fps_penalty > 0.0 {
        penalty += fps_penalty;
        issues.push(format!(
            "frame rate {:.1} below target {:.0}",
            metrics.frame_rate, targets.fps
        ));
        recommendations.push("lower the output frame rate or resolution".to_string());
    }

    let bitrate_ratio = ratio(metrics.bitrate_kbps, targets.bitrate_kbps);
    let bitrate_penalty = if bitrate_ratio < 0.3 {
        20.0
    } else if bitrate_ratio < 0.6 {
        10.0
    } else {
        0.0
    };
    if bitrate_penalty > 0.0 {
        penalty += bitrate_penalty;
        issues.push(format!(
            "bitrate {:.0}kbps well below target {:.0}kbps",
            metrics.bitrate_kbps, targets.bitrate_kbps
        ));
        recommendations.push("check the source stream bandwidth".to_string());
    }

    let drop_ratio = metrics.dropped_frames as f64 / metrics.frames.max(1) as f64;
    let drop_penalty = if drop_ratio > 0.05 {
        25.0
    } else if drop_ratio > 0.01 {
        15.0
    } else if metrics.dropped_frames > 0 {
        5.0
    } else {
        0.0
    };
    if drop_penalty > 0.0 {
        penalty += drop_penalty;
        issues.push(format!(
            "{} dropped frames ({:.1}%)",
            metrics.dropped_frames,
            drop_ratio * 100.0
        ));
        recommendations.push("reduce encoder load or enable hardware acceleration".to_string());
    }

    let speed_penalty = if metrics.encoding_speed <= 0.0 {
        0.0
    } else if metrics.encoding_speed < 0.8 {
        25.0
    } else if metrics.encoding_speed < 0.95 {
        15.0
    } else {
        0.0
    };
    if speed_penalty > 0.0 {
        penalty += speed_penalty;
        issues.push(format!(
            "encoding slower than real time ({:.2}x)",
            metrics.encoding_speed
        ));
        recommendations.push("use a faster encoder preset".to_string());
    }

    let buffer_penalty = match metrics.buffer_health {
        BufferHealth::Critical => 20.0,
        BufferHealth::Degraded => 10.0,
        BufferHealth::Good => 0.0,
    };
    if buffer_penalty > 0.0 {
        penalty += buffer_penalty;
        issues.push(format!("buffer health {:?}", metrics.buffer_health).to_lowercase());
    }

    if phase == SessionPhase::Startup {
        penalty *= STARTUP_PENALTY_SCALE;
    }

    let score = (100.0 - penalty).clamp(0.0, 100.0).round() as u8;
    StreamHealthStatus {
        status: QualityStatus::from_score(score),
        score,
        phase,
        issues,
        recommendations,
        timestamp_unix_ms: unix_timestamp_ms(),
    }
}

fn ratio(actual: f64, target: f64) -> f64 {
    if target <= 0.0 {
        1.0
    } else {
        (actual / target).max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The encoder process exited.
    Exited,
    /// No telemetry for the stale window.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum QualityEvent {
    /// Sustained poor quality.
    Alert {
        session_id: String,
        health: StreamHealthStatus,
    },
    StreamEnded {
        session_id: String,
        reason: EndReason,
        exit: Option<ExitInfo>,
        metrics: StreamQualityMetrics,
    },
    /// An error line in the encoder's diagnostic output.
    EncoderError { session_id: String, line: String },
}

/// One entry of the rolling quality history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitySample {
    pub timestamp_unix_ms: i64,
    pub score: u8,
    pub status: QualityStatus,
    pub phase: SessionPhase,
    pub frame_rate: f64,
    pub bitrate_kbps: f64,
    pub encoding_speed: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QualitySettings {
    pub stale_timeout: Duration,
    pub startup_window: Duration,
    pub history_size: usize,
}

impl QualitySettings {
    pub fn from_config(cfg: &MonitoringConfig) -> Self {
        Self {
            stale_timeout: Duration::from_secs(cfg.stale_timeout_secs),
            startup_window: Duration::from_secs(cfg.startup_window_secs),
            history_size: cfg.history_size.max(1),
        }
    }
}

#[derive(Debug)]
struct SessionTrack {
    session_id: String,
    started_at: Instant,
    targets: QualityTargets,
    metrics: StreamQualityMetrics,
    phase: SessionPhase,
    last_telemetry: Option<Instant>,
    has_progress: bool,
    end_marker_seen: bool,
    consecutive_bad: u32,
    consecutive_critical: u32,
}

pub struct StreamQualityMonitor {
    settings: QualitySettings,
    session: Option<SessionTrack>,
    latest: Option<StreamHealthStatus>,
    history: VecDeque<QualitySample>,
    events: broadcast::Sender<QualityEvent>,
    health: watch::Sender<Option<StreamHealthStatus>>,
}

impl StreamQualityMonitor {
    pub fn new(settings: QualitySettings) -> Self {
        let (events, _) = broadcast::channel(64);
        let (health, _) = watch::channel(None);
        Self {
            settings,
            session: None,
            latest: None,
            history: VecDeque::new(),
            events,
            health,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QualityEvent> {
        self.events.subscribe()
    }

    /// Latest health of the live session; `None` when nothing is being scored.
    pub fn watch_health(&self) -> watch::Receiver<Option<StreamHealthStatus>> {
        self.health.subscribe()
    }

    pub fn latest(&self) -> Option<&StreamHealthStatus> {
        self.latest.as_ref()
    }

    pub fn history(&self) -> impl Iterator<Item = &QualitySample> {
        self.history.iter()
    }

    pub fn trim_history(&mut self) {
        self.history.clear();
        self.history.shrink_to_fit();
    }

    pub fn phase(&self) -> Option<SessionPhase> {
        self.session.as_ref().map(|s| s.phase)
    }

    pub fn metrics(&self) -> Option<&StreamQualityMetrics> {
        self.session.as_ref().map(|s| &s.metrics)
    }

    /// Feed one switcher event.
    pub fn handle_event(&mut self, event: &SwitcherEvent, now: Instant) {
        match event {
            SwitcherEvent::SessionStarted(session) => self.start_session(session),
            SwitcherEvent::Diagnostic { session_id, line } => {
                self.ingest_line(session_id, line, now)
            }
            SwitcherEvent::EncoderExited { session_id, exit } => {
                self.encoder_exited(session_id, exit)
            }
            SwitcherEvent::Stopped => self.reset(),
        }
    }

    /// Begin tracking a new session; metrics start from zero.
    pub fn start_session(&mut self, session: &SessionInfo) {
        debug!(session = %session.id, "quality tracking started");
        self.session = Some(SessionTrack {
            session_id: session.id.clone(),
            started_at: session.started_at,
            targets: QualityTargets::from(&session.profile),
            metrics: StreamQualityMetrics::default(),
            phase: SessionPhase::Startup,
            last_telemetry: None,
            has_progress: false,
            end_marker_seen: false,
            consecutive_bad: 0,
            consecutive_critical: 0,
        });
        self.latest = None;
        self.health.send_replace(None);
    }

    pub fn reset(&mut self) {
        self.session = None;
        self.latest = None;
        self.health.send_replace(None);
    }

    pub fn ingest_line(&mut self, session_id: &str, line: &str, now: Instant) {
        let Some(track) = self.session.as_mut() else {
            return;
        };
        if track.session_id != session_id || track.phase == SessionPhase::Ended {
            return;
        }

        let Ok(parsed) = parse_line(line) else {
            return;
        };
        track.last_telemetry = Some(now);

        match parsed {
            TelemetryLine::Progress(progress) => {
                track.metrics.apply_progress(&progress);
                track.has_progress = true;
            }
            TelemetryLine::Resolution { width, height } => {
                track.metrics.width = Some(width);
                track.metrics.height = Some(height);
            }
            TelemetryLine::EndOfStream => track.end_marker_seen = true,
            TelemetryLine::Error(line) => {
                track.metrics.error_count += 1;
                warn!(session = %track.session_id, "encoder: {}", line);
                let _ = self.events.send(QualityEvent::EncoderError {
                    session_id: track.session_id.clone(),
                    line,
                });
            }
            TelemetryLine::Warning(line) => {
                track.metrics.warning_count += 1;
                warn!(session = %track.session_id, "encoder: {}", line);
            }
        }
    }

    /// The session's encoder exited. Ends the session and drops any pending
    /// alert streak.
    pub fn encoder_exited(&mut self, session_id: &str, exit: &ExitInfo) {
        let matches = self
            .session
            .as_ref()
            .map_or(false, |t| t.session_id == session_id && t.phase != SessionPhase::Ended);
        if matches {
            self.end_session(EndReason::Exited, Some(exit.clone()));
        }
    }

    /// One analysis tick.
    ///
    /// Returns the computed health, or `None` when there is nothing to score
    /// (no session, no progress yet, or the session ended).
    pub fn analyze(&mut self, now: Instant) -> Option<StreamHealthStatus> {
        let settings = self.settings.clone();
        let track = self.session.as_mut()?;
        if track.phase == SessionPhase::Ended {
            return None;
        }

        // Stale telemetry ends the session before any score is computed.
        if let Some(last) = track.last_telemetry {
            if now.saturating_duration_since(last) >= settings.stale_timeout {
                self.end_session(EndReason::Stale, None);
                return None;
            }
        }
        if !track.has_progress {
            return None;
        }

        let phase = if now.saturating_duration_since(track.started_at) < settings.startup_window {
            SessionPhase::Startup
        } else {
            SessionPhase::Steady
        };
        if phase != track.phase {
            debug!(session = %track.session_id, ?phase, "quality phase change");
            track.phase = phase;
            track.consecutive_bad = 0;
            track.consecutive_critical = 0;
        }

        let health = score(&track.metrics, &track.targets, phase);
        let mut alert = None;
        match phase {
            SessionPhase::Startup => {
                let unscaled = score(&track.metrics, &track.targets, SessionPhase::Steady);
                if unscaled.status == QualityStatus::Critical {
                    track.consecutive_critical += 1;
                } else {
                    track.consecutive_critical = 0;
                }
                if track.consecutive_critical >= STARTUP_ALERT_TICKS {
                    track.consecutive_critical = 0;
                    alert = Some(StreamHealthStatus {
                        phase: SessionPhase::Startup,
                        ..unscaled
                    });
                }
            }
            SessionPhase::Steady => {
                if health.status <= QualityStatus::Poor {
                    track.consecutive_bad += 1;
                } else {
                    track.consecutive_bad = 0;
                }
                if track.consecutive_bad >= STEADY_ALERT_TICKS {
                    track.consecutive_bad = 0;
                    alert = Some(health.clone());
                }
            }
            SessionPhase::Ended => {}
        }

        if let Some(alert) = alert {
            warn!(
                session = %track.session_id,
                score = alert.score,
                status = ?alert.status,
                "sustained stream quality problem"
            );
            let _ = self.events.send(QualityEvent::Alert {
                session_id: track.session_id.clone(),
                health: alert,
            });
        }

        self.history.push_back(QualitySample {
            timestamp_unix_ms: health.timestamp_unix_ms,
            score: health.score,
            status: health.status,
            phase,
            frame_rate: track.metrics.frame_rate,
            bitrate_kbps: track.metrics.bitrate_kbps,
            encoding_speed: track.metrics.encoding_speed,
        });
        while self.history.len() > settings.history_size {
            self.history.pop_front();
        }

        self.latest = Some(health.clone());
        self.health.send_replace(Some(health.clone()));
        Some(health)
    }

    fn end_session(&mut self, reason: EndReason, exit: Option<ExitInfo>) {
        let Some(track) = self.session.as_mut() else {
            return;
        };
        track.phase = SessionPhase::Ended;
        track.consecutive_bad = 0;
        track.consecutive_critical = 0;

        info!(
            session = %track.session_id,
            ?reason,
            finished = track.end_marker_seen,
            frames = track.metrics.frames,
            "stream ended"
        );
        let _ = self.events.send(QualityEvent::StreamEnded {
            session_id: track.session_id.clone(),
            reason,
            exit,
            metrics: track.metrics.clone(),
        });
        self.latest = None;
        self.health.send_replace(None);
    }
}
