//! Relay agent control plane
//!
//! Adaptive streaming and self-healing for a media relay: probes sources,
//! plans encode settings, hot-switches the encoder pipeline, monitors health
//! and stream quality, and runs automatic recovery.

pub mod agent;
pub mod analyzer;
pub mod connection;
pub mod encode;
pub mod health;
pub mod metrics;
pub mod planner;
pub mod quality;
pub mod recovery;
pub mod server;
pub mod sink;
pub mod startup;
pub mod switcher;
pub mod telemetry;

pub use agent::{Agent, AgentError};
pub use analyzer::{ProbeError, ProbeResult, SourceProber, StreamAnalyzer};
pub use connection::{
    ConnectionError, ConnectionEvent, ConnectionLayer, ConnectionState, StandaloneConnection,
};
pub use encode::{
    build_ffmpeg_command, EncodeJob, EncoderHandle, EncoderLauncher, ExitInfo, FfmpegLauncher,
    LaunchError, LaunchedEncoder,
};
pub use health::{
    CheckOutcome, CheckStatus, HealthCheckResult, HealthMonitor, HealthThresholds, OverallStatus,
};
pub use metrics::{HealthMetrics, SystemSample, SystemSampler};
pub use planner::{plan, EncodeProfile, ProfileError};
pub use quality::{
    QualityEvent, QualityStatus, SessionPhase, StreamHealthStatus, StreamQualityMetrics,
    StreamQualityMonitor,
};
pub use recovery::{
    ActionKind, AutoRecoverySystem, FatalReason, RecoveryEffects, RecoveryError, RecoveryPolicy,
    RecoveryStats,
};
pub use server::{create_router, run_server, AppState, ServerError};
pub use sink::{MediaSink, OutputTarget, SinkProvider};
pub use startup::{run_startup_checks, StartupError, ToolReport};
pub use switcher::{SessionInfo, StreamSwitcher, SwitchError, SwitchState, SwitcherStatus};
pub use telemetry::{parse_line, TelemetryLine};

pub use relay_agent_config as config;
pub use relay_agent_config::Config;
