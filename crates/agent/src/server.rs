//! Health and recovery HTTP server
//!
//! Exposes health probes and a detailed status document for orchestrators and
//! the `rtop` dashboard. The recovery endpoints are only mounted when enabled.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::connection::{ConnectionLayer, ConnectionState};
use crate::health::{CheckOutcome, HealthCheckResult, HealthMonitor, OverallStatus};
use crate::metrics::{unix_timestamp_ms, HealthMetrics};
use crate::quality::{
    QualitySample, SessionPhase, StreamHealthStatus, StreamQualityMetrics, StreamQualityMonitor,
};
use crate::recovery::{
    AutoRecoverySystem, RecoveryAction, RecoveryAttempt, RecoveryError, RecoveryStats,
};
use crate::switcher::{StreamSwitcher, SwitcherStatus};

/// Uptime after which a ready agent counts as started.
const STARTUP_MIN_UPTIME: Duration = Duration::from_secs(10);
const RECOVERY_HISTORY_LIMIT: usize = 20;

pub type SharedHealth = Arc<RwLock<HealthMonitor>>;
pub type SharedQuality = Arc<RwLock<StreamQualityMonitor>>;

/// Errors that can occur when running the health server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),

    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Everything the handlers read from.
#[derive(Clone)]
pub struct AppState {
    pub health: SharedHealth,
    pub quality: SharedQuality,
    pub recovery: Arc<AutoRecoverySystem>,
    pub switcher: Arc<StreamSwitcher>,
    pub connection: Arc<dyn ConnectionLayer>,
    pub recovery_endpoints: bool,
    /// Cancels manual recovery batches on shutdown.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: OverallStatus,
    pub timestamp: i64,
    pub checks: BTreeMap<String, CheckOutcome>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub ok: bool,
    pub uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StreamDetail {
    pub latest: Option<StreamHealthStatus>,
    pub phase: Option<SessionPhase>,
    pub metrics: Option<StreamQualityMetrics>,
    pub history: Vec<QualitySample>,
}

#[derive(Debug, Serialize)]
pub struct DetailedResponse {
    pub status: OverallStatus,
    pub timestamp: i64,
    pub uptime_secs: u64,
    pub health: Option<HealthCheckResult>,
    pub metrics: HealthMetrics,
    pub connection: ConnectionState,
    pub voice_healthy: bool,
    pub switcher: SwitcherStatus,
    pub stream: StreamDetail,
    pub recovery: RecoveryStats,
    /// Most recent recovery attempts, oldest first.
    pub recovery_history: Vec<RecoveryAttempt>,
    pub health_history: Vec<HealthCheckResult>,
}

#[derive(Debug, Serialize)]
pub struct RecoveryStatusResponse {
    pub stats: RecoveryStats,
    pub history: Vec<RecoveryAttempt>,
    pub actions: Vec<RecoveryAction>,
}

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub actions: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

fn probe(ok: bool, uptime: Duration, reason: Option<&str>) -> Response {
    let status = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = ProbeResponse {
        ok,
        uptime_secs: uptime.as_secs(),
        reason: reason.map(str::to_string),
    };
    (status, Json(body)).into_response()
}

/// Latest completed check, or a verdict from the current snapshot before the
/// first health tick.
fn current_status(health: &HealthMonitor) -> (OverallStatus, BTreeMap<String, CheckOutcome>) {
    match health.last_result() {
        Some(result) => (result.status, result.checks.clone()),
        None if health.is_healthy() => (OverallStatus::Healthy, BTreeMap::new()),
        None => (OverallStatus::Unhealthy, BTreeMap::new()),
    }
}

/// Handler for GET /health
async fn get_health(State(state): State<AppState>) -> Response {
    let (status, checks) = current_status(&*state.health.read().await);
    let code = match status {
        OverallStatus::Healthy | OverallStatus::Degraded => StatusCode::OK,
        OverallStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    let body = HealthResponse {
        status,
        timestamp: unix_timestamp_ms(),
        checks,
    };
    (code, Json(body)).into_response()
}

/// Handler for GET /health/live
async fn get_live(State(state): State<AppState>) -> Response {
    let health = state.health.read().await;
    let uptime = health.uptime(Instant::now());
    let live = health.is_live();
    probe(live, uptime, (!live).then_some("critical condition or not ready"))
}

/// Handler for GET /health/ready
async fn get_ready(State(state): State<AppState>) -> Response {
    let health = state.health.read().await;
    let uptime = health.uptime(Instant::now());
    let connection = state.connection.state();

    let reason = if !connection.connected {
        Some("connection down")
    } else if !health.is_ready() {
        Some("not ready")
    } else {
        None
    };
    probe(reason.is_none(), uptime, reason)
}

/// Handler for GET /health/startup
async fn get_startup(State(state): State<AppState>) -> Response {
    let health = state.health.read().await;
    let uptime = health.uptime(Instant::now());

    let reason = if !health.is_ready() {
        Some("connection not ready")
    } else if uptime <= STARTUP_MIN_UPTIME {
        Some("starting up")
    } else {
        None
    };
    probe(reason.is_none(), uptime, reason)
}

/// Handler for GET /health/detailed
async fn get_detailed(State(state): State<AppState>) -> Json<DetailedResponse> {
    let now = Instant::now();
    let (status, health_result, metrics, uptime, health_history) = {
        let health = state.health.read().await;
        let (status, _) = current_status(&health);
        (
            status,
            health.last_result().cloned(),
            health.metrics().clone(),
            health.uptime(now),
            health.history().cloned().collect(),
        )
    };
    let stream = {
        let quality = state.quality.read().await;
        StreamDetail {
            latest: quality.latest().cloned(),
            phase: quality.phase(),
            metrics: quality.metrics().cloned(),
            history: quality.history().cloned().collect(),
        }
    };

    Json(DetailedResponse {
        status,
        timestamp: unix_timestamp_ms(),
        uptime_secs: uptime.as_secs(),
        health: health_result,
        metrics,
        connection: state.connection.state(),
        voice_healthy: state.connection.is_connection_healthy(),
        switcher: state.switcher.status(),
        stream,
        recovery: state.recovery.stats(now),
        recovery_history: state.recovery.history(RECOVERY_HISTORY_LIMIT),
        health_history,
    })
}

/// Handler for GET /recovery/status
async fn get_recovery_status(State(state): State<AppState>) -> Json<RecoveryStatusResponse> {
    Json(RecoveryStatusResponse {
        stats: state.recovery.stats(Instant::now()),
        history: state.recovery.history(RECOVERY_HISTORY_LIMIT),
        actions: state.recovery.catalog(),
    })
}

/// Handler for POST /recovery/trigger
async fn post_recovery_trigger(
    State(state): State<AppState>,
    body: Result<Json<TriggerRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    info!(actions = ?request.actions, "manual recovery requested");

    match state
        .recovery
        .trigger(&request.actions, Instant::now(), &state.shutdown)
        .await
    {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => {
            let status = match e {
                RecoveryError::UnknownAction(_) | RecoveryError::NothingRequested => {
                    StatusCode::BAD_REQUEST
                }
                RecoveryError::InProgress => StatusCode::CONFLICT,
                RecoveryError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
                RecoveryError::Disabled
                | RecoveryError::ActionFailed(_)
                | RecoveryError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            };
            error_response(status, e.to_string())
        }
    }
}

/// Creates the axum Router with the health endpoints, plus the recovery
/// endpoints when they are enabled
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(get_health))
        .route("/health/live", get(get_live))
        .route("/health/ready", get(get_ready))
        .route("/health/startup", get(get_startup))
        .route("/health/detailed", get(get_detailed));

    if state.recovery_endpoints {
        router = router
            .route("/recovery/status", get(get_recovery_status))
            .route("/recovery/trigger", post(post_recovery_trigger));
    }

    router.with_state(state)
}

/// Runs the health server until `shutdown` is cancelled
pub async fn run_server(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "health server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(ServerError::Serve)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{ProbeError, ProbeResult, SourceProber};
    use crate::config::Config;
    use crate::connection::StandaloneConnection;
    use crate::encode::{EncodeJob, EncoderLauncher, LaunchError, LaunchedEncoder};
    use crate::health::HealthThresholds;
    use crate::metrics::SystemSample;
    use crate::quality::QualitySettings;
    use crate::recovery::{ActionKind, FatalHandler, FatalReason, RecoveryEffects, RecoveryPolicy};
    use crate::sink::{MediaSink, SinkProvider};
    use crate::switcher::SwitcherSettings;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::io;
    use tower::ServiceExt;

    struct NoProber;

    #[async_trait]
    impl SourceProber for NoProber {
        async fn analyze(&self, _url: &str) -> Result<ProbeResult, ProbeError> {
            Err(ProbeError::ProbeFailed("offline".to_string()))
        }
    }

    struct NoLauncher;

    #[async_trait]
    impl EncoderLauncher for NoLauncher {
        async fn launch(&self, _job: &EncodeJob) -> Result<LaunchedEncoder, LaunchError> {
            Err(LaunchError::MissingPipe("stdout"))
        }
    }

    struct NoSinks;

    #[async_trait]
    impl SinkProvider for NoSinks {
        async fn open(&self) -> io::Result<Box<dyn MediaSink>> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no sink"))
        }
    }

    struct OkEffects;

    #[async_trait]
    impl RecoveryEffects for OkEffects {
        async fn execute(&self, _action: ActionKind) -> Result<(), RecoveryError> {
            Ok(())
        }
    }

    fn test_state(recovery_endpoints: bool, started_at: Instant) -> AppState {
        let config = Config::default();
        let switcher = StreamSwitcher::new(
            Arc::new(NoProber),
            Arc::new(NoLauncher),
            Arc::new(NoSinks),
            SwitcherSettings::from_config(&config).unwrap(),
        );
        let on_fatal: FatalHandler = Arc::new(|_: &FatalReason| {});
        AppState {
            health: Arc::new(RwLock::new(HealthMonitor::new(
                HealthThresholds::from_config(&config),
                started_at,
            ))),
            quality: Arc::new(RwLock::new(StreamQualityMonitor::new(
                QualitySettings::from_config(&config.monitoring),
            ))),
            recovery: Arc::new(AutoRecoverySystem::new(
                RecoveryPolicy::from_config(&config),
                Arc::new(OkEffects),
                on_fatal,
            )),
            switcher: Arc::new(switcher),
            connection: Arc::new(StandaloneConnection::new()),
            recovery_endpoints,
            shutdown: CancellationToken::new(),
        }
    }

    /// Sample a connected, idle agent and run one check.
    async fn run_healthy_check(state: &AppState) {
        let mut health = state.health.write().await;
        let now = Instant::now();
        health.sample(
            SystemSample::default(),
            ConnectionState {
                connected: true,
                ready: true,
                latency_ms: Some(25),
            },
            true,
            &SwitcherStatus::default(),
            now,
        );
        health.perform_health_check(None, now);
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn post_json(app: Router, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_unhealthy_before_connection() {
        let state = test_state(false, Instant::now());
        let (status, json) = get(create_router(state), "/health").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "unhealthy");
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_health_reports_checks() {
        let state = test_state(false, Instant::now());
        run_healthy_check(&state).await;

        let (status, json) = get(create_router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["checks"]["connection"]["status"], "pass");
        assert!(json["checks"].get("encoder").is_some());
        // no stream check while not streaming
        assert!(json["checks"].get("stream").is_none());
    }

    #[tokio::test]
    async fn test_ready_requires_connection() {
        let mut state = test_state(false, Instant::now());
        let connection = Arc::new(StandaloneConnection::new());
        connection.set_connected(false);
        state.connection = connection.clone();

        let (status, json) = get(create_router(state.clone()), "/health/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["reason"], "connection down");

        connection.set_connected(true);
        let (status, json) = get(create_router(state.clone()), "/health/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["reason"], "not ready");

        run_healthy_check(&state).await;
        let (status, json) = get(create_router(state), "/health/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ok"], true);
        assert!(json.get("reason").is_none());
    }

    #[tokio::test]
    async fn test_startup_waits_for_uptime() {
        let state = test_state(false, Instant::now());
        run_healthy_check(&state).await;
        let (status, json) = get(create_router(state), "/health/startup").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["reason"], "starting up");

        let state = test_state(false, Instant::now() - Duration::from_secs(30));
        run_healthy_check(&state).await;
        let (status, _) = get(create_router(state), "/health/startup").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_live_follows_monitor() {
        let state = test_state(false, Instant::now());
        let (status, _) = get(create_router(state.clone()), "/health/live").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        run_healthy_check(&state).await;
        let (status, _) = get(create_router(state), "/health/live").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_detailed_document_sections() {
        let state = test_state(false, Instant::now());
        run_healthy_check(&state).await;

        let (status, json) = get(create_router(state), "/health/detailed").await;
        assert_eq!(status, StatusCode::OK);
        for key in [
            "health",
            "metrics",
            "connection",
            "switcher",
            "stream",
            "recovery",
            "recovery_history",
            "health_history",
        ] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(json["switcher"]["state"], "idle");
        assert_eq!(json["recovery"]["total_attempts"], 0);
        assert_eq!(json["health_history"].as_array().unwrap().len(), 1);
        assert!(json["stream"]["history"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recovery_endpoints_disabled_by_default() {
        let state = test_state(false, Instant::now());
        let response = create_router(state)
            .oneshot(
                Request::builder()
                    .uri("/recovery/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_recovery_trigger_runs_actions() {
        let state = test_state(true, Instant::now());
        let (status, json) = post_json(
            create_router(state.clone()),
            "/recovery/trigger",
            r#"{"actions": ["reconnect-voice", "memory-cleanup"]}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["attempts"].as_array().unwrap().len(), 2);
        assert_eq!(json["attempts"][0]["action"], "reconnect-voice");
        assert_eq!(json["attempts"][0]["success"], true);

        // cooldowns do not apply to manual triggers
        let (status, _) = post_json(
            create_router(state.clone()),
            "/recovery/trigger",
            r#"{"actions": ["reconnect-voice"]}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, json) = get(create_router(state), "/recovery/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["stats"]["total_attempts"], 3);
        assert_eq!(json["history"].as_array().unwrap().len(), 3);
        assert_eq!(json["actions"].as_array().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_recovery_trigger_rejects_bad_requests() {
        let state = test_state(true, Instant::now());

        let (status, json) = post_json(
            create_router(state.clone()),
            "/recovery/trigger",
            r#"{"actions": ["reboot-host"]}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("reboot-host"));

        let (status, _) =
            post_json(create_router(state.clone()), "/recovery/trigger", r#"{"act"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = post_json(
            create_router(state),
            "/recovery/trigger",
            r#"{"actions": "restart-encoder"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
