//! Relay agent dashboard TUI
//!
//! Terminal interface for real-time monitoring of the relay agent's health,
//! stream quality and recovery activity.
//! Polls the agent's detailed health endpoint, by default
//! http://127.0.0.1:7878/health/detailed (override with `RTOP_URL`).

use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Cell, Chart, Dataset, Gauge, Paragraph, Row, Table, Wrap},
    Frame, Terminal,
};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, VecDeque},
    io::{self, Stdout},
    time::{Duration, Instant},
};

const DEFAULT_URL: &str = "http://127.0.0.1:7878/health/detailed";
const POLL_INTERVAL_MS: u64 = 1000;
const MAX_SCORE_POINTS: usize = 120;
const MAX_EVENT_LOG_ENTRIES: usize = 100;

// ============================================================================
// Data Models (mirroring the agent's /health/detailed document)
// ============================================================================

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct CheckOutcome {
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct HealthCheckResult {
    pub status: String,
    pub checks: BTreeMap<String, CheckOutcome>,
    pub timestamp_unix_ms: i64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct HealthMetrics {
    pub uptime_secs: u64,
    pub memory_rss_mb: u64,
    pub memory_used_percent: f32,
    pub cpu_usage_percent: f32,
    pub connection_connected: bool,
    pub connection_latency_ms: Option<u64>,
    pub voice_connected: bool,
    pub streaming: bool,
    pub encoder_running: bool,
    pub error_count: u64,
    pub warning_count: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct EncodeProfile {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub codec: String,
    pub hardware_accel: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SessionInfo {
    pub id: String,
    pub source_url: String,
    pub profile: EncodeProfile,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SwitcherStatus {
    pub state: String,
    pub session: Option<SessionInfo>,
    pub pid: Option<u32>,
    pub ended: bool,
    pub draining: usize,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StreamHealthStatus {
    pub status: String,
    pub score: u8,
    pub phase: String,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StreamQualityMetrics {
    pub frame_rate: f64,
    pub bitrate_kbps: f64,
    pub dropped_frames: u64,
    pub encoding_speed: f64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct QualitySample {
    pub timestamp_unix_ms: i64,
    pub score: u8,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StreamDetail {
    pub latest: Option<StreamHealthStatus>,
    pub metrics: Option<StreamQualityMetrics>,
    pub history: Vec<QualitySample>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RecoveryStats {
    pub total_attempts: u64,
    pub successful_attempts: u64,
    pub failed_attempts: u64,
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub in_progress: bool,
    pub attempts_last_hour: usize,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RecoveryAttempt {
    pub action: String,
    pub timestamp_unix_ms: i64,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// The detailed status document
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct DetailedStatus {
    pub status: String,
    pub uptime_secs: u64,
    pub health: Option<HealthCheckResult>,
    pub metrics: HealthMetrics,
    pub switcher: SwitcherStatus,
    pub stream: StreamDetail,
    pub recovery: RecoveryStats,
    pub recovery_history: Vec<RecoveryAttempt>,
}

// ============================================================================
// App State
// ============================================================================

/// Main application state for the TUI dashboard
pub struct App {
    /// Latest status document from the agent
    pub status: Option<DetailedStatus>,
    /// Event log with recent state changes and recovery attempts
    pub event_log: VecDeque<String>,
    /// Quality score history for chart (elapsed_secs, score)
    pub score_history: VecDeque<(f64, f64)>,
    /// Newest recovery attempt already logged
    last_attempt_ms: i64,
    /// Connection status
    pub connected: bool,
    url: String,
    /// HTTP client for status fetching
    client: reqwest::Client,
    /// Start time for score chart x-axis
    start_time: Instant,
}

impl App {
    /// Create a new App instance
    pub fn new(url: String) -> Self {
        Self {
            status: None,
            event_log: VecDeque::with_capacity(MAX_EVENT_LOG_ENTRIES),
            score_history: VecDeque::with_capacity(MAX_SCORE_POINTS),
            last_attempt_ms: 0,
            connected: false,
            url,
            client: reqwest::Client::new(),
            start_time: Instant::now(),
        }
    }

    /// Add an event to the log
    pub fn log_event(&mut self, event: String) {
        if self.event_log.len() >= MAX_EVENT_LOG_ENTRIES {
            self.event_log.pop_front();
        }
        self.event_log.push_back(event);
    }

    /// Fetch the status document from the agent
    ///
    /// The endpoint answers 200 even when the agent is unhealthy, so any
    /// other status is logged as an error.
    pub async fn fetch_status(&mut self) {
        match self.client.get(&self.url).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    match response.json::<DetailedStatus>().await {
                        Ok(status) => {
                            let elapsed = self.start_time.elapsed().as_secs_f64();
                            self.ingest(status, elapsed);
                            self.connected = true;
                        }
                        Err(e) => {
                            self.log_event(format!("JSON parse error: {}", e));
                            self.connected = false;
                        }
                    }
                } else {
                    self.log_event(format!("HTTP error: {}", response.status()));
                    self.connected = false;
                }
            }
            Err(e) => {
                if self.connected {
                    self.log_event(format!("Connection lost: {}", e));
                }
                self.connected = false;
            }
        }
    }

    /// Log what changed since the previous document and record the score.
    pub fn ingest(&mut self, status: DetailedStatus, elapsed_secs: f64) {
        if let Some(previous) = self.status.take() {
            if previous.status != status.status {
                self.log_event(format!("health: {} -> {}", previous.status, status.status));
            }
            if previous.switcher.state != status.switcher.state {
                self.log_event(format!(
                    "stream: {} -> {}",
                    previous.switcher.state, status.switcher.state
                ));
            }
        }

        let new_attempts: Vec<String> = status
            .recovery_history
            .iter()
            .filter(|a| a.timestamp_unix_ms > self.last_attempt_ms)
            .map(|a| match &a.error {
                None => format!("recovery {} ok ({}ms)", a.action, a.duration_ms),
                Some(e) => format!("recovery {} failed: {}", a.action, e),
            })
            .collect();
        for entry in new_attempts {
            self.log_event(entry);
        }
        if let Some(newest) = status.recovery_history.iter().map(|a| a.timestamp_unix_ms).max() {
            self.last_attempt_ms = self.last_attempt_ms.max(newest);
        }

        if let Some(latest) = &status.stream.latest {
            if self.score_history.len() >= MAX_SCORE_POINTS {
                self.score_history.pop_front();
            }
            self.score_history
                .push_back((elapsed_secs, latest.score as f64));
        }

        self.status = Some(status);
    }
}

// ============================================================================
// Terminal Setup/Teardown
// ============================================================================

/// Initialize the terminal for TUI rendering
fn setup_terminal() -> io::Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

/// Restore terminal to normal state
fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

// ============================================================================
// Widget Rendering
// ============================================================================

fn status_color(status: &str) -> Color {
    match status {
        "pass" | "healthy" | "excellent" | "good" | "live" => Color::Green,
        "warn" | "degraded" | "switching" | "starting" => Color::Yellow,
        "fail" | "unhealthy" | "poor" | "critical" | "aborted" => Color::Red,
        _ => Color::Gray,
    }
}

/// Render the health checks table
fn render_checks_table(f: &mut Frame, area: Rect, app: &App) {
    let header_cells = ["Check", "Status", "Detail"]
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)));
    let header = Row::new(header_cells).height(1).bottom_margin(1);

    let rows: Vec<Row> = app
        .status
        .as_ref()
        .and_then(|s| s.health.as_ref())
        .map(|health| {
            health
                .checks
                .iter()
                .map(|(name, check)| {
                    Row::new(vec![
                        Cell::from(name.clone()),
                        Cell::from(check.status.clone())
                            .style(Style::default().fg(status_color(&check.status))),
                        Cell::from(check.message.clone()),
                    ])
                })
                .collect()
        })
        .unwrap_or_default();

    let widths = [
        Constraint::Length(12),
        Constraint::Length(8),
        Constraint::Min(20),
    ];

    let title = if app.connected {
        " Health Checks "
    } else {
        " Health Checks (Disconnected) "
    };

    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title));

    f.render_widget(table, area);
}

/// Render CPU and memory usage gauges
fn render_system_gauges(f: &mut Frame, area: Rect, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Min(0),
        ])
        .split(area);

    let (cpu_percent, mem_percent, rss_mb) = if let Some(ref status) = app.status {
        (
            status.metrics.cpu_usage_percent as f64 / 100.0,
            status.metrics.memory_used_percent as f64 / 100.0,
            status.metrics.memory_rss_mb,
        )
    } else {
        (0.0, 0.0, 0)
    };

    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(" CPU "))
        .gauge_style(Style::default().fg(Color::Cyan))
        .ratio(cpu_percent.clamp(0.0, 1.0))
        .label(format!("{:.1}%", cpu_percent * 100.0));

    let mem_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(" Memory "))
        .gauge_style(Style::default().fg(Color::Magenta))
        .ratio(mem_percent.clamp(0.0, 1.0))
        .label(format!("{:.1}% (agent {} MB)", mem_percent * 100.0, rss_mb));

    f.render_widget(cpu_gauge, chunks[0]);
    f.render_widget(mem_gauge, chunks[1]);
}

/// Render the current stream: session, profile and quality
fn render_stream_panel(f: &mut Frame, area: Rect, app: &App) {
    let mut lines = Vec::new();
    if let Some(ref status) = app.status {
        let state = status.switcher.state.as_str();
        lines.push(Line::from(vec![
            Span::raw("State: "),
            Span::styled(state.to_string(), Style::default().fg(status_color(state))),
            Span::raw(match (status.switcher.pid, status.switcher.ended) {
                (Some(pid), _) => format!("  pid {}", pid),
                (None, true) => "  source finished".to_string(),
                (None, false) => String::new(),
            }),
        ]));
        if let Some(ref session) = status.switcher.session {
            let p = &session.profile;
            lines.push(Line::from(format!("Source: {}", session.source_url)));
            lines.push(Line::from(format!(
                "Profile: {}x{}@{} {}k {}{}",
                p.width,
                p.height,
                p.fps,
                p.bitrate_kbps,
                p.codec,
                if p.hardware_accel { " (hw)" } else { "" }
            )));
        }
        if let Some(ref latest) = status.stream.latest {
            lines.push(Line::from(vec![
                Span::raw("Quality: "),
                Span::styled(
                    format!("{} ({})", latest.status, latest.score),
                    Style::default().fg(status_color(&latest.status)),
                ),
                Span::raw(format!("  {}", latest.phase)),
            ]));
            for issue in &latest.issues {
                lines.push(Line::from(format!("  - {}", issue)));
            }
        }
        if let Some(ref m) = status.stream.metrics {
            lines.push(Line::from(format!(
                "{:.1} fps | {:.0} kbps | {:.2}x | {} dropped",
                m.frame_rate, m.bitrate_kbps, m.encoding_speed, m.dropped_frames
            )));
        }
    } else {
        lines.push(Line::from("No data"));
    }

    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title(" Stream "))
        .wrap(Wrap { trim: true });

    f.render_widget(paragraph, area);
}

/// Render quality score chart
fn render_score_chart(f: &mut Frame, area: Rect, app: &App) {
    let data: Vec<(f64, f64)> = app.score_history.iter().cloned().collect();

    if data.is_empty() {
        let block = Block::default()
            .borders(Borders::ALL)
            .title(" Quality Score ");
        f.render_widget(block, area);
        return;
    }

    let min_x = data.first().map(|(x, _)| *x).unwrap_or(0.0);
    let max_x = data.last().map(|(x, _)| *x).unwrap_or(60.0).max(min_x + 1.0);

    let datasets = vec![Dataset::default()
        .name("score")
        .marker(symbols::Marker::Braille)
        .style(Style::default().fg(Color::Green))
        .data(&data)];

    let chart = Chart::new(datasets)
        .block(Block::default().borders(Borders::ALL).title(" Quality Score "))
        .x_axis(
            Axis::default()
                .title("Time (s)")
                .style(Style::default().fg(Color::Gray))
                .bounds([min_x, max_x])
                .labels(vec![
                    Span::raw(format!("{:.0}", min_x)),
                    Span::raw(format!("{:.0}", max_x)),
                ]),
        )
        .y_axis(
            Axis::default()
                .style(Style::default().fg(Color::Gray))
                .bounds([0.0, 100.0])
                .labels(vec![Span::raw("0"), Span::raw("50"), Span::raw("100")]),
        );

    f.render_widget(chart, area);
}

/// Render event log showing state changes and recovery attempts
fn render_event_log(f: &mut Frame, area: Rect, app: &App) {
    let events: Vec<Line> = app
        .event_log
        .iter()
        .rev()
        .take((area.height as usize).saturating_sub(2))
        .map(|e| Line::from(e.as_str()))
        .collect();

    let paragraph = Paragraph::new(events)
        .block(Block::default().borders(Borders::ALL).title(" Event Log "))
        .wrap(Wrap { trim: true });

    f.render_widget(paragraph, area);
}

/// Render status bar with aggregate stats
fn render_status_bar(f: &mut Frame, area: Rect, app: &App) {
    let status = if let Some(ref status) = app.status {
        let r = &status.recovery;
        format!(
            " {} | Up: {} | Errors: {} | Recovery: {}/{} ok, {} last hour{} | Press 'q' to quit ",
            status.status,
            format_duration(status.uptime_secs),
            status.metrics.error_count,
            r.successful_attempts,
            r.total_attempts,
            r.attempts_last_hour,
            if r.in_progress { ", running" } else { "" }
        )
    } else {
        " Connecting to agent... | Press 'q' to quit ".to_string()
    };

    let paragraph = Paragraph::new(status)
        .style(Style::default().fg(Color::White).bg(Color::DarkGray));

    f.render_widget(paragraph, area);
}

/// Format duration in seconds to human-readable string
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

// ============================================================================
// Main UI Layout
// ============================================================================

/// Render the complete UI layout
fn ui(f: &mut Frame, app: &App) {
    let size = f.area();

    // Main layout: status bar at bottom, rest for content
    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(size);

    // Content area: left panel (checks + events) and right panel (system + stream)
    let content_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
        .split(main_chunks[0]);

    let left_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(9), Constraint::Min(0)])
        .split(content_chunks[0]);

    let right_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(6),  // CPU + Memory gauges
            Constraint::Length(9),  // Stream panel
            Constraint::Min(0),     // Score chart
        ])
        .split(content_chunks[1]);

    render_checks_table(f, left_chunks[0], app);
    render_event_log(f, left_chunks[1], app);
    render_system_gauges(f, right_chunks[0], app);
    render_stream_panel(f, right_chunks[1], app);
    render_score_chart(f, right_chunks[2], app);
    render_status_bar(f, main_chunks[1], app);
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> io::Result<()> {
    let url = std::env::var("RTOP_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());

    // Initialize terminal
    let mut terminal = setup_terminal()?;

    let mut app = App::new(url);
    app.log_event("Relay dashboard started".to_string());

    let result = run_app(&mut terminal, &mut app).await;

    // Restore terminal
    restore_terminal(&mut terminal)?;

    result
}

/// Main application loop
async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut App,
) -> io::Result<()> {
    let poll_interval = Duration::from_millis(POLL_INTERVAL_MS);
    let mut last_fetch = Instant::now() - poll_interval; // Fetch immediately on start

    loop {
        if last_fetch.elapsed() >= poll_interval {
            app.fetch_status().await;
            last_fetch = Instant::now();
        }

        terminal.draw(|f| ui(f, app))?;

        // Handle input with a short timeout to allow frequent redraws
        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => {
                            return Ok(());
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}
