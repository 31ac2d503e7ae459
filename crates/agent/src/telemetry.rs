//! Encoder diagnostic line parser.
//!
//! Turns one line of encoder diagnostic output into a typed record. Lines
//! that carry nothing useful come back as `ParseFailed` and are ignored by
//! the caller.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;

/// Substrings that mark a diagnostic line as an error.
const ERROR_MARKERS: &[&str] = &[
    "error",
    "invalid data",
    "conversion failed",
    "connection refused",
    "connection reset",
    "no such file",
    "broken pipe",
    "could not",
];

const WARNING_MARKERS: &[&str] = &[
    "warning",
    "deprecated",
    "past duration",
    "non-monotonous dts",
    "non-monotonic",
    "dropping",
];

const END_MARKERS: &[&str] = &["Exiting normally", "muxing overhead"];

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("unrecognized telemetry line")]
pub struct ParseFailed;

/// One periodic progress report.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProgressSample {
    pub frame: u64,
    pub fps: f64,
    pub quality: Option<f64>,
    pub size_kb: Option<u64>,
    pub time_secs: Option<f64>,
    pub bitrate_kbps: Option<f64>,
    pub speed: Option<f64>,
    pub dup: u64,
    pub drop: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryLine {
    Progress(ProgressSample),
    /// Video geometry from a stream description line.
    Resolution { width: u32, height: u32 },
    EndOfStream,
    Error(String),
    Warning(String),
}

fn field_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([A-Za-z]+)=\s*(\S+)").expect("field pattern is valid"))
}

fn resolution_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Stream #\d+:\d+.*Video:.*?\b(\d{2,5})x(\d{2,5})\b")
            .expect("resolution pattern is valid")
    })
}

pub fn parse_line(line: &str) -> Result<TelemetryLine, ParseFailed> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ParseFailed);
    }

    if let Some(progress) = parse_progress(line) {
        return Ok(TelemetryLine::Progress(progress));
    }

    if let Some(caps) = resolution_regex().captures(line) {
        let width = caps[1].parse().map_err(|_| ParseFailed)?;
        let height = caps[2].parse().map_err(|_| ParseFailed)?;
        return Ok(TelemetryLine::Resolution { width, height });
    }

    if END_MARKERS.iter().any(|m| line.contains(m)) {
        return Ok(TelemetryLine::EndOfStream);
    }

    let lower = line.to_lowercase();
    if ERROR_MARKERS.iter().any(|m| lower.contains(m)) {
        return Ok(TelemetryLine::Error(line.to_string()));
    }
    if WARNING_MARKERS.iter().any(|m| lower.contains(m)) {
        return Ok(TelemetryLine::Warning(line.to_string()));
    }

    Err(ParseFailed)
}

/// A progress line needs at least `frame=` and `fps=`.
fn parse_progress(line: &str) -> Option<ProgressSample> {
    let mut sample = ProgressSample::default();
    let mut has_frame = false;
    let mut has_fps = false;

    for caps in field_regex().captures_iter(line) {
        let value = &caps[2];
        match &caps[1] {
            "frame" => {
                sample.frame = value.parse().ok()?;
                has_frame = true;
            }
            "fps" => {
                sample.fps = value.parse().ok()?;
                has_fps = true;
            }
            "q" => sample.quality = value.parse().ok(),
            "size" | "Lsize" => sample.size_kb = parse_size_kb(value),
            "time" => sample.time_secs = parse_timestamp(value),
            "bitrate" => sample.bitrate_kbps = parse_bitrate_kbps(value),
            "speed" => sample.speed = value.trim_end_matches('x').parse().ok(),
            "dup" => sample.dup = value.parse().unwrap_or(0),
            "drop" => sample.drop = value.parse().unwrap_or(0),
            _ => {}
        }
    }

    (has_frame && has_fps).then_some(sample)
}

fn parse_size_kb(value: &str) -> Option<u64> {
    let digits = value.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    let amount: u64 = digits.parse().ok()?;
    let unit = &value[digits.len()..];
    match unit {
        "kB" | "KiB" | "" => Some(amount),
        "mB" | "MB" | "MiB" => amount.checked_mul(1024),
        "B" => Some(amount / 1024),
        _ => None,
    }
}

/// `HH:MM:SS.cc`, possibly negative right at start-up.
fn parse_timestamp(value: &str) -> Option<f64> {
    let (negative, value) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let mut parts = value.splitn(3, ':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    let total = hours * 3600.0 + minutes * 60.0 + seconds;
    Some(if negative { -total } else { total })
}

fn parse_bitrate_kbps(value: &str) -> Option<f64> {
    if let Some(kbits) = value.strip_suffix("kbits/s") {
        return kbits.parse().ok();
    }
    if let Some(mbits) = value.strip_suffix("Mbits/s") {
        return mbits.parse::<f64>().ok().map(|m| m * 1000.0);
    }
    None
}
