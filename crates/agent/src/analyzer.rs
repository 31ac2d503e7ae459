//! Source stream analysis.
//!
//! Probes a source URL with ffprobe under a hard timeout and reduces the
//! output to the handful of properties the planner needs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::planner::{MAX_FPS, MIN_FPS};

/// Fallback geometry when the probe reports none.
const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 720;
const DEFAULT_FPS: f64 = 30.0;

/// Every way a probe can go wrong collapses into this one error; callers fall
/// back to a configured or last-known profile.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProbeError {
    #[error("probe failed: {0}")]
    ProbeFailed(String),
}

/// Media properties of the first video stream of a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub width: u32,
    pub height: u32,
    /// Frame rate clamped to [15, 120].
    pub fps: f64,
    pub bitrate_kbps: Option<u32>,
    pub codec: Option<String>,
    pub duration_secs: Option<f64>,
}

/// Anything that can describe a source URL.
#[async_trait]
pub trait SourceProber: Send + Sync {
    async fn analyze(&self, url: &str) -> Result<ProbeResult, ProbeError>;
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub r_frame_rate: Option<String>,
        pub avg_frame_rate: Option<String>,
        pub bit_rate: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub bit_rate: Option<String>,
    }
}

/// ffprobe-backed analyzer.
#[derive(Debug, Clone)]
pub struct StreamAnalyzer {
    ffprobe_binary: String,
    timeout: Duration,
}

impl StreamAnalyzer {
    pub fn new(ffprobe_binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ffprobe_binary: ffprobe_binary.into(),
            timeout,
        }
    }

    fn build_command(&self, url: &str) -> Command {
        let mut cmd = Command::new(&self.ffprobe_binary);
        cmd.args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=codec_type,codec_name,width,height,r_frame_rate,avg_frame_rate,bit_rate:format=duration,bit_rate",
            "-of",
            "json",
        ])
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // a timed-out or cancelled probe must not outlive its future
        .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl SourceProber for StreamAnalyzer {
    async fn analyze(&self, url: &str) -> Result<ProbeResult, ProbeError> {
        let mut cmd = self.build_command(url);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                ProbeError::ProbeFailed(format!("timed out after {}s", self.timeout.as_secs()))
            })?
            .map_err(|e| ProbeError::ProbeFailed(format!("could not run ffprobe: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::ProbeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let result = parse_probe_output(&stdout)?;
        debug!(
            url,
            width = result.width,
            height = result.height,
            fps = result.fps,
            "source probed"
        );
        Ok(result)
    }
}

/// Parses ffprobe JSON output into a ProbeResult.
pub fn parse_probe_output(json_str: &str) -> Result<ProbeResult, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput = serde_json::from_str(json_str)
        .map_err(|e| ProbeError::ProbeFailed(format!("malformed ffprobe output: {}", e)))?;

    let stream = ffprobe
        .streams
        .unwrap_or_default()
        .into_iter()
        .find(|s| s.codec_type.as_deref().map_or(true, |t| t == "video"))
        .ok_or_else(|| ProbeError::ProbeFailed("no video stream".to_string()))?;

    let fps = stream
        .r_frame_rate
        .as_deref()
        .and_then(parse_rational)
        .or_else(|| stream.avg_frame_rate.as_deref().and_then(parse_rational))
        .unwrap_or(DEFAULT_FPS)
        .clamp(MIN_FPS as f64, MAX_FPS as f64);

    let format_bitrate = ffprobe.format.as_ref().and_then(|f| f.bit_rate.as_deref());
    let bitrate_kbps = stream
        .bit_rate
        .as_deref()
        .or(format_bitrate)
        .and_then(|br| br.parse::<f64>().ok())
        .map(|bps| (bps / 1000.0).round() as u32);

    let duration_secs = ffprobe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0);

    Ok(ProbeResult {
        width: stream.width.filter(|w| *w > 0).unwrap_or(DEFAULT_WIDTH),
        height: stream.height.filter(|h| *h > 0).unwrap_or(DEFAULT_HEIGHT),
        fps,
        bitrate_kbps,
        codec: stream.codec_name,
        duration_secs,
    })
}

/// Parse an ffprobe rational such as `30000/1001`; `0/0` yields None.
fn parse_rational(value: &str) -> Option<f64> {
    let rate = match value.split_once('/') {
        Some((num, den)) => {
            let num = num.trim().parse::<f64>().ok()?;
            let den = den.trim().parse::<f64>().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => value.trim().parse::<f64>().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe_output_basic() {
        let json = r#"{
            "streams": [{
                "codec_type": "video",
                "codec_name": "hevc",
                "width": 3840,
                "height": 2160,
                "r_frame_rate": "60/1",
                "avg_frame_rate": "60/1",
                "bit_rate": "12000000"
            }],
            "format": { "duration": "7200.5", "bit_rate": "12500000" }
        }"#;

        let result = parse_probe_output(json).unwrap();
        assert_eq!(result.width, 3840);
        assert_eq!(result.height, 2160);
        assert_eq!(result.fps, 60.0);
        assert_eq!(result.bitrate_kbps, Some(12000));
        assert_eq!(result.codec.as_deref(), Some("hevc"));
        assert_eq!(result.duration_secs, Some(7200.5));
    }

    #[test]
    fn test_real_frame_rate_preferred_over_average() {
        let json = r#"{
            "streams": [{ "codec_type": "video", "r_frame_rate": "30000/1001", "avg_frame_rate": "24/1" }],
            "format": {}
        }"#;
        let result = parse_probe_output(json).unwrap();
        assert!((result.fps - 29.97).abs() < 0.01);
    }

    #[test]
    fn test_average_frame_rate_fallback() {
        let json = r#"{
            "streams": [{ "codec_type": "video", "r_frame_rate": "0/0", "avg_frame_rate": "25/1" }],
            "format": {}
        }"#;
        let result = parse_probe_output(json).unwrap();
        assert_eq!(result.fps, 25.0);
    }

    #[test]
    fn test_frame_rate_is_clamped() {
        let json = r#"{ "streams": [{ "codec_type": "video", "r_frame_rate": "240/1" }] }"#;
        assert_eq!(parse_probe_output(json).unwrap().fps, 120.0);

        let json = r#"{ "streams": [{ "codec_type": "video", "r_frame_rate": "5/1" }] }"#;
        assert_eq!(parse_probe_output(json).unwrap().fps, 15.0);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let json = r#"{ "streams": [{ "codec_type": "video" }], "format": { "duration": "N/A" } }"#;
        let result = parse_probe_output(json).unwrap();
        assert_eq!((result.width, result.height), (1280, 720));
        assert_eq!(result.fps, 30.0);
        assert_eq!(result.bitrate_kbps, None);
        assert_eq!(result.codec, None);
        assert_eq!(result.duration_secs, None);
    }

    #[test]
    fn test_format_bitrate_fallback() {
        let json = r#"{
            "streams": [{ "codec_type": "video", "width": 1920, "height": 1080 }],
            "format": { "bit_rate": "6000000" }
        }"#;
        assert_eq!(parse_probe_output(json).unwrap().bitrate_kbps, Some(6000));
    }

    #[test]
    fn test_no_video_stream_is_probe_failure() {
        let json = r#"{ "streams": [], "format": {} }"#;
        assert!(matches!(parse_probe_output(json), Err(ProbeError::ProbeFailed(_))));
    }

    #[test]
    fn test_malformed_output_is_probe_failure() {
        let err = parse_probe_output("not json").unwrap_err();
        assert!(err.to_string().contains("malformed"));
    }

    #[test]
    fn test_parse_rational() {
        assert_eq!(parse_rational("60/1"), Some(60.0));
        assert_eq!(parse_rational("0/0"), None);
        assert_eq!(parse_rational("25"), Some(25.0));
        assert_eq!(parse_rational("abc"), None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_probe_failure() {
        let analyzer = StreamAnalyzer::new(
            "/nonexistent/ffprobe-binary",
            Duration::from_secs(1),
        );
        let result = analyzer.analyze("http://example.invalid/stream").await;
        assert!(matches!(result, Err(ProbeError::ProbeFailed(_))));
    }
}
