//! Startup checks for the relay agent
//!
//! Verifies the encoder tools are runnable before the agent starts and
//! whether the hardware encoder the planner may select is actually built in.

use crate::config::Config;
use crate::encode::video_encoder;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("ffprobe not available: {0}")]
    FfprobeUnavailable(String),
}

/// What the preflight found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolReport {
    pub ffmpeg_version: String,
    pub ffprobe_version: String,
    /// The configured codec's hardware encoder is listed by ffmpeg.
    pub hardware_encoder_available: bool,
}

/// Extract the version token from `<tool> -version` output
///
/// Handles both release ("ffmpeg version 7.1 ...") and git build
/// ("ffmpeg version n7.1-12-g...") formats.
pub fn parse_tool_version(output: &str, tool: &str) -> Option<String> {
    let marker = format!("{} version", tool);
    let line = output
        .lines()
        .find(|line| line.to_lowercase().contains(&marker))?;
    let rest = line.to_lowercase().split(&marker).nth(1)?.trim().to_string();
    rest.split_whitespace().next().map(str::to_string)
}

/// Whether `ffmpeg -encoders` output lists `name`.
pub fn encoder_listed(encoders_output: &str, name: &str) -> bool {
    encoders_output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|encoder| encoder == name)
}

async fn tool_version(binary: &str, tool: &str) -> Result<String, String> {
    let output = Command::new(binary)
        .arg("-version")
        .output()
        .await
        .map_err(|e| format!("{} -version failed; is it installed and in PATH? Error: {}", binary, e))?;

    if !output.status.success() {
        return Err(format!("{} -version exited with {}", binary, output.status));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_tool_version(&stdout, tool).ok_or_else(|| {
        format!(
            "could not parse version from: {}",
            stdout.lines().next().unwrap_or("(empty)")
        )
    })
}

async fn hardware_encoder_available(ffmpeg: &str, encoder: &str) -> bool {
    match Command::new(ffmpeg)
        .args(["-hide_banner", "-encoders"])
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            encoder_listed(&String::from_utf8_lossy(&output.stdout), encoder)
        }
        Ok(_) | Err(_) => false,
    }
}

/// Run all startup checks in order
///
/// 1. ffmpeg runs and reports a version
/// 2. ffprobe runs and reports a version
/// 3. hardware encoder lookup, only when hardware acceleration is configured
pub async fn run_startup_checks(cfg: &Config) -> Result<ToolReport, StartupError> {
    let ffmpeg_version = tool_version(&cfg.encoder.ffmpeg_binary, "ffmpeg")
        .await
        .map_err(StartupError::FfmpegUnavailable)?;
    let ffprobe_version = tool_version(&cfg.encoder.ffprobe_binary, "ffprobe")
        .await
        .map_err(StartupError::FfprobeUnavailable)?;
    info!(ffmpeg = %ffmpeg_version, ffprobe = %ffprobe_version, "encoder tools found");

    let hardware_encoder_available = if cfg.encode.hardware_acceleration {
        let encoder = video_encoder(&cfg.encode.codec, true);
        let available = hardware_encoder_available(&cfg.encoder.ffmpeg_binary, encoder).await;
        if !available {
            warn!(encoder, "hardware encoder not available in this ffmpeg build");
        }
        available
    } else {
        false
    };

    Ok(ToolReport {
        ffmpeg_version,
        ffprobe_version,
        hardware_encoder_available,
    })
}
