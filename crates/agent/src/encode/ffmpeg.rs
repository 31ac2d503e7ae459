//! FFmpeg encoder module for the relay agent
//!
//! Builds the ffmpeg command for an encode profile and runs it as a
//! supervised child process whose stdout feeds the downstream sink.

use async_trait::async_trait;
use bytes::BytesMut;
use std::process::{Command, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::process::{
    take_line, EncodeJob, EncoderHandle, EncoderLauncher, ExitInfo, LaunchError, LaunchedEncoder,
    ProcessCommand,
};

/// Audio is always re-encoded to Opus for the voice transport.
const AUDIO_ARGS: &[&str] = &["-c:a", "libopus", "-b:a", "128k", "-ar", "48000", "-ac", "2"];

/// Container written to stdout.
const OUTPUT_FORMAT: &str = "nut";

const OUTPUT_CHANNEL_CAPACITY: usize = 64;
const DIAGNOSTIC_CHANNEL_CAPACITY: usize = 256;
const READ_CHUNK: usize = 64 * 1024;

/// Pick the ffmpeg video encoder for a codec name.
///
/// Unknown codecs fall back to H.264.
pub fn video_encoder(codec: &str, hardware_accel: bool) -> &'static str {
    match (codec.to_lowercase().as_str(), hardware_accel) {
        ("hevc" | "h265", true) => "hevc_nvenc",
        ("hevc" | "h265", false) => "libx265",
        ("av1", true) => "av1_nvenc",
        ("av1", false) => "libsvtav1",
        (_, true) => "h264_nvenc",
        (_, false) => "libx264",
    }
}

fn is_network_source(url: &str) -> bool {
    let lower = url.to_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Build an ffmpeg command for an encode job
///
/// Creates a Command configured with:
/// - Real-time input pacing, with reconnect options for HTTP sources
/// - First video and optional first audio stream
/// - Video encoder picked from codec and hardware flag, CBR-style rate control
///   (`-b:v`, `-maxrate`, `-bufsize` = 2x max)
/// - Scale and frame-rate from the profile, 2 second GOP
/// - Opus audio, NUT container on stdout
/// - Progress statistics on stderr once per second
pub fn build_ffmpeg_command(binary: &str, job: &EncodeJob) -> Command {
    let profile = &job.profile;
    let mut cmd = Command::new(binary);

    cmd.args(["-hide_banner", "-nostdin", "-loglevel", "info"]);
    cmd.args(["-stats", "-stats_period", "1"]);

    if is_network_source(&job.source_url) {
        cmd.args([
            "-reconnect",
            "1",
            "-reconnect_streamed",
            "1",
            "-reconnect_delay_max",
            "5",
        ]);
    }

    cmd.arg("-re").arg("-i").arg(&job.source_url);
    cmd.args(["-map", "0:v:0", "-map", "0:a:0?"]);

    let encoder = video_encoder(&profile.codec, profile.hardware_accel);
    cmd.arg("-c:v").arg(encoder);
    if profile.hardware_accel {
        cmd.args(["-preset", "p4", "-tune", "ll"]);
    } else {
        cmd.args(["-preset", "veryfast", "-tune", "zerolatency"]);
    }

    cmd.arg("-b:v").arg(format!("{}k", profile.bitrate_kbps));
    cmd.arg("-maxrate").arg(format!("{}k", profile.max_bitrate_kbps));
    cmd.arg("-bufsize")
        .arg(format!("{}k", profile.max_bitrate_kbps * 2));

    cmd.arg("-vf")
        .arg(format!("scale={}:{}", profile.width, profile.height));
    cmd.arg("-r").arg(profile.fps.to_string());
    cmd.arg("-g").arg((profile.fps * 2).to_string());
    cmd.args(["-pix_fmt", "yuv420p"]);

    cmd.args(AUDIO_ARGS);
    cmd.arg("-f").arg(OUTPUT_FORMAT).arg("pipe:1");

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    cmd
}

/// Launches ffmpeg child processes.
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    binary: String,
}

impl FfmpegLauncher {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl EncoderLauncher for FfmpegLauncher {
    async fn launch(&self, job: &EncodeJob) -> Result<LaunchedEncoder, LaunchError> {
        let mut cmd = tokio::process::Command::from(build_ffmpeg_command(&self.binary, job));
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id();

        let mut stdout = child
            .stdout
            .take()
            .ok_or(LaunchError::MissingPipe("stdout"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or(LaunchError::MissingPipe("stderr"))?;

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (diag_tx, diag_rx) = mpsc::channel(DIAGNOSTIC_CHANNEL_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(4);
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(async move {
            loop {
                let mut buf = BytesMut::with_capacity(READ_CHUNK);
                match stdout.read_buf(&mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if output_tx.send(buf.freeze()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("encoder stdout closed: {}", e);
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(4096);
            loop {
                let read = stderr.read_buf(&mut buf).await;
                while let Some(line) = take_line(&mut buf) {
                    if diag_tx.send(line).await.is_err() {
                        return;
                    }
                }
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            let rest = String::from_utf8_lossy(&buf).trim().to_string();
            if !rest.is_empty() {
                let _ = diag_tx.send(rest).await;
            }
        });

        tokio::spawn(supervise(child, control_rx, exit_tx));

        debug!(pid, source = %job.source_url, "encoder launched");

        Ok(LaunchedEncoder {
            handle: EncoderHandle::new(pid, control_tx, exit_rx),
            output: output_rx,
            diagnostics: diag_rx,
        })
    }
}

/// Own the child until it exits, honouring terminate requests.
///
/// A dropped handle counts as a terminate request with no grace.
async fn supervise(
    mut child: Child,
    mut control: mpsc::Receiver<ProcessCommand>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        command = control.recv() => {
            let grace = match command {
                Some(ProcessCommand::Terminate { grace }) => grace,
                None => Duration::ZERO,
            };
            send_terminate_signal(&mut child);
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(pid = child.id(), "encoder ignored termination signal, killing");
                    let _ = child.start_kill();
                    child.wait().await
                }
            }
        }
    };

    let info = match status {
        Ok(status) => ExitInfo::from(status),
        Err(e) => {
            warn!("failed to reap encoder: {}", e);
            ExitInfo {
                code: None,
                signal: None,
            }
        }
    };
    exit_tx.send_replace(Some(info));
}

#[cfg(unix)]
fn send_terminate_signal(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, "SIGTERM failed ({}), killing", e);
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn send_terminate_signal(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::EncodeProfile;
    use proptest::prelude::*;
    use std::ffi::OsStr;

    /// Helper to convert Command args to a Vec of strings for easier testing
    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    /// Helper to check if args contain a flag with a specific value
    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn job(url: &str, hw: bool) -> EncodeJob {
        EncodeJob {
            source_url: url.to_string(),
            profile: EncodeProfile {
                width: 1920,
                height: 1080,
                fps: 60,
                bitrate_kbps: 5600,
                max_bitrate_kbps: 7280,
                codec: "h264".to_string(),
                hardware_accel: hw,
            },
        }
    }

    // The built command carries every profile parameter.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_command_completeness(
            half_width in 8u32..1280,
            half_height in 8u32..720,
            fps in 15u32..120,
            bitrate in 500u32..20000,
            hw in proptest::bool::ANY,
        ) {
            let profile = EncodeProfile {
                width: half_width * 2,
                height: half_height * 2,
                fps,
                bitrate_kbps: bitrate,
                max_bitrate_kbps: bitrate + bitrate / 3,
                codec: "h264".to_string(),
                hardware_accel: hw,
            };
            let job = EncodeJob { source_url: "/media/input.mkv".to_string(), profile: profile.clone() };

            let cmd = build_ffmpeg_command("ffmpeg", &job);
            let args = get_command_args(&cmd);

            prop_assert_eq!(cmd.get_program(), OsStr::new("ffmpeg"));
            let encoder = if hw { "h264_nvenc" } else { "libx264" };
            let expected = [
                ("-i", "/media/input.mkv".to_string()),
                ("-b:v", format!("{}k", profile.bitrate_kbps)),
                ("-maxrate", format!("{}k", profile.max_bitrate_kbps)),
                ("-bufsize", format!("{}k", profile.max_bitrate_kbps * 2)),
                ("-vf", format!("scale={}:{}", profile.width, profile.height)),
                ("-r", fps.to_string()),
                ("-g", (fps * 2).to_string()),
                ("-c:v", encoder.to_string()),
                ("-f", "nut".to_string()),
            ];
            for (flag, value) in &expected {
                let present = has_flag_with_value(&args, flag, value);
                prop_assert!(present, "missing {} {} in {:?}", flag, value, args);
            }
            prop_assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
        }
    }

    #[test]
    fn test_http_sources_get_reconnect_options() {
        let args = get_command_args(&build_ffmpeg_command("ffmpeg", &job("https://cdn.example/live.m3u8", false)));
        assert!(has_flag_with_value(&args, "-reconnect", "1"));
        assert!(has_flag_with_value(&args, "-reconnect_streamed", "1"));

        let args = get_command_args(&build_ffmpeg_command("ffmpeg", &job("/media/file.mkv", false)));
        assert!(!args.iter().any(|a| a == "-reconnect"));
    }

    #[test]
    fn test_input_precedes_output_options() {
        let args = get_command_args(&build_ffmpeg_command("ffmpeg", &job("/media/file.mkv", true)));
        let input = args.iter().position(|a| a == "-i").unwrap();
        let codec = args.iter().position(|a| a == "-c:v").unwrap();
        assert!(input < codec);
        assert!(has_flag_with_value(&args, "-preset", "p4"));
    }

    #[test]
    fn test_video_encoder_selection() {
        assert_eq!(video_encoder("h264", true), "h264_nvenc");
        assert_eq!(video_encoder("H264", false), "libx264");
        assert_eq!(video_encoder("hevc", true), "hevc_nvenc");
        assert_eq!(video_encoder("h265", false), "libx265");
        assert_eq!(video_encoder("av1", false), "libsvtav1");
        assert_eq!(video_encoder("vp9", false), "libx264");
    }

    #[tokio::test]
    async fn test_launch_missing_binary_fails() {
        let launcher = FfmpegLauncher::new("/nonexistent/ffmpeg-binary");
        let result = launcher.launch(&job("/media/file.mkv", false)).await;
        assert!(matches!(result, Err(LaunchError::Spawn(_))));
    }
}
