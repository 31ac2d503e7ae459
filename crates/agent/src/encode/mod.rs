//! Encoding modules for the relay agent

pub mod ffmpeg;
pub mod process;

pub use ffmpeg::{build_ffmpeg_command, video_encoder, FfmpegLauncher};
pub use process::{
    EncodeJob, EncoderHandle, EncoderLauncher, ExitInfo, LaunchError, LaunchedEncoder,
    ProcessCommand,
};
