//! Handles to external encoding processes.
//!
//! A launched encoder is split into three parts: a control handle (owned by
//! the switcher), an output byte stream and a diagnostic line stream. The
//! handle talks to a per-process supervisor task over channels, so it can be
//! backed by a real child process or by a test double.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::planner::EncodeProfile;

/// What to encode: a source and the profile to encode it with.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeJob {
    pub source_url: String,
    pub profile: EncodeProfile,
}

/// Errors raised while launching an encoder.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn encoder: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("encoder pipe unavailable: {0}")]
    MissingPipe(&'static str),
}

/// Requests a supervisor task understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessCommand {
    /// Graceful signal first, hard kill once `grace` has elapsed.
    Terminate { grace: Duration },
}

/// How an encoder process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

/// Control handle for one running encoder.
#[derive(Debug)]
pub struct EncoderHandle {
    pid: Option<u32>,
    control: mpsc::Sender<ProcessCommand>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl EncoderHandle {
    pub fn new(
        pid: Option<u32>,
        control: mpsc::Sender<ProcessCommand>,
        exit: watch::Receiver<Option<ExitInfo>>,
    ) -> Self {
        Self { pid, control, exit }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.borrow().clone()
    }

    /// Receiver that flips to `Some` once the process has exited.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit.clone()
    }

    /// Ask the supervisor to terminate without waiting for the outcome.
    pub fn request_terminate(&self, grace: Duration) {
        let _ = self.control.try_send(ProcessCommand::Terminate { grace });
    }

    /// Terminate and wait for the process to go away.
    ///
    /// Returns None only if the supervisor disappeared without reporting.
    pub async fn terminate(&self, grace: Duration) -> Option<ExitInfo> {
        if let Some(info) = self.exit_info() {
            return Some(info);
        }
        let _ = self.control.send(ProcessCommand::Terminate { grace }).await;
        self.wait().await
    }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> Option<ExitInfo> {
        let mut exit = self.exit.clone();
        let result = exit.wait_for(|info| info.is_some()).await;
        result.ok().and_then(|info| info.clone())
    }
}

/// A freshly launched encoder.
#[derive(Debug)]
pub struct LaunchedEncoder {
    pub handle: EncoderHandle,
    /// Encoded bytes destined for the downstream sink.
    pub output: mpsc::Receiver<Bytes>,
    /// Diagnostic output, one telemetry line per message.
    pub diagnostics: mpsc::Receiver<String>,
}

/// Starts external encoding processes.
#[async_trait]
pub trait EncoderLauncher: Send + Sync {
    async fn launch(&self, job: &EncodeJob) -> Result<LaunchedEncoder, LaunchError>;
}

/// Pop the next diagnostic line off `buf`.
///
/// The encoder rewrites its progress line with `\r`, so both `\r` and `\n`
/// terminate a line. Empty lines are skipped.
pub fn take_line(buf: &mut BytesMut) -> Option<String> {
    loop {
        let end = buf.iter().position(|b| *b == b'\n' || *b == b'\r')?;
        let line = buf.split_to(end + 1);
        let text = String::from_utf8_lossy(&line[..end]).trim().to_string();
        if !text.is_empty() {
            return Some(text);
        }
    }
}
