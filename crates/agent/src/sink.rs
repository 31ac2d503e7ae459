//! Downstream byte sinks.
//!
//! The sink stays open across hot switches: it is opened when the first
//! session goes live and closed only on stop.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::PathBuf;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// A continuously-open destination for encoded bytes.
#[async_trait]
pub trait MediaSink: Send + Sync {
    async fn write(&self, chunk: Bytes) -> io::Result<()>;
    async fn close(&self) -> io::Result<()>;
}

/// Opens a fresh sink for a new session.
#[async_trait]
pub trait SinkProvider: Send + Sync {
    async fn open(&self) -> io::Result<Box<dyn MediaSink>>;
}

/// Sink over any async writer.
pub struct WriterSink<W> {
    writer: Mutex<Option<W>>,
}

impl<W> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
        }
    }
}

#[async_trait]
impl<W> MediaSink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&self, chunk: Bytes) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => writer.write_all(&chunk).await,
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed")),
        }
    }

    async fn close(&self) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        match guard.take() {
            Some(mut writer) => {
                writer.flush().await?;
                writer.shutdown().await
            }
            None => Ok(()),
        }
    }
}

/// Where the agent writes its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    Stdout,
    Tcp(String),
    File(PathBuf),
}

impl OutputTarget {
    /// `-` is stdout, `tcp://host:port` a TCP connection, anything else a file path.
    pub fn parse(target: &str) -> Self {
        let target = target.trim();
        if target.is_empty() || target == "-" {
            OutputTarget::Stdout
        } else if let Some(addr) = target.strip_prefix("tcp://") {
            OutputTarget::Tcp(addr.to_string())
        } else {
            OutputTarget::File(PathBuf::from(target))
        }
    }
}

#[async_trait]
impl SinkProvider for OutputTarget {
    async fn open(&self) -> io::Result<Box<dyn MediaSink>> {
        match self {
            OutputTarget::Stdout => Ok(Box::new(WriterSink::new(tokio::io::stdout()))),
            OutputTarget::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(WriterSink::new(stream)))
            }
            OutputTarget::File(path) => {
                let file = tokio::fs::File::create(path).await?;
                Ok(Box::new(WriterSink::new(file)))
            }
        }
    }
}
