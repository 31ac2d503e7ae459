//! Connection-layer collaborator.
//!
//! The chat/voice network layer lives outside this crate. The control plane
//! only needs a state snapshot, one voice-validity query and a few reconnect
//! operations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection unavailable: {0}")]
    Unavailable(String),

    #[error("reconnect failed: {0}")]
    ReconnectFailed(String),
}

/// Point-in-time view of the network connection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ConnectionState {
    pub connected: bool,
    /// Handshake complete and able to serve.
    pub ready: bool,
    pub latency_ms: Option<u64>,
}

/// Disconnect notifications pushed by the connection layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEvent {
    Disconnected,
    VoiceDisconnected,
    Reconnected,
}

#[async_trait]
pub trait ConnectionLayer: Send + Sync {
    fn state(&self) -> ConnectionState;

    /// Whether the voice session is really usable: socket and session both
    /// ready, not merely present.
    fn is_connection_healthy(&self) -> bool;

    async fn reconnect(&self) -> Result<(), ConnectionError>;

    async fn reconnect_voice(&self) -> Result<(), ConnectionError>;

    /// Tear down and rebuild all network state.
    async fn reset_network(&self) -> Result<(), ConnectionError>;

    /// Disconnect notifications, if the layer publishes them.
    fn subscribe(&self) -> Option<broadcast::Receiver<ConnectionEvent>> {
        None
    }
}

/// Connection layer for running without a chat network attached.
///
/// State is held in atomics so an embedding application (or a test) can flip
/// it; reconnects succeed and restore the connected state.
#[derive(Debug)]
pub struct StandaloneConnection {
    connected: AtomicBool,
    ready: AtomicBool,
    voice: AtomicBool,
    latency_ms: AtomicU64,
    reconnects: AtomicU32,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Default for StandaloneConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl StandaloneConnection {
    /// A connection that is up, ready and has a valid voice session.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            connected: AtomicBool::new(true),
            ready: AtomicBool::new(true),
            voice: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            reconnects: AtomicU32::new(0),
            events,
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        self.ready.store(connected, Ordering::SeqCst);
        if !connected {
            let _ = self.events.send(ConnectionEvent::Disconnected);
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_voice_healthy(&self, healthy: bool) {
        self.voice.store(healthy, Ordering::SeqCst);
        if !healthy {
            let _ = self.events.send(ConnectionEvent::VoiceDisconnected);
        }
    }

    pub fn set_latency_ms(&self, latency: u64) {
        self.latency_ms.store(latency, Ordering::SeqCst);
    }

    /// Number of reconnect operations performed so far.
    pub fn reconnect_count(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionLayer for StandaloneConnection {
    fn state(&self) -> ConnectionState {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        ConnectionState {
            connected: self.connected.load(Ordering::SeqCst),
            ready: self.ready.load(Ordering::SeqCst),
            latency_ms: (latency > 0).then_some(latency),
        }
    }

    fn is_connection_healthy(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.voice.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), ConnectionError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        self.ready.store(true, Ordering::SeqCst);
        let _ = self.events.send(ConnectionEvent::Reconnected);
        Ok(())
    }

    async fn reconnect_voice(&self) -> Result<(), ConnectionError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectionError::Unavailable(
                "voice needs an established connection".to_string(),
            ));
        }
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.voice.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn reset_network(&self) -> Result<(), ConnectionError> {
        self.reconnect().await?;
        self.reconnect_voice().await
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ConnectionEvent>> {
        Some(self.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standalone_starts_connected() {
        let conn = StandaloneConnection::new();
        let state = conn.state();
        assert!(state.connected);
        assert!(state.ready);
        assert_eq!(state.latency_ms, None);
        assert!(conn.is_connection_healthy());
    }

    #[tokio::test]
    async fn test_disconnect_publishes_event_and_reconnect_restores() {
        let conn = StandaloneConnection::new();
        let mut events = conn.subscribe().unwrap();

        conn.set_connected(false);
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Disconnected);
        assert!(!conn.is_connection_healthy());
        assert!(conn.reconnect_voice().await.is_err());

        conn.reconnect().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Reconnected);
        assert!(conn.state().connected);
        assert_eq!(conn.reconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_voice_validity_is_separate_from_connection() {
        let conn = StandaloneConnection::new();
        conn.set_voice_healthy(false);
        assert!(conn.state().connected);
        assert!(!conn.is_connection_healthy());

        conn.reset_network().await.unwrap();
        assert!(conn.is_connection_healthy());
        assert_eq!(conn.reconnect_count(), 2);
    }
}
