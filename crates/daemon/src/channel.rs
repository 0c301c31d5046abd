//! Client channels.
//!
//! A [`ClientConnection`] is the daemon's side of one client: an outbound
//! frame sink guarded by an exclusive send lock, plus the session most
//! recently created on it. The transport behind the sink is pluggable through
//! [`FrameSink`]; the WebSocket server provides one, tests use a channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use protocol::{OutboundFrame, ProtocolError};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::session::SessionId;

/// Errors from sending on a client channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel has been closed by the peer or the transport.
    #[error("channel closed")]
    Closed,

    /// The transport failed to deliver a frame.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The frame could not be encoded.
    #[error("failed to encode frame: {0}")]
    Encode(#[from] ProtocolError),
}

/// Transport half that delivers text frames to a client.
///
/// Implementations need not support concurrent sends; [`ClientConnection`]
/// serializes them.
#[async_trait]
pub trait FrameSink: Send {
    /// Sends one complete text frame.
    async fn send_text(&mut self, text: String) -> Result<(), ChannelError>;
}

#[async_trait]
impl FrameSink for mpsc::UnboundedSender<String> {
    async fn send_text(&mut self, text: String) -> Result<(), ChannelError> {
        self.send(text).map_err(|_| ChannelError::Closed)
    }
}

/// Send counters for a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Frames delivered to the transport.
    pub frames_sent: u64,
    /// Frames dropped because the send failed.
    pub frames_dropped: u64,
}

/// One connected client.
pub struct ClientConnection {
    id: Uuid,
    sink: Mutex<Box<dyn FrameSink>>,
    default_session: RwLock<Option<SessionId>>,
    closed: AtomicBool,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl ClientConnection {
    /// Wraps a sink into a new connection.
    pub fn new(sink: Box<dyn FrameSink>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            sink: Mutex::new(sink),
            default_session: RwLock::new(None),
            closed: AtomicBool::new(false),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        })
    }

    /// Connection identifier, used in logs.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Encodes and sends one frame.
    ///
    /// Holds the send lock for the whole send so frames from concurrent
    /// producers are never interleaved.
    pub async fn send(&self, frame: &OutboundFrame) -> Result<(), ChannelError> {
        if self.is_closed() {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return Err(ChannelError::Closed);
        }

        let text = frame.to_json()?;
        let mut sink = self.sink.lock().await;
        match sink.send_text(text).await {
            Ok(()) => {
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                if matches!(e, ChannelError::Closed) {
                    self.mark_closed();
                }
                Err(e)
            }
        }
    }

    /// Sends a frame, logging instead of returning failures.
    pub async fn send_or_log(&self, frame: &OutboundFrame) {
        match self.send(frame).await {
            Ok(()) => {}
            Err(ChannelError::Closed) => {
                tracing::debug!(connection_id = %self.id, "Dropping frame for closed channel");
            }
            Err(e) => {
                tracing::warn!(connection_id = %self.id, error = %e, "Failed to send frame");
            }
        }
    }

    /// Returns the session most recently created on this connection.
    pub async fn default_session(&self) -> Option<SessionId> {
        self.default_session.read().await.clone()
    }

    /// Replaces the default session.
    pub async fn set_default_session(&self, session_id: SessionId) {
        *self.default_session.write().await = Some(session_id);
    }

    /// Marks the connection closed; later sends fail fast.
    pub fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(connection_id = %self.id, "Client channel closed");
        }
    }

    /// Returns whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns the send counters.
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
