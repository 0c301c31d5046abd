//! Terminal sessions.
//!
//! A [`TerminalSession`] bridges one remote process and one client
//! connection. Two [`StreamPump`]s carry the process output to the client as
//! `update`/`EOF` frames; `type` and resize requests flow back into the
//! process.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use protocol::{OutboundFrame, StreamKind};
use uuid::Uuid;

use super::error::{SessionError, SessionId};
use super::pump::{Event, EventSink, StreamPump};
use super::remote::{RemoteProcess, Target};
use crate::channel::ClientConnection;

type SharedInput = Arc<Mutex<Option<Box<dyn Write + Send>>>>;

/// Snapshot of a session for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session identifier.
    pub id: SessionId,
    /// Where the session runs.
    pub target: Target,
    /// Last applied terminal columns.
    pub cols: u16,
    /// Last applied terminal rows.
    pub rows: u16,
    /// Whether the remote process is still open.
    pub open: bool,
    /// Time since the last access.
    pub idle: Duration,
    /// Local process ID, if any.
    pub pid: Option<u32>,
}

/// Turns pump events into frames on the session's connection.
struct SessionListener {
    session_id: SessionId,
    connection: Arc<ClientConnection>,
}

#[async_trait]
impl EventSink for SessionListener {
    async fn on_event(&self, event: Event) {
        let frame = match &event {
            Event::Data { stream, bytes } => OutboundFrame::update(*stream, bytes),
            Event::EndOfStream { stream } => {
                tracing::debug!(session_id = %self.session_id, stream = %stream, "Sending EOF");
                OutboundFrame::eof(*stream)
            }
        };
        self.connection.send_or_log(&frame).await;
    }
}

/// One live terminal session.
pub struct TerminalSession {
    id: SessionId,
    target: Target,
    process: Arc<dyn RemoteProcess>,
    input: SharedInput,
    connection: Arc<ClientConnection>,
    pumps: tokio::sync::Mutex<Vec<StreamPump>>,
    cols: AtomicU16,
    rows: AtomicU16,
    created_at: Instant,
    last_access_ms: AtomicU64,
    closed: AtomicBool,
}

impl TerminalSession {
    /// Starts a session over an already opened remote process.
    ///
    /// Takes the process streams and starts one pump per output stream with
    /// the new session as listener. Must be called from within a tokio
    /// runtime.
    pub fn start(
        target: Target,
        mut process: Box<dyn RemoteProcess>,
        connection: Arc<ClientConnection>,
        cols: u16,
        rows: u16,
    ) -> Result<Arc<Self>, SessionError> {
        let streams = process.take_streams()?;
        let id = Uuid::new_v4().to_string();

        let listener: Arc<dyn EventSink> = Arc::new(SessionListener {
            session_id: id.clone(),
            connection: Arc::clone(&connection),
        });
        let pumps = vec![
            StreamPump::spawn(
                id.clone(),
                StreamKind::Stdout,
                streams.output,
                Arc::clone(&listener),
            ),
            StreamPump::spawn(id.clone(), StreamKind::Stderr, streams.error_output, listener),
        ];

        tracing::info!(
            session_id = %id,
            target = %target,
            connection_id = %connection.id(),
            pid = ?process.pid(),
            "Terminal session started"
        );

        Ok(Arc::new(Self {
            id,
            target,
            process: Arc::from(process),
            input: Arc::new(Mutex::new(Some(streams.input))),
            connection,
            pumps: tokio::sync::Mutex::new(pumps),
            cols: AtomicU16::new(cols),
            rows: AtomicU16::new(rows),
            created_at: Instant::now(),
            last_access_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }))
    }

    /// Returns the session identifier.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the session target.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Returns the connection frames are sent to.
    pub fn connection(&self) -> &Arc<ClientConnection> {
        &self.connection
    }

    /// Writes `text` to the remote input and flushes.
    pub async fn write(&self, text: &str) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.id.clone()));
        }
        self.touch();

        let input = Arc::clone(&self.input);
        let bytes = text.as_bytes().to_vec();
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = input.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.as_mut() {
                Some(writer) => {
                    writer.write_all(&bytes)?;
                    writer.flush()
                }
                None => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
            }
        })
        .await
        .map_err(|e| SessionError::WriteFailed(e.to_string()))?;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe || self.is_closed() => {
                tracing::debug!(session_id = %self.id, error = %e, "Write raced session close");
                Err(SessionError::Closed(self.id.clone()))
            }
            Err(e) => Err(SessionError::WriteFailed(e.to_string())),
        }
    }

    /// Forwards a new geometry to the remote process.
    ///
    /// Failures are logged and not returned.
    pub async fn resize(&self, cols: u16, rows: u16) {
        self.touch();
        self.cols.store(cols, Ordering::Relaxed);
        self.rows.store(rows, Ordering::Relaxed);

        let process = Arc::clone(&self.process);
        let result = tokio::task::spawn_blocking(move || process.resize(cols, rows)).await;
        match result {
            Ok(Ok(())) => {
                tracing::debug!(session_id = %self.id, cols, rows, "Terminal resized");
            }
            Ok(Err(e)) => {
                tracing::warn!(session_id = %self.id, cols, rows, error = %e, "Resize failed");
            }
            Err(e) => {
                tracing::error!(session_id = %self.id, error = %e, "Resize task failed");
            }
        }
    }

    /// Returns whether the session is closed or its process has exited.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || !self.process.is_open()
    }

    /// Closes the remote process and releases the input.
    ///
    /// The pumps observe end-of-data and terminate on their own. Calling this
    /// more than once is a no-op.
    pub async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let process = Arc::clone(&self.process);
        let input = Arc::clone(&self.input);
        // Kill first: a write blocked on a stalled process holds the input
        // lock until the process goes away.
        let result = tokio::task::spawn_blocking(move || {
            let result = process.close();
            input.lock().unwrap_or_else(PoisonError::into_inner).take();
            result
        })
        .await
        .map_err(|e| SessionError::CloseFailed(e.to_string()))?;

        tracing::info!(session_id = %self.id, target = %self.target, "Terminal session closed");
        result
    }

    /// Waits up to `timeout` for both pumps to terminate.
    ///
    /// Returns `false` if any pump was still running.
    pub async fn wait_for_pumps(&self, timeout: Duration) -> bool {
        let pumps: Vec<StreamPump> = self.pumps.lock().await.drain(..).collect();
        let mut all_done = true;
        for pump in pumps {
            let stream = pump.stream();
            if !pump.join(timeout).await {
                tracing::warn!(session_id = %self.id, stream = %stream, "Pump did not terminate in time");
                all_done = false;
            }
        }
        all_done
    }

    /// Refreshes the last-access time.
    pub fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis();
        self.last_access_ms
            .fetch_max(u64::try_from(elapsed).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Time since the last access.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_access_ms.load(Ordering::Relaxed));
        self.created_at.elapsed().saturating_sub(last)
    }

    /// Returns a snapshot of the session.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            target: self.target.clone(),
            cols: self.cols.load(Ordering::Relaxed),
            rows: self.rows.load(Ordering::Relaxed),
            open: !self.is_closed(),
            idle: self.idle_for(),
            pid: self.process.pid(),
        }
    }
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
