//! Stream pumps.
//!
//! A pump drains one output stream of a remote process and turns it into
//! [`Event`]s for a listener. Reads block, so each one runs on the blocking
//! pool while the pump itself is an ordinary tokio task; events of one pump
//! reach the listener in read order.

use std::io::{self, Read};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use protocol::StreamKind;
use tokio::task::JoinHandle;

use super::error::SessionId;

/// Buffer size for reading from the remote process.
const READ_BUFFER_SIZE: usize = 4096;

/// Something a pump observed on its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A chunk of bytes, never empty.
    Data {
        /// Source stream.
        stream: StreamKind,
        /// The bytes read.
        bytes: Vec<u8>,
    },
    /// The stream ended. Emitted once, last.
    EndOfStream {
        /// Source stream.
        stream: StreamKind,
    },
}

impl Event {
    /// Returns the stream the event came from.
    pub fn stream(&self) -> StreamKind {
        match self {
            Event::Data { stream, .. } | Event::EndOfStream { stream } => *stream,
        }
    }
}

/// Receives pump events.
///
/// Both pumps of a session share one sink and may call it concurrently.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Handles one event.
    async fn on_event(&self, event: Event);
}

/// A running pump.
pub struct StreamPump {
    stream: StreamKind,
    handle: JoinHandle<()>,
}

impl StreamPump {
    /// Starts pumping `reader` into `sink`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<R>(
        session_id: SessionId,
        stream: StreamKind,
        reader: R,
        sink: Arc<dyn EventSink>,
    ) -> Self
    where
        R: Read + Send + 'static,
    {
        let reader = Arc::new(Mutex::new(PumpReader {
            reader,
            buffer: vec![0u8; READ_BUFFER_SIZE],
        }));

        let handle = tokio::spawn(async move {
            loop {
                let reader = Arc::clone(&reader);
                let result = tokio::task::spawn_blocking(move || {
                    reader
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .read_chunk()
                })
                .await;

                match result {
                    Ok(Ok(Some(bytes))) => {
                        sink.on_event(Event::Data { stream, bytes }).await;
                    }
                    Ok(Ok(None)) => {
                        tracing::debug!(session_id = %session_id, stream = %stream, "Stream reached EOF");
                        break;
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(
                            session_id = %session_id,
                            stream = %stream,
                            error = %e,
                            "Error reading from remote process"
                        );
                        break;
                    }
                    Err(e) => {
                        tracing::error!(
                            session_id = %session_id,
                            stream = %stream,
                            error = %e,
                            "Read task panicked"
                        );
                        break;
                    }
                }
            }

            sink.on_event(Event::EndOfStream { stream }).await;
            tracing::debug!(session_id = %session_id, stream = %stream, "Pump ended");
        });

        Self { stream, handle }
    }

    /// Returns the stream this pump drains.
    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    /// Returns whether the pump has terminated.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits up to `timeout` for the pump to terminate.
    ///
    /// Returns `false` if it was still running when the timeout elapsed.
    pub async fn join(self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!(stream = %self.stream, error = %e, "Pump task failed");
                true
            }
            Err(_) => false,
        }
    }
}

struct PumpReader<R> {
    reader: R,
    buffer: Vec<u8>,
}

impl<R: Read> PumpReader<R> {
    /// Reads one chunk. `None` means end-of-data.
    fn read_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            match self.reader.read(&mut self.buffer) {
                Ok(0) => return Ok(None),
                Ok(n) => return Ok(Some(self.buffer[..n].to_vec())),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
