//! PTY-backed remote process.
//!
//! Runs the backend command under a pseudo-terminal. A TTY merges standard
//! error into the master side, so the diagnostic stream carries no bytes and
//! reports end-of-data once the process exits or is closed.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use super::backend::CommandSpec;
use super::error::SessionError;
use super::remote::{ProcessStreams, RemoteProcess};

/// How often the merged diagnostic stream checks for process exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

type SharedChild = Arc<Mutex<Box<dyn Child + Send + Sync>>>;

/// A command running under a pseudo-terminal.
pub struct PtyProcess {
    /// The PTY master handle. Dropped on close.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,

    /// The child process.
    child: SharedChild,

    /// Cleared by `close` or once the child is seen to have exited.
    open: Arc<AtomicBool>,

    /// Streams not yet handed out.
    streams: Mutex<Option<ProcessStreams>>,

    /// Process ID.
    pid: Option<u32>,
}

impl PtyProcess {
    /// Spawns `command` under a new PTY of the given size.
    pub fn spawn(command: &CommandSpec, cols: u16, rows: u16) -> Result<Self, SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::RemoteUnavailable(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&command.program);
        cmd.args(&command.args);
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::RemoteUnavailable(format!("failed to spawn: {e}")))?;

        // Only the child may hold the slave side, or reads never see EOF.
        drop(pair.slave);

        let pid = child.process_id();

        let output = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::RemoteUnavailable(format!("failed to get reader: {e}")))?;

        let input = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::RemoteUnavailable(format!("failed to get writer: {e}")))?;

        let child: SharedChild = Arc::new(Mutex::new(child));
        let open = Arc::new(AtomicBool::new(true));

        let error_output = ExitWatchReader {
            child: Arc::clone(&child),
            open: Arc::clone(&open),
        };

        tracing::debug!(pid = ?pid, cols = cols, rows = rows, "Spawned PTY process");

        Ok(Self {
            master: Mutex::new(Some(pair.master)),
            child,
            open,
            streams: Mutex::new(Some(ProcessStreams {
                output,
                error_output: Box::new(error_output),
                input,
            })),
            pid,
        })
    }
}

impl RemoteProcess for PtyProcess {
    fn take_streams(&mut self) -> Result<ProcessStreams, SessionError> {
        self.streams
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SessionError::Unsupported("streams already taken"))
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::ResizeFailed("process is closed".to_string()));
        }

        let master = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        let master = master
            .as_ref()
            .ok_or_else(|| SessionError::ResizeFailed("PTY already released".to_string()))?;

        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))
    }

    fn close(&self) -> Result<(), SessionError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            // Already closed, or exited on its own; still make sure it is reaped.
            let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = child.try_wait();
            return Ok(());
        }

        let result = {
            let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
            match child.try_wait() {
                Ok(Some(_)) => Ok(()),
                _ => child
                    .kill()
                    .and_then(|_| child.wait().map(|_| ()))
                    .map_err(|e| SessionError::CloseFailed(e.to_string())),
            }
        };

        self.master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        tracing::debug!(pid = ?self.pid, "Closed PTY process");
        result
    }

    fn is_open(&self) -> bool {
        if !self.open.load(Ordering::SeqCst) {
            return false;
        }

        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) | Err(_) => {
                self.open.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Diagnostic stream of a PTY process.
///
/// Blocks without producing bytes until the process exits or is closed, then
/// reports end-of-data.
struct ExitWatchReader {
    child: SharedChild,
    open: Arc<AtomicBool>,
}

impl Read for ExitWatchReader {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.open.load(Ordering::SeqCst) {
                return Ok(0);
            }

            let exited = {
                let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
                child.try_wait()?.is_some()
            };
            if exited {
                return Ok(0);
            }

            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Instant;

    fn sh() -> CommandSpec {
        CommandSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec![],
            env: vec![("PODTERM_TEST_VAR".to_string(), "pty_env_value".to_string())],
        }
    }

    /// Reads from `reader` on a helper thread until `marker` shows up.
    fn read_until(mut reader: Box<dyn Read + Send>, marker: &'static str) -> bool {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let mut seen = Vec::new();
            let mut buf = [0u8; 1024];
            while let Ok(n) = reader.read(&mut buf) {
                if n == 0 {
                    break;
                }
                seen.extend_from_slice(&buf[..n]);
                if String::from_utf8_lossy(&seen).contains(marker) {
                    let _ = tx.send(true);
                    return;
                }
            }
            let _ = tx.send(false);
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap_or(false)
    }

    #[test]
    fn test_pty_spawn_and_close() {
        let process = PtyProcess::spawn(&sh(), 80, 24).unwrap();
        assert!(process.is_open());
        assert!(process.pid().is_some());

        process.close().unwrap();
        assert!(!process.is_open());

        // Closing twice is a no-op.
        process.close().unwrap();
    }

    #[test]
    fn test_pty_output_roundtrip() {
        let mut process = PtyProcess::spawn(&sh(), 80, 24).unwrap();
        let mut streams = process.take_streams().unwrap();

        streams.input.write_all(b"echo $PODTERM_TEST_VAR\n").unwrap();
        streams.input.flush().unwrap();

        assert!(read_until(streams.output, "pty_env_value"));
        process.close().unwrap();
    }

    #[test]
    fn test_pty_streams_taken_once() {
        let mut process = PtyProcess::spawn(&sh(), 80, 24).unwrap();
        assert!(process.take_streams().is_ok());
        assert!(process.take_streams().is_err());
        process.close().unwrap();
    }

    #[test]
    fn test_pty_resize() {
        let process = PtyProcess::spawn(&sh(), 80, 24).unwrap();
        assert!(process.resize(120, 40).is_ok());

        process.close().unwrap();
        assert!(matches!(
            process.resize(100, 50),
            Err(SessionError::ResizeFailed(_))
        ));
    }

    #[test]
    fn test_pty_close_unblocks_both_streams() {
        let mut process = PtyProcess::spawn(&sh(), 80, 24).unwrap();
        let streams = process.take_streams().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        for mut reader in [streams.output, streams.error_output] {
            let tx = tx.clone();
            std::thread::spawn(move || {
                let mut buf = [0u8; 1024];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => continue,
                    }
                }
                let _ = tx.send(());
            });
        }

        let started = Instant::now();
        process.close().unwrap();

        for _ in 0..2 {
            rx.recv_timeout(Duration::from_secs(5))
                .expect("reader did not unblock after close");
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_pty_exit_detected() {
        let mut process = PtyProcess::spawn(&sh(), 80, 24).unwrap();
        let mut streams = process.take_streams().unwrap();

        streams.input.write_all(b"exit 3\n").unwrap();
        streams.input.flush().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while process.is_open() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(!process.is_open());
        process.close().unwrap();
    }
}
