//! Pipe-backed remote process.
//!
//! Runs the backend command with piped stdio, which keeps standard output and
//! standard error apart. There is no terminal, so resize is unsupported.

use std::io;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use super::backend::CommandSpec;
use super::error::SessionError;
use super::remote::{ProcessStreams, RemoteProcess};

/// A command running with piped stdin, stdout and stderr.
pub struct PipeProcess {
    child: Mutex<Child>,
    open: AtomicBool,
    streams: Mutex<Option<ProcessStreams>>,
    pid: u32,
}

impl PipeProcess {
    /// Spawns `command` with piped stdio.
    pub fn spawn(command: &CommandSpec) -> Result<Self, SessionError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SessionError::RemoteUnavailable(format!("failed to spawn: {e}")))?;

        let missing = || SessionError::RemoteUnavailable("child stdio not captured".to_string());
        let input = child.stdin.take().ok_or_else(missing)?;
        let output = child.stdout.take().ok_or_else(missing)?;
        let error_output = child.stderr.take().ok_or_else(missing)?;

        let pid = child.id();
        tracing::debug!(pid = pid, "Spawned piped process");

        Ok(Self {
            child: Mutex::new(child),
            open: AtomicBool::new(true),
            streams: Mutex::new(Some(ProcessStreams {
                output: Box::new(output),
                error_output: Box::new(error_output),
                input: Box::new(input),
            })),
            pid,
        })
    }
}

impl RemoteProcess for PipeProcess {
    fn take_streams(&mut self) -> Result<ProcessStreams, SessionError> {
        self.streams
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SessionError::Unsupported("streams already taken"))
    }

    fn resize(&self, _cols: u16, _rows: u16) -> Result<(), SessionError> {
        Err(SessionError::Unsupported("resize without a terminal"))
    }

    fn close(&self) -> Result<(), SessionError> {
        let was_open = self.open.swap(false, Ordering::SeqCst);
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);

        if !was_open {
            let _ = child.try_wait();
            return Ok(());
        }

        if let Ok(Some(_)) = child.try_wait() {
            return Ok(());
        }

        match child.kill() {
            Ok(()) => {}
            // Exited between try_wait and kill.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(SessionError::CloseFailed(e.to_string())),
        }

        child
            .wait()
            .map(|status| tracing::debug!(pid = self.pid, status = %status, "Closed piped process"))
            .map_err(|e| SessionError::CloseFailed(e.to_string()))
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
        Some(self.pid)
    }
}
