//! Command-launching remote backend.
//!
//! The default deployment reaches pods through `kubectl exec`; the command
//! line is a template so any launcher with the same shape works.

use std::path::{Path, PathBuf};

use super::error::SessionError;
use super::pipe::PipeProcess;
use super::pty::PtyProcess;
use super::remote::{RemoteBackend, RemoteProcess, Target};
use crate::config::{BackendConfig, BackendMode};

/// Placeholder replaced by the target namespace.
pub const NAMESPACE_PLACEHOLDER: &str = "{namespace}";

/// Placeholder replaced by the target pod name.
pub const POD_PLACEHOLDER: &str = "{pod}";

/// A fully rendered command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: PathBuf,
    /// Arguments, placeholders already substituted.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

/// Backend that starts one local command per session.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    mode: BackendMode,
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    initial_cols: u16,
    initial_rows: u16,
}

impl CommandBackend {
    /// Creates a backend from configuration.
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            mode: config.mode,
            program: config.program.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            initial_cols: config.initial_cols,
            initial_rows: config.initial_rows,
        }
    }

    /// Returns the launch mode.
    pub fn mode(&self) -> BackendMode {
        self.mode
    }

    /// Renders the command line for a target.
    pub fn render(&self, target: &Target) -> Result<CommandSpec, SessionError> {
        let program = resolve_program(&self.program)?;

        let args = self
            .args
            .iter()
            .map(|arg| {
                arg.replace(NAMESPACE_PLACEHOLDER, target.namespace())
                    .replace(POD_PLACEHOLDER, target.pod())
            })
            .collect();

        Ok(CommandSpec {
            program,
            args,
            env: self.env.clone(),
        })
    }
}

impl RemoteBackend for CommandBackend {
    fn open(&self, target: &Target) -> Result<Box<dyn RemoteProcess>, SessionError> {
        let command = self.render(target)?;

        tracing::info!(
            target = %target,
            program = %command.program.display(),
            mode = ?self.mode,
            "Opening remote process"
        );

        match self.mode {
            BackendMode::Pty => Ok(Box::new(PtyProcess::spawn(
                &command,
                self.initial_cols,
                self.initial_rows,
            )?)),
            BackendMode::Pipe => Ok(Box::new(PipeProcess::spawn(&command)?)),
        }
    }
}

/// Resolves the program against `PATH` unless it is already a path.
fn resolve_program(program: &str) -> Result<PathBuf, SessionError> {
    let path = Path::new(program);
    if path.components().count() > 1 || path.is_absolute() {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(SessionError::RemoteUnavailable(format!(
            "program does not exist: {program}"
        )));
    }

    which::which(program).map_err(|e| {
        SessionError::RemoteUnavailable(format!("program not found in PATH: {program} ({e})"))
    })
}
