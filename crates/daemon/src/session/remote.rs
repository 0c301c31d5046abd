//! Remote process collaborator contract.
//!
//! A remote process is one running shell reachable through three byte streams
//! (output, error output, input) plus a resize control. The session layer only
//! talks to it through [`RemoteProcess`]; how it is reached (a local PTY, a
//! `kubectl exec` pipe, an in-memory fake) is the backend's business.

use std::fmt;
use std::io::{Read, Write};

use super::error::SessionError;

/// Namespace used when the client leaves it empty.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Where a new session should be opened.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    namespace: String,
    pod: String,
}

impl Target {
    /// Validates and builds a target.
    ///
    /// An empty namespace falls back to [`DEFAULT_NAMESPACE`]. Names must be
    /// non-empty, must not start with `-`, and may only contain ASCII
    /// alphanumerics, `-`, `.` and `_`.
    pub fn new(namespace: &str, pod: &str) -> Result<Self, SessionError> {
        let namespace = if namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            namespace
        };

        validate_name("namespace", namespace)?;
        validate_name("pod", pod)?;

        Ok(Self {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
        })
    }

    /// Returns the namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the pod name.
    pub fn pod(&self) -> &str {
        &self.pod
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod)
    }
}

fn validate_name(kind: &str, value: &str) -> Result<(), SessionError> {
    if value.is_empty() {
        return Err(SessionError::InvalidTarget(format!("{kind} must not be empty")));
    }
    if value.starts_with('-') {
        return Err(SessionError::InvalidTarget(format!(
            "{kind} must not start with '-': {value}"
        )));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_')))
    {
        return Err(SessionError::InvalidTarget(format!(
            "{kind} contains invalid character {c:?}: {value}"
        )));
    }
    Ok(())
}

/// The byte streams of an opened remote process.
pub struct ProcessStreams {
    /// Primary output.
    pub output: Box<dyn Read + Send>,
    /// Diagnostic output.
    pub error_output: Box<dyn Read + Send>,
    /// Input sink.
    pub input: Box<dyn Write + Send>,
}

impl fmt::Debug for ProcessStreams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessStreams").finish_non_exhaustive()
    }
}

/// An opened remote process.
///
/// All methods may block. Callers in async context run them on the blocking
/// pool.
pub trait RemoteProcess: Send + Sync {
    /// Hands out the process streams. Succeeds once; later calls fail.
    fn take_streams(&mut self) -> Result<ProcessStreams, SessionError>;

    /// Applies a new terminal geometry.
    fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError>;

    /// Terminates the process.
    ///
    /// After this returns, pending reads on the output streams must return
    /// end-of-data or an error promptly. Calling it again is a no-op.
    fn close(&self) -> Result<(), SessionError>;

    /// Returns whether the process is still running and not closed.
    fn is_open(&self) -> bool;

    /// Local process ID, if there is one.
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Opens remote processes for targets.
pub trait RemoteBackend: Send + Sync {
    /// Opens a new remote process for `target`.
    ///
    /// Fails with [`SessionError::RemoteUnavailable`] when nothing could be
    /// started.
    fn open(&self, target: &Target) -> Result<Box<dyn RemoteProcess>, SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_defaults_namespace() {
        let target = Target::new("", "web-0").unwrap();
        assert_eq!(target.namespace(), "default");
        assert_eq!(target.pod(), "web-0");
        assert_eq!(target.to_string(), "default/web-0");
    }

    #[test]
    fn test_target_accepts_kubernetes_names() {
        let target = Target::new("kube-system", "coredns-5d78c9869d-x2x7q").unwrap();
        assert_eq!(target.namespace(), "kube-system");

        assert!(Target::new("team_a", "api.v2").is_ok());
    }

    #[test]
    fn test_target_rejects_empty_pod() {
        let err = Target::new("default", "").unwrap_err();
        assert!(matches!(err, SessionError::InvalidTarget(_)));
    }

    #[test]
    fn test_target_rejects_flag_like_names() {
        assert!(matches!(
            Target::new("default", "--kubeconfig=/tmp/x"),
            Err(SessionError::InvalidTarget(_))
        ));
        assert!(matches!(
            Target::new("-n", "pod"),
            Err(SessionError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_target_rejects_shell_metacharacters() {
        for pod in ["a b", "a;b", "a/b", "$(id)", "pod\n"] {
            assert!(
                matches!(Target::new("default", pod), Err(SessionError::InvalidTarget(_))),
                "{pod:?} should be rejected"
            );
        }
    }
}
