//! Terminal session management.
//!
//! Sessions couple a remote process (see [`remote`]) with a client
//! connection. The [`registry`] owns every live session and evicts idle ones.

pub mod backend;
pub mod error;
pub mod pipe;
pub mod pty;
pub mod pump;
pub mod registry;
pub mod remote;
pub mod terminal;

pub use backend::{CommandBackend, CommandSpec};
pub use error::{SessionError, SessionId};
pub use pump::{Event, EventSink, StreamPump};
pub use registry::{RegistrySettings, SessionRegistry};
pub use remote::{ProcessStreams, RemoteBackend, RemoteProcess, Target, DEFAULT_NAMESPACE};
pub use terminal::{SessionInfo, TerminalSession};
