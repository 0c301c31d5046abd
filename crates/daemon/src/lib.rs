//! # PodTerm Daemon Library
//!
//! This crate provides the daemon side of PodTerm: interactive shells inside
//! Kubernetes pods, streamed to browser clients over a WebSocket.
//!
//! ## Overview
//!
//! - **Sessions**: one remote process per session, bridged to a client
//!   channel by two stream pumps (primary and diagnostic output)
//! - **Registry**: every live session, with idle eviction
//! - **Dispatcher**: decodes `new-session` / `type` frames and the resize call
//! - **Server**: axum routes for the WebSocket channel, resize and health
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐   ┌────────────────────┐                   │
//! │  │ axum server  │──▶│ Protocol Dispatcher│                   │
//! │  └──────────────┘   └─────────┬──────────┘                   │
//! │                               ▼                              │
//! │  ┌──────────────────────────────────────────────────────┐    │
//! │  │ Session Registry ── Terminal Session ── Stream Pumps │    │
//! │  └──────────────────────────┬───────────────────────────┘    │
//! │                             ▼                                │
//! │              Remote backend (pty / pipe command)             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Wait for shutdown signal...
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Remote processes, pumps, sessions and the registry
//! - [`channel`]: Client connections and their send lock
//! - [`router`]: Frame dispatch
//! - [`server`]: HTTP/WebSocket routes
//! - [`orchestrator`]: Main daemon coordinator

pub mod channel;
pub mod config;
pub mod orchestrator;
pub mod router;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use channel::{ChannelError, ClientConnection, FrameSink};
pub use config::Config;
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
pub use router::{ProtocolDispatcher, RouterError, RouterResult};
pub use session::{
    CommandBackend, RemoteBackend, RemoteProcess, SessionError, SessionId, SessionInfo,
    SessionRegistry, Target, TerminalSession,
};
