//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that owns the session
//! registry, the eviction task and the HTTP/WebSocket server, and tears them
//! down in order on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::router::ProtocolDispatcher;
use crate::server::{self, AppState};
use crate::session::{CommandBackend, RemoteBackend, SessionRegistry};

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// Error occurred.
    Error { message: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Every live session.
    registry: Arc<SessionRegistry>,
    /// Frame dispatcher shared by all connections.
    dispatcher: Arc<ProtocolDispatcher>,
    /// Cancellation token for graceful shutdown; replaced on each start.
    shutdown_token: CancellationToken,
    /// Address the server is bound to while running.
    local_addr: Option<SocketAddr>,
    /// Server task.
    server_task: Option<JoinHandle<()>>,
    /// Eviction task.
    eviction_task: Option<JoinHandle<()>>,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator using the configured command backend.
    pub fn new(config: Config) -> Result<Self> {
        let backend = Arc::new(CommandBackend::from_config(&config.backend));
        Self::with_backend(config, backend)
    }

    /// Creates a new daemon orchestrator with a custom remote backend.
    pub fn with_backend(config: Config, backend: Arc<dyn RemoteBackend>) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let registry = Arc::new(SessionRegistry::new(backend, config.registry_settings()));
        let dispatcher = Arc::new(ProtocolDispatcher::new(Arc::clone(&registry)));
        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            dispatcher,
            shutdown_token: CancellationToken::new(),
            local_addr: None,
            server_task: None,
            eviction_task: None,
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Returns the bound server address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Starts the daemon orchestrator.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        let bind_addr = self.config.bind_addr()?;
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                let message = format!("Failed to bind {bind_addr}: {e}");
                self.emit_event(OrchestratorEvent::Error {
                    message: message.clone(),
                });
                self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
                return Err(anyhow::anyhow!(message));
            }
        };
        let local_addr = listener
            .local_addr()
            .context("Failed to read bound address")?;
        self.local_addr = Some(local_addr);

        self.shutdown_token = CancellationToken::new();

        self.eviction_task = Some(self.registry.start_eviction_task(
            self.config.session.eviction_interval(),
            self.shutdown_token.child_token(),
        ));
        debug!(
            interval_secs = self.config.session.eviction_interval_secs,
            idle_timeout_secs = self.config.session.idle_timeout_secs,
            "Started session eviction task"
        );

        let router = server::create_router(AppState {
            dispatcher: Arc::clone(&self.dispatcher),
        });
        let shutdown = self.shutdown_token.clone();
        let event_tx = self.event_tx.clone();
        self.server_task = Some(tokio::spawn(async move {
            if let Err(e) = server::serve(listener, router, shutdown).await {
                error!(error = %e, "Server failed");
                let _ = event_tx.send(OrchestratorEvent::Error {
                    message: format!("Server failed: {e}"),
                });
            }
        }));
        info!(addr = %local_addr, "Listening for client channels");

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started");
        Ok(())
    }

    /// Stops the daemon orchestrator.
    ///
    /// Stops accepting connections, then closes every session.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        // Signal shutdown to all tasks
        self.shutdown_token.cancel();

        if let Some(task) = self.server_task.take() {
            if let Err(e) = task.await {
                warn!("Server task ended abnormally: {}", e);
            }
        }
        if let Some(task) = self.eviction_task.take() {
            if let Err(e) = task.await {
                warn!("Eviction task ended abnormally: {}", e);
            }
        }

        self.registry.remove_all().await;
        self.local_addr = None;

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an event to all subscribers.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendMode;

    fn create_test_config() -> Config {
        let mut config = Config::default();
        config.server.bind_addr = "127.0.0.1:0".to_string();
        config.backend.mode = BackendMode::Pipe;
        config.backend.program = "/bin/sh".to_string();
        config.backend.args = vec![];
        config
    }

    #[tokio::test]
    async fn test_orchestrator_creation() {
        let orchestrator = DaemonOrchestrator::new(create_test_config()).unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_orchestrator_rejects_invalid_config() {
        let mut config = create_test_config();
        config.session.idle_timeout_secs = 0;
        assert!(DaemonOrchestrator::new(config).is_err());
    }

    #[tokio::test]
    async fn test_orchestrator_start_stop() {
        let mut orchestrator = DaemonOrchestrator::new(create_test_config()).unwrap();
        let mut events = orchestrator.subscribe();

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        let addr = orchestrator.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let body: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);

        let mut states = Vec::new();
        while let Ok(OrchestratorEvent::StateChanged(state)) = events.try_recv() {
            states.push(state);
        }
        assert_eq!(
            states,
            vec![
                OrchestratorState::Starting,
                OrchestratorState::Running,
                OrchestratorState::ShuttingDown,
                OrchestratorState::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn test_orchestrator_double_start_fails() {
        let mut orchestrator = DaemonOrchestrator::new(create_test_config()).unwrap();
        orchestrator.start().await.unwrap();
        assert!(orchestrator.start().await.is_err());
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_orchestrator_stop_when_stopped_is_noop() {
        let mut orchestrator = DaemonOrchestrator::new(create_test_config()).unwrap();
        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
    }

    #[tokio::test]
    async fn test_orchestrator_restart() {
        let mut orchestrator = DaemonOrchestrator::new(create_test_config()).unwrap();
        orchestrator.start().await.unwrap();
        orchestrator.stop().await.unwrap();
        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        orchestrator.stop().await.unwrap();
    }
}
