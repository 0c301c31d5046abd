//! Session registry with idle eviction.
//!
//! The registry is the only place sessions live. Entries are refreshed on
//! every lookup; a periodic sweep closes and drops entries that have been
//! idle longer than the configured window.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::{SessionError, SessionId};
use super::remote::{RemoteBackend, Target};
use super::terminal::{SessionInfo, TerminalSession};
use crate::channel::ClientConnection;

/// Tunables for a [`SessionRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySettings {
    /// Entries idle for longer than this are evicted.
    pub idle_timeout: Duration,
    /// Maximum number of live sessions.
    pub max_sessions: usize,
    /// How long `remove_all` waits for each pump.
    pub pump_join_timeout: Duration,
    /// Geometry recorded for new sessions.
    pub initial_cols: u16,
    /// Geometry recorded for new sessions.
    pub initial_rows: u16,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60 * 60),
            max_sessions: 100,
            pump_join_timeout: Duration::from_secs(5),
            initial_cols: 80,
            initial_rows: 24,
        }
    }
}

/// Session id to session map.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<TerminalSession>>,
    backend: Arc<dyn RemoteBackend>,
    settings: RegistrySettings,
}

impl SessionRegistry {
    /// Creates an empty registry opening sessions through `backend`.
    pub fn new(backend: Arc<dyn RemoteBackend>, settings: RegistrySettings) -> Self {
        Self {
            sessions: DashMap::new(),
            backend,
            settings,
        }
    }

    /// Returns the registry settings.
    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Opens a remote process for `target` and registers a session for it.
    ///
    /// Nothing is registered when opening fails.
    pub async fn create(
        &self,
        connection: Arc<ClientConnection>,
        target: Target,
    ) -> Result<Arc<TerminalSession>, SessionError> {
        if self.sessions.len() >= self.settings.max_sessions {
            return Err(SessionError::LimitReached(self.settings.max_sessions));
        }

        let backend = Arc::clone(&self.backend);
        let open_target = target.clone();
        let process = tokio::task::spawn_blocking(move || backend.open(&open_target))
            .await
            .map_err(|e| SessionError::RemoteUnavailable(e.to_string()))??;

        let session = TerminalSession::start(
            target,
            process,
            connection,
            self.settings.initial_cols,
            self.settings.initial_rows,
        )?;
        self.put(Arc::clone(&session));
        Ok(session)
    }

    /// Registers a session.
    pub fn put(&self, session: Arc<TerminalSession>) {
        session.touch();
        let id = session.id().clone();
        if self.sessions.insert(id.clone(), session).is_some() {
            tracing::warn!(session_id = %id, "Replaced existing session entry");
        }
        tracing::debug!(session_id = %id, count = self.sessions.len(), "Session registered");
    }

    /// Looks up a session and refreshes its last-access time.
    pub fn get(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.get(id).map(|entry| {
            let session = Arc::clone(entry.value());
            session.touch();
            session
        })
    }

    /// Returns whether a session is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns whether no sessions are registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshots every registered session.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|entry| entry.value().info()).collect()
    }

    /// Removes and closes one session.
    pub async fn remove(&self, id: &str) -> Result<(), SessionError> {
        let (_, session) = self
            .sessions
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.close().await
    }

    /// Evicts every session idle beyond the timeout.
    ///
    /// Returns the number of evicted sessions.
    pub async fn evict_idle(&self) -> usize {
        let idle_timeout = self.settings.idle_timeout;
        let candidates: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() > idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for id in candidates {
            // Re-checked under the entry lock: a lookup since the scan wins.
            let Some((_, session)) = self
                .sessions
                .remove_if(&id, |_, session| session.idle_for() > idle_timeout)
            else {
                continue;
            };

            tracing::info!(
                session_id = %id,
                target = %session.target(),
                idle_secs = session.idle_for().as_secs(),
                "Evicting idle session"
            );
            if let Err(e) = session.close().await {
                tracing::warn!(session_id = %id, error = %e, "Failed to close evicted session");
            }
            evicted += 1;
        }
        evicted
    }

    /// Spawns the periodic eviction sweep.
    pub fn start_eviction_task(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Eviction task stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let evicted = registry.evict_idle().await;
                        if evicted > 0 {
                            tracing::info!(evicted, remaining = registry.len(), "Eviction sweep finished");
                        }
                    }
                }
            }
        })
    }

    /// Closes and drops every session, then waits for their pumps.
    pub async fn remove_all(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let sessions: Vec<Arc<TerminalSession>> = ids
            .iter()
            .filter_map(|id| self.sessions.remove(id).map(|(_, s)| s))
            .collect();

        if sessions.is_empty() {
            return;
        }
        tracing::info!(count = sessions.len(), "Closing all sessions");

        for session in &sessions {
            if let Err(e) = session.close().await {
                tracing::warn!(session_id = %session.id(), error = %e, "Failed to close session");
            }
        }

        let timeout = self.settings.pump_join_timeout;
        let results = join_all(sessions.iter().map(|s| s.wait_for_pumps(timeout))).await;
        let stuck = results.iter().filter(|done| !**done).count();
        if stuck > 0 {
            tracing::warn!(stuck, "Some sessions did not finish cleanup in time");
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::remote::RemoteProcess;
    use crate::session::terminal::tests::{FakeHandles, FakeProcess};
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Backend handing out fake processes and keeping their handles.
    #[derive(Default)]
    struct FakeBackend {
        handles: Mutex<Vec<FakeHandles>>,
        fail: bool,
        fail_close: bool,
    }

    impl RemoteBackend for FakeBackend {
        fn open(&self, _target: &Target) -> Result<Box<dyn RemoteProcess>, SessionError> {
            if self.fail {
                return Err(SessionError::RemoteUnavailable("backend down".to_string()));
            }
            let (mut process, handles) = FakeProcess::new();
            process.fail_close = self.fail_close;
            self.handles.lock().unwrap().push(handles);
            Ok(Box::new(process))
        }
    }

    fn registry_with(
        backend: FakeBackend,
        settings: RegistrySettings,
    ) -> (Arc<SessionRegistry>, Arc<FakeBackend>) {
        let backend = Arc::new(backend);
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&backend) as Arc<dyn RemoteBackend>,
            settings,
        ));
        (registry, backend)
    }

    fn connection() -> (Arc<ClientConnection>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientConnection::new(Box::new(tx)), rx)
    }

    fn target() -> Target {
        Target::new("default", "web-0").unwrap()
    }

    fn short_idle() -> RegistrySettings {
        RegistrySettings {
            idle_timeout: Duration::from_millis(100),
            ..RegistrySettings::default()
        }
    }

    #[tokio::test]
    async fn test_create_registers_session() {
        let (registry, _backend) = registry_with(FakeBackend::default(), RegistrySettings::default());
        let (conn, _rx) = connection();

        let session = registry.create(conn, target()).await.unwrap();
        assert!(registry.contains(session.id()));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.list()[0].target, target());
    }

    #[tokio::test]
    async fn test_create_failure_registers_nothing() {
        let (registry, _backend) = registry_with(
            FakeBackend {
                fail: true,
                ..FakeBackend::default()
            },
            RegistrySettings::default(),
        );
        let (conn, _rx) = connection();

        let err = registry.create(conn, target()).await.unwrap_err();
        assert!(matches!(err, SessionError::RemoteUnavailable(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_create_enforces_limit() {
        let (registry, _backend) = registry_with(
            FakeBackend::default(),
            RegistrySettings {
                max_sessions: 2,
                ..RegistrySettings::default()
            },
        );
        let (conn, _rx) = connection();

        registry.create(Arc::clone(&conn), target()).await.unwrap();
        registry.create(Arc::clone(&conn), target()).await.unwrap();
        let err = registry.create(conn, target()).await.unwrap_err();
        assert!(matches!(err, SessionError::LimitReached(2)));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_get_unknown_is_none() {
        let (registry, _backend) = registry_with(FakeBackend::default(), RegistrySettings::default());
        assert!(registry.get("nope").is_none());
    }

    #[tokio::test]
    async fn test_idle_session_is_evicted_and_closed() {
        let (registry, backend) = registry_with(FakeBackend::default(), short_idle());
        let (conn, _rx) = connection();
        let session = registry.create(conn, target()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(registry.evict_idle().await, 1);

        assert!(!registry.contains(session.id()));
        assert!(session.is_closed());
        let handles = backend.handles.lock().unwrap();
        assert!(!handles[0].open.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_lookup_keeps_session_alive() {
        let (registry, _backend) = registry_with(FakeBackend::default(), short_idle());
        let (conn, _rx) = connection();
        let session = registry.create(conn, target()).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(registry.get(session.id()).is_some());
        }
        assert_eq!(registry.evict_idle().await, 0);
        assert!(registry.contains(session.id()));
    }

    #[tokio::test]
    async fn test_eviction_removes_entry_even_if_close_fails() {
        let (registry, _backend) = registry_with(
            FakeBackend {
                fail_close: true,
                ..FakeBackend::default()
            },
            short_idle(),
        );
        let (conn, _rx) = connection();
        registry.create(conn, target()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(registry.evict_idle().await, 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_eviction_task_runs_until_cancelled() {
        let (registry, backend) = registry_with(FakeBackend::default(), short_idle());
        let (conn, _rx) = connection();
        registry.create(conn, target()).await.unwrap();
        // Let the pumps reach EOF once the process is closed.
        backend.handles.lock().unwrap().clear();

        let cancel = CancellationToken::new();
        let task = registry.start_eviction_task(Duration::from_millis(50), cancel.clone());

        tokio::time::timeout(Duration::from_secs(5), async {
            while !registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("session was not evicted");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("eviction task did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_remove_closes_session() {
        let (registry, _backend) = registry_with(FakeBackend::default(), RegistrySettings::default());
        let (conn, _rx) = connection();
        let session = registry.create(conn, target()).await.unwrap();

        registry.remove(session.id()).await.unwrap();
        assert!(session.is_closed());
        assert!(matches!(
            registry.remove(session.id()).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_all_closes_and_joins_pumps() {
        let (registry, backend) = registry_with(FakeBackend::default(), RegistrySettings::default());
        let (conn, mut rx) = connection();
        let s1 = registry.create(Arc::clone(&conn), target()).await.unwrap();
        let s2 = registry.create(conn, target()).await.unwrap();
        backend.handles.lock().unwrap().clear();

        registry.remove_all().await;

        assert!(registry.is_empty());
        assert!(s1.is_closed() && s2.is_closed());

        // Pumps were joined, so every EOF frame is already queued.
        let mut eofs = 0;
        while let Ok(text) = rx.try_recv() {
            if text.contains("\"EOF\"") {
                eofs += 1;
            }
        }
        assert_eq!(eofs, 4);
    }
}
