//! Protocol dispatcher.
//!
//! Decodes inbound text frames and routes them to the session registry or to
//! the connection's default session. Every failure is turned into an
//! `{"error": ...}` frame on the same connection; nothing here closes the
//! channel.

use std::sync::Arc;

use protocol::messages::errors;
use protocol::{
    parse_inbound, NewSession, OutboundFrame, ProtocolError, ResizeRequest, ResizeResponse,
    TerminalRequest, TypeText,
};
use tracing::{debug, error, info, warn};

use crate::channel::ClientConnection;
use crate::session::{SessionError, SessionRegistry, Target};

/// Result type for router operations.
pub type RouterResult = Result<Option<OutboundFrame>, RouterError>;

/// Errors that can occur while handling a frame.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The frame could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Session-related error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// `type` arrived before any session was created on the connection, or
    /// after that session was evicted.
    #[error("no session to type into")]
    SessionNeeded,
}

impl RouterError {
    /// Converts the error into the frame sent to the client.
    pub fn to_frame(&self) -> OutboundFrame {
        let message = match self {
            RouterError::Protocol(ProtocolError::NoHandler) => errors::NO_HANDLER.to_string(),
            RouterError::Session(SessionError::NotFound(id)) => errors::session_not_found(id),
            RouterError::Session(SessionError::Closed(_)) => errors::SESSION_CLOSED.to_string(),
            RouterError::SessionNeeded => errors::SESSION_NEEDED.to_string(),
            RouterError::Protocol(_) | RouterError::Session(_) => errors::INTERNAL.to_string(),
        };
        OutboundFrame::error(message)
    }

    /// Returns whether the error is caused by the client rather than the
    /// daemon.
    fn is_client_error(&self) -> bool {
        matches!(
            self,
            RouterError::Protocol(ProtocolError::NoHandler)
                | RouterError::Session(SessionError::NotFound(_))
                | RouterError::Session(SessionError::Closed(_))
                | RouterError::Session(SessionError::InvalidTarget(_))
                | RouterError::SessionNeeded
        )
    }
}

/// Routes decoded requests to the registry and sessions.
pub struct ProtocolDispatcher {
    registry: Arc<SessionRegistry>,
}

impl ProtocolDispatcher {
    /// Creates a dispatcher backed by `registry`.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Returns the registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Handles one inbound text frame, sending any reply on `connection`.
    pub async fn handle_text(&self, connection: &Arc<ClientConnection>, text: &str) {
        match self.dispatch(connection, text).await {
            Ok(Some(reply)) => connection.send_or_log(&reply).await,
            Ok(None) => {}
            Err(e) => {
                if e.is_client_error() {
                    debug!(connection_id = %connection.id(), error = %e, "Rejected request");
                } else {
                    error!(connection_id = %connection.id(), error = %e, "Failed to handle request");
                }
                connection.send_or_log(&e.to_frame()).await;
            }
        }
    }

    /// Decodes and routes one inbound text frame.
    ///
    /// Returns `Ok(Some(reply))` when a reply should be sent, `Ok(None)` when
    /// none is needed.
    pub async fn dispatch(&self, connection: &Arc<ClientConnection>, text: &str) -> RouterResult {
        let request = parse_inbound(text)?;
        self.route(connection, request).await
    }

    /// Routes a decoded request.
    pub async fn route(
        &self,
        connection: &Arc<ClientConnection>,
        request: TerminalRequest,
    ) -> RouterResult {
        match request {
            TerminalRequest::NewSession(req) => self.handle_new_session(connection, req).await,
            TerminalRequest::Type(req) => self.handle_type(connection, req).await,
            TerminalRequest::Unknown(event) => {
                debug!(connection_id = %connection.id(), event = %event, "Ignoring unknown event");
                Ok(None)
            }
        }
    }

    async fn handle_new_session(
        &self,
        connection: &Arc<ClientConnection>,
        req: NewSession,
    ) -> RouterResult {
        let target = Target::new(&req.namespace, &req.pod)?;
        let session = self.registry.create(Arc::clone(connection), target).await?;
        let session_id = session.id().clone();

        connection.set_default_session(session_id.clone()).await;
        info!(
            connection_id = %connection.id(),
            session_id = %session_id,
            target = %session.target(),
            "Created session"
        );

        Ok(Some(OutboundFrame::new_session(session_id)))
    }

    async fn handle_type(&self, connection: &Arc<ClientConnection>, req: TypeText) -> RouterResult {
        let session_id = connection
            .default_session()
            .await
            .ok_or(RouterError::SessionNeeded)?;
        let session = self
            .registry
            .get(&session_id)
            .ok_or(RouterError::SessionNeeded)?;

        if session.is_closed() {
            return Err(SessionError::Closed(session_id).into());
        }
        session.write(&req.text).await?;
        Ok(None)
    }

    /// Resizes a session by id.
    ///
    /// Unknown ids get an error reply and never reach a remote process.
    pub async fn resize(&self, session_id: &str, req: ResizeRequest) -> ResizeResponse {
        let Some(session) = self.registry.get(session_id) else {
            warn!(session_id = %session_id, "Resize for unknown session");
            return ResizeResponse::not_found(session_id);
        };

        session.resize(req.cols, req.rows).await;
        ResizeResponse::Echo { req }
    }
}

impl std::fmt::Debug for ProtocolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolDispatcher")
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::terminal::tests::{FakeHandles, FakeProcess};
    use crate::session::{RegistrySettings, RemoteBackend, RemoteProcess};
    use protocol::{ServerEvent, StreamKind};
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[derive(Default)]
    struct FakeBackend {
        handles: Mutex<Vec<FakeHandles>>,
        fail: bool,
    }

    impl RemoteBackend for FakeBackend {
        fn open(&self, _target: &Target) -> Result<Box<dyn RemoteProcess>, SessionError> {
            if self.fail {
                return Err(SessionError::RemoteUnavailable("cluster unreachable".to_string()));
            }
            let (process, handles) = FakeProcess::new();
            self.handles.lock().unwrap().push(handles);
            Ok(Box::new(process))
        }
    }

    struct Harness {
        dispatcher: ProtocolDispatcher,
        backend: Arc<FakeBackend>,
        connection: Arc<ClientConnection>,
        rx: mpsc::UnboundedReceiver<String>,
    }

    fn harness_with(backend: FakeBackend) -> Harness {
        let backend = Arc::new(backend);
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&backend) as Arc<dyn RemoteBackend>,
            RegistrySettings::default(),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        Harness {
            dispatcher: ProtocolDispatcher::new(registry),
            backend,
            connection: ClientConnection::new(Box::new(tx)),
            rx,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeBackend::default())
    }

    impl Harness {
        async fn send(&self, text: &str) {
            self.dispatcher.handle_text(&self.connection, text).await;
        }

        async fn reply(&mut self) -> OutboundFrame {
            let text = timeout(Duration::from_secs(5), self.rx.recv())
                .await
                .expect("timed out waiting for reply")
                .expect("channel closed");
            OutboundFrame::from_json(&text).unwrap()
        }

        async fn new_session(&mut self) -> String {
            self.send(r#"{"to":"tm","d":{"event":"new-session","namespace":"dev","pod":"web-0"}}"#)
                .await;
            match self.reply().await {
                OutboundFrame::Event(ServerEvent::NewSession { session_id }) => session_id,
                other => panic!("expected new-session reply, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_new_session_replies_with_id() {
        let mut h = harness();
        let id = h.new_session().await;

        assert!(uuid::Uuid::parse_str(&id).is_ok());
        assert!(h.dispatcher.registry().contains(&id));
        assert_eq!(h.connection.default_session().await, Some(id));
    }

    #[tokio::test]
    async fn test_second_new_session_becomes_default() {
        let mut h = harness();
        let first = h.new_session().await;
        let second = h.new_session().await;

        assert_ne!(first, second);
        assert_eq!(h.connection.default_session().await, Some(second));
        assert_eq!(h.dispatcher.registry().len(), 2);
    }

    #[tokio::test]
    async fn test_type_without_session() {
        let mut h = harness();
        h.send(r#"{"to":"tm","d":{"event":"type","text":"ls\n"}}"#).await;

        assert_eq!(h.reply().await.error_text(), Some("Session needed to type"));
        assert!(h.backend.handles.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_type_writes_to_default_session() {
        let mut h = harness();
        h.new_session().await;
        h.send(r#"{"to":"tm","d":{"event":"type","text":"echo hi\n"}}"#).await;

        let handles = h.backend.handles.lock().unwrap();
        assert_eq!(handles[0].input.lock().unwrap().as_slice(), b"echo hi\n");
        assert!(h.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_type_after_process_exit() {
        let mut h = harness();
        h.new_session().await;
        h.backend.handles.lock().unwrap()[0]
            .open
            .store(false, Ordering::SeqCst);

        h.send(r#"{"to":"tm","d":{"event":"type","text":"x"}}"#).await;
        assert_eq!(h.reply().await.error_text(), Some("Session closed"));
    }

    #[tokio::test]
    async fn test_type_after_eviction_needs_session() {
        let mut h = harness();
        let id = h.new_session().await;
        h.dispatcher.registry().remove(&id).await.unwrap();

        h.send(r#"{"to":"tm","d":{"event":"type","text":"x"}}"#).await;
        assert_eq!(h.reply().await.error_text(), Some("Session needed to type"));
    }

    #[tokio::test]
    async fn test_malformed_frames_have_no_handler() {
        let mut h = harness();
        for text in [
            "not json",
            "[1,2,3]",
            r#"{"d":{"event":"type","text":"x"}}"#,
            r#"{"to":"files","d":{"event":"type","text":"x"}}"#,
            r#"{"to":"tm","d":"type"}"#,
        ] {
            h.send(text).await;
            assert_eq!(
                h.reply().await.error_text(),
                Some("No handler for message"),
                "for {text}"
            );
        }
    }

    #[tokio::test]
    async fn test_backend_failure_is_internal_error() {
        let mut h = harness_with(FakeBackend {
            fail: true,
            ..FakeBackend::default()
        });
        h.send(r#"{"to":"tm","d":{"event":"new-session","namespace":"","pod":"web-0"}}"#)
            .await;

        assert_eq!(h.reply().await.error_text(), Some("Internal error"));
        assert!(h.dispatcher.registry().is_empty());
        assert_eq!(h.connection.default_session().await, None);
    }

    #[tokio::test]
    async fn test_invalid_target_is_internal_error() {
        let mut h = harness();
        h.send(r#"{"to":"tm","d":{"event":"new-session","namespace":"dev","pod":"--all"}}"#)
            .await;

        assert_eq!(h.reply().await.error_text(), Some("Internal error"));
        assert!(h.backend.handles.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_type_without_text_is_internal_error() {
        let mut h = harness();
        h.new_session().await;
        h.send(r#"{"to":"tm","d":{"event":"type"}}"#).await;
        assert_eq!(h.reply().await.error_text(), Some("Internal error"));
    }

    #[tokio::test]
    async fn test_unknown_event_is_ignored() {
        let mut h = harness();
        h.send(r#"{"to":"tm","d":{"event":"ping"}}"#).await;
        assert!(h.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resize_unknown_session() {
        let h = harness();
        let reply = h
            .dispatcher
            .resize("X", ResizeRequest { cols: 100, rows: 30 })
            .await;
        assert_eq!(reply, ResizeResponse::not_found("X"));
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            serde_json::json!({"error": "Session not found: X"})
        );
    }

    #[tokio::test]
    async fn test_resize_echoes_request() {
        let mut h = harness();
        let id = h.new_session().await;
        let req = ResizeRequest { cols: 120, rows: 40 };

        let reply = h.dispatcher.resize(&id, req).await;
        assert_eq!(reply, ResizeResponse::Echo { req });

        let handles = h.backend.handles.lock().unwrap();
        assert_eq!(handles[0].resizes.lock().unwrap().as_slice(), &[(120, 40)]);
    }

    #[tokio::test]
    async fn test_session_output_reaches_connection() {
        let mut h = harness();
        h.new_session().await;
        h.backend.handles.lock().unwrap()[0]
            .stdout
            .send(b"hi\r\n".to_vec())
            .unwrap();

        let frame = h.reply().await;
        assert_eq!(
            frame.decode_update().unwrap(),
            Some((StreamKind::Stdout, b"hi\r\n".to_vec()))
        );
    }

    #[test]
    fn test_router_error_frames() {
        assert_eq!(
            RouterError::Session(SessionError::NotFound("abc".to_string()))
                .to_frame()
                .error_text(),
            Some("Session not found: abc")
        );
        assert_eq!(
            RouterError::Session(SessionError::LimitReached(100))
                .to_frame()
                .error_text(),
            Some("Internal error")
        );
        assert_eq!(
            RouterError::Protocol(ProtocolError::InvalidPayload("x".into()))
                .to_frame()
                .error_text(),
            Some("Internal error")
        );
    }
}
