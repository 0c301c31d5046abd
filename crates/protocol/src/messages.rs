//! Frame definitions for the terminal channel.
//!
//! Every frame is one JSON text message. Inbound frames are wrapped in an
//! envelope addressed to the terminal manager (`{"to": "tm", "d": {...}}`);
//! outbound frames are flat objects carrying either a `cause` or an `error`.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProtocolError, Result};

/// Envelope address of the terminal manager.
pub const TERMINAL_ADDRESS: &str = "tm";

/// Reply texts carried in `{"error": ...}` frames.
pub mod errors {
    /// The frame was not addressed to the terminal manager or was not an object.
    pub const NO_HANDLER: &str = "No handler for message";
    /// Handling the frame failed for any other reason.
    pub const INTERNAL: &str = "Internal error";
    /// `type` arrived on a channel without a default session.
    pub const SESSION_NEEDED: &str = "Session needed to type";
    /// `type` arrived for a session whose remote process is gone.
    pub const SESSION_CLOSED: &str = "Session closed";

    /// Reply for a resize against an unknown session id.
    pub fn session_not_found(id: &str) -> String {
        format!("Session not found: {id}")
    }
}

/// Output sub-stream of a remote process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    /// Primary output (standard output).
    #[serde(rename = "STDOUT")]
    Stdout,
    /// Diagnostic output (standard error).
    #[serde(rename = "STDERR")]
    Stderr,
}

impl StreamKind {
    /// Wire label of the stream.
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "STDOUT",
            StreamKind::Stderr => "STDERR",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Inbound frames
// ============================================================================

/// Raw inbound envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Handler the frame is addressed to.
    pub to: String,
    /// Handler-specific payload.
    pub d: Value,
}

impl Envelope {
    /// Wraps a terminal request payload in an envelope addressed to `tm`.
    pub fn terminal(request: &TerminalRequest) -> Result<Self> {
        Ok(Self {
            to: TERMINAL_ADDRESS.to_string(),
            d: request.to_value()?,
        })
    }

    /// Serializes the envelope to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Payload of a `new-session` request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NewSession {
    /// Namespace of the target pod. Empty means the backend default.
    #[serde(default)]
    pub namespace: String,
    /// Name of the target pod.
    #[serde(default)]
    pub pod: String,
}

/// Payload of a `type` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeText {
    /// Keystrokes to forward to the remote process.
    pub text: String,
}

/// A decoded request addressed to the terminal manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalRequest {
    /// Open a new remote shell and make it the channel's default session.
    NewSession(NewSession),
    /// Forward keystrokes to the channel's default session.
    Type(TypeText),
    /// An event name this version does not handle.
    Unknown(String),
}

impl TerminalRequest {
    /// Name carried in `d.event`.
    pub fn event_name(&self) -> &str {
        match self {
            TerminalRequest::NewSession(_) => "new-session",
            TerminalRequest::Type(_) => "type",
            TerminalRequest::Unknown(name) => name,
        }
    }

    /// Decodes the `d` object of an envelope.
    pub fn from_payload(payload: &Map<String, Value>) -> Result<Self> {
        let event = payload
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let decode_err = |e: serde_json::Error| ProtocolError::InvalidPayload(e.to_string());

        match event {
            "new-session" => serde_json::from_value(Value::Object(payload.clone()))
                .map(TerminalRequest::NewSession)
                .map_err(decode_err),
            "type" => serde_json::from_value(Value::Object(payload.clone()))
                .map(TerminalRequest::Type)
                .map_err(decode_err),
            other => Ok(TerminalRequest::Unknown(other.to_string())),
        }
    }

    fn to_value(&self) -> Result<Value> {
        let mut value = match self {
            TerminalRequest::NewSession(req) => serde_json::to_value(req)?,
            TerminalRequest::Type(req) => serde_json::to_value(req)?,
            TerminalRequest::Unknown(_) => Value::Object(Map::new()),
        };
        if let Value::Object(map) = &mut value {
            map.insert(
                "event".to_string(),
                Value::String(self.event_name().to_string()),
            );
        }
        Ok(value)
    }
}

/// Decodes one inbound text frame.
///
/// Anything that is not a JSON object with a string `to` equal to
/// [`TERMINAL_ADDRESS`] and an object `d` is rejected with
/// [`ProtocolError::NoHandler`].
pub fn parse_inbound(text: &str) -> Result<TerminalRequest> {
    let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::NoHandler)?;

    let Value::Object(envelope) = value else {
        return Err(ProtocolError::NoHandler);
    };

    match envelope.get("to").and_then(Value::as_str) {
        Some(TERMINAL_ADDRESS) => {}
        _ => return Err(ProtocolError::NoHandler),
    }

    match envelope.get("d") {
        Some(Value::Object(payload)) => TerminalRequest::from_payload(payload),
        _ => Err(ProtocolError::NoHandler),
    }
}

// ============================================================================
// Outbound frames
// ============================================================================

/// Unsolicited or reply events sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause")]
pub enum ServerEvent {
    /// A chunk of process output, base64 encoded.
    #[serde(rename = "update")]
    Update {
        /// Sub-stream the bytes came from.
        stream: StreamKind,
        /// Base64 of the raw bytes.
        b64: String,
    },
    /// The sub-stream reached end-of-data.
    #[serde(rename = "EOF")]
    Eof {
        /// Sub-stream that ended.
        stream: StreamKind,
    },
    /// Reply to `new-session`.
    #[serde(rename = "new-session")]
    NewSession {
        /// Identifier of the freshly created session.
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

/// An `{"error": ...}` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    /// Human readable reason.
    pub error: String,
}

/// Any frame the server sends on the client channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    /// A `cause`-tagged event.
    Event(ServerEvent),
    /// An error reply.
    Error(ErrorFrame),
}

impl OutboundFrame {
    /// Builds an `update` frame for a chunk of output.
    pub fn update(stream: StreamKind, bytes: &[u8]) -> Self {
        OutboundFrame::Event(ServerEvent::Update {
            stream,
            b64: BASE64.encode(bytes),
        })
    }

    /// Builds an `EOF` frame.
    pub fn eof(stream: StreamKind) -> Self {
        OutboundFrame::Event(ServerEvent::Eof { stream })
    }

    /// Builds the reply to `new-session`.
    pub fn new_session(session_id: impl Into<String>) -> Self {
        OutboundFrame::Event(ServerEvent::NewSession {
            session_id: session_id.into(),
        })
    }

    /// Builds an error frame.
    pub fn error(message: impl Into<String>) -> Self {
        OutboundFrame::Error(ErrorFrame {
            error: message.into(),
        })
    }

    /// Returns the error text if this is an error frame.
    pub fn error_text(&self) -> Option<&str> {
        match self {
            OutboundFrame::Error(frame) => Some(&frame.error),
            OutboundFrame::Event(_) => None,
        }
    }

    /// Decodes the payload of an `update` frame.
    ///
    /// Returns `Ok(None)` for every other frame.
    pub fn decode_update(&self) -> Result<Option<(StreamKind, Vec<u8>)>> {
        match self {
            OutboundFrame::Event(ServerEvent::Update { stream, b64 }) => {
                Ok(Some((*stream, BASE64.decode(b64)?)))
            }
            _ => Ok(None),
        }
    }

    /// Serializes the frame to a JSON text message.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a JSON text message produced by [`OutboundFrame::to_json`].
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// ============================================================================
// Resize operation
// ============================================================================

/// Body of the resize request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    /// Terminal width in columns.
    pub cols: u16,
    /// Terminal height in rows.
    pub rows: u16,
}

/// Reply of the resize request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResizeResponse {
    /// The session was found; the request is echoed back.
    Echo {
        /// The request as received.
        req: ResizeRequest,
    },
    /// The session was not found.
    Error(ErrorFrame),
}

impl ResizeResponse {
    /// Builds the reply for an unknown session id.
    pub fn not_found(session_id: &str) -> Self {
        ResizeResponse::Error(ErrorFrame {
            error: errors::session_not_found(session_id),
        })
    }
}
