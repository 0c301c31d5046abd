//! # PodTerm Protocol Library
//!
//! Frame definitions for the PodTerm terminal channel.
//!
//! ## Overview
//!
//! A browser client drives remote shells over one persistent duplex channel
//! carrying JSON text frames. This crate owns the wire format on both sides:
//!
//! - **Inbound**: `{"to": "tm", "d": {"event": "new-session" | "type", ...}}`
//! - **Outbound**: `update` / `EOF` stream frames, the `new-session` reply,
//!   and `{"error": ...}` replies
//! - **Resize**: the request/response body of the out-of-band resize call
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{parse_inbound, OutboundFrame, StreamKind, TerminalRequest};
//!
//! let request = parse_inbound(r#"{"to":"tm","d":{"event":"type","text":"ls\n"}}"#).unwrap();
//! assert!(matches!(request, TerminalRequest::Type(_)));
//!
//! let frame = OutboundFrame::update(StreamKind::Stdout, b"hi\n");
//! assert_eq!(
//!     frame.to_json().unwrap(),
//!     r#"{"cause":"update","stream":"STDOUT","b64":"aGkK"}"#
//! );
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Inbound and outbound frame definitions
//! - [`error`]: Error types

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    errors, parse_inbound, Envelope, ErrorFrame, NewSession, OutboundFrame, ResizeRequest,
    ResizeResponse, ServerEvent, StreamKind, TerminalRequest, TypeText, TERMINAL_ADDRESS,
};
