//! # wsengine
//! Server-side implementation of the WebSocket protocol (RFC 6455) and the permessage-deflate
//! compression extension (RFC 7692) for connections that were already upgraded by an HTTP layer.
//!
//! The crate takes over once the handshake is done: it receives the upgraded byte stream and the
//! client's `Sec-WebSocket-Extensions` request value, returns the response value for that header,
//! and from then on turns frames into application messages and back.
//!
//! # Pipeline
//! Every connection runs in its own tokio task, which processes frames strictly in the order they
//! are received:
//!
//! ```text
//! bytes -> codec (decode + validate) -> reassembly (+ inflate) -> WebSocketService
//! WebSocketService -> Connection::send_* -> deflate -> codec (encode) -> bytes
//! ```
//!
//! - Control frames are handled immediately: pings are answered with pongs, pongs are handed to
//!   the service, close frames complete the close handshake.
//! - Protocol violations close the connection with a close frame carrying the close code and a
//!   diagnostic reason (see [`WebSocketError::close_code`]).
//! - Services can ask for an idle timeout. An idle connection receives a keepalive ping halfway
//!   through the timeout and is dropped when the timeout expires without any traffic.
//!
//! # Compression
//! permessage-deflate is negotiated from the client's offer. The negotiation is permissive:
//! malformed parameters fall back to defaults instead of failing the upgrade. Each connection owns
//! its compressor and decompressor, and context takeover is honoured in both directions.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use wsengine::{CloseCode, Connection, Options, Registry, WebSocketService};
//!
//! struct Echo;
//!
//! impl WebSocketService for Echo {
//!     fn connected(&self, _connection: &Connection) {}
//!
//!     fn disconnected(&self, _connection: &Connection, _reason: CloseCode) {}
//!
//!     fn received_binary(&self, message: Bytes, from: &Connection) {
//!         let _ = from.send_binary(message);
//!     }
//!
//!     fn received_text(&self, message: String, from: &Connection) {
//!         let _ = from.send_text(message);
//!     }
//! }
//!
//! async fn on_upgraded(registry: Arc<Registry>, io: tokio::net::TcpStream) -> wsengine::Result<()> {
//!     registry.register(Arc::new(Echo), "/echo");
//!
//!     // `path` and `extensions` come from the HTTP upgrade request.
//!     let upgrade = registry.upgrade("/echo", Some("permessage-deflate"), Options::default())?;
//!     // send `upgrade.response_header()` back as `Sec-WebSocket-Extensions`, then:
//!     let reason = upgrade.serve(io).await;
//!     log::info!("connection closed: {reason:?}");
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod close;
pub mod codec;
mod compression;
mod connection;
pub mod extensions;
pub mod frame;
mod mask;
mod options;
pub mod reassembly;
mod registry;
mod service;
pub mod validate;

use thiserror::Error;

pub use close::CloseCode;
pub use compression::{Compressor, Decompressor};
pub use connection::{Connection, ConnectionHandle, ConnectionId};
pub use extensions::ExtensionParameters;
pub use frame::{Frame, FrameHeader, OpCode};
pub use options::{CompressionLevel, Options};
pub use reassembly::Message;
pub use registry::{normalize_path, Registry, Upgrade};
pub use service::WebSocketService;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Errors raised while processing a WebSocket connection.
///
/// The `Display` text of the protocol and content variants is exactly the reason that is written
/// into the close frame sent to the peer, so those messages are part of the wire contract.
///
/// The variants fall into four groups:
///
/// - Protocol errors: malformed or illegal frames. Closed with [`CloseCode::Protocol`].
/// - Content errors: invalid UTF-8 or undecodable compressed data. Closed with
///   [`CloseCode::Invalid`].
/// - Limits: frames or messages over the configured size. Closed with [`CloseCode::Size`].
/// - Local errors: I/O failures and API misuse, which never produce a close frame.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// The opcode nibble holds one of the reserved values (0x3-0x7, 0xB-0xF).
    #[error("Parsed a frame with an invalid operation code of {0}")]
    InvalidOpCode(u8),

    /// RSV1 was set on a connection that did not negotiate permessage-deflate.
    #[error("RSV1 must be 0 unless negotiated to define meaning for non-zero values")]
    CompressionNotNegotiated,

    /// RSV2 or RSV3 was set. No extension defining them is supported.
    #[error("RSV2 and RSV3 must be 0 unless negotiated to define meaning for non-zero values")]
    ReservedBitsNotZero,

    /// Clients must mask every frame they send (RFC 6455, Section 5.1).
    #[error("Received a frame from a client that wasn't masked")]
    UnmaskedFrame,

    /// A close, ping or pong frame carried more than 125 bytes of payload.
    #[error("Control frames are only allowed to have payload up to and including 125 octets")]
    ControlFrameTooLarge,

    /// A close, ping or pong frame had the FIN bit cleared.
    #[error("Control frames must not be fragmented")]
    ControlFrameFragmented,

    /// A close frame with a single byte of payload, which cannot hold a status code.
    #[error("Close frame payload must be empty or at least 2 bytes long")]
    InvalidCloseFrame,

    /// A close code that is not legal on the wire, either received from the peer or
    /// passed to [`Connection::close`].
    #[error("Invalid close code {0}")]
    InvalidCloseCode(u16),

    /// The reason of a received close frame is not valid UTF-8.
    #[error("Failed to convert received close message to UTF-8 String")]
    InvalidCloseReason,

    /// A continuation frame arrived while no fragmented message was in progress.
    #[error("Continuation sent with prior binary or text frame")]
    InvalidContinuationFrame,

    /// A text frame arrived while a fragmented binary message was in progress.
    #[error("A text frame must be the first in the message")]
    UnexpectedTextFrame,

    /// A binary frame arrived while a fragmented text message was in progress.
    #[error("A binary frame must be the first in the message")]
    UnexpectedBinaryFrame,

    /// A complete text message is not valid UTF-8.
    #[error("Failed to convert received payload to UTF-8 String")]
    InvalidUTF8,

    /// The compressed payload of a message could not be inflated.
    #[error("Failed to decompress received payload")]
    Decompression(#[source] std::io::Error),

    /// An outgoing message could not be deflated.
    #[error("Failed to compress outgoing payload")]
    Compression(#[source] std::io::Error),

    /// A frame announced a payload larger than [`Options::max_payload_read`].
    #[error("Frame payload exceeds the maximum allowed size")]
    FrameTooLarge,

    /// A reassembled (or inflated) message grew larger than [`Options::max_message_size`].
    #[error("Message exceeds the maximum allowed size")]
    MessageTooLarge,

    /// The connection is closing or closed and does not accept more messages.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// No service is registered on the requested path.
    #[error("No WebSocket service registered on path {0}")]
    ServiceNotFound(String),

    /// Wraps I/O errors from the underlying transport.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl WebSocketError {
    /// Returns the close code sent to the peer when this error terminates a connection.
    ///
    /// `None` means the error is local: the connection is dropped (or the call fails) without
    /// writing a close frame.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::InvalidOpCode(_)
            | Self::CompressionNotNegotiated
            | Self::ReservedBitsNotZero
            | Self::UnmaskedFrame
            | Self::ControlFrameTooLarge
            | Self::ControlFrameFragmented
            | Self::InvalidCloseFrame
            | Self::InvalidCloseCode(_)
            | Self::InvalidContinuationFrame
            | Self::UnexpectedTextFrame
            | Self::UnexpectedBinaryFrame => Some(CloseCode::Protocol),
            Self::InvalidCloseReason | Self::InvalidUTF8 | Self::Decompression(_) => {
                Some(CloseCode::Invalid)
            }
            Self::FrameTooLarge | Self::MessageTooLarge => Some(CloseCode::Size),
            Self::Compression(_) => Some(CloseCode::Error),
            Self::ConnectionClosed | Self::ServiceNotFound(_) | Self::IoError(_) => None,
        }
    }

    /// Returns the reason text written after the close code.
    ///
    /// An illegal close code is answered with the bare protocol error code and no reason.
    pub fn close_reason(&self) -> String {
        match self {
            Self::InvalidCloseCode(_) => String::new(),
            other => other.to_string(),
        }
    }
}
