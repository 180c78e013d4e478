//! # Frame
//!
//! WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! ```
//!
//! Two types live here:
//!
//! - [`FrameHeader`]: everything known about a frame before its payload is read. The decoder
//!   validates it before buffering the payload.
//! - [`Frame`]: a complete frame. Frames produced by the decoder are already unmasked.
//!
//! ```rust
//! use wsengine::{CloseCode, Frame};
//!
//! let text = Frame::text("Hello, WebSocket!");
//! let ping = Frame::ping("are you there");
//! let close = Frame::close(CloseCode::Normal, "bye");
//! assert_eq!(close.close_code(), Some(CloseCode::Normal));
//! ```
use bytes::BytesMut;

use crate::close::CloseCode;

/// Largest payload a close, ping or pong frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// WebSocket operation code, the low nibble of the first header byte.
///
/// The numeric values are defined in [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8).
/// Values 0x3-0x7 and 0xB-0xF are kept as [`OpCode::Reserved`] so the validator can report them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    ///
    /// Control frames cannot be fragmented and carry at most 125 bytes.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Returns `true` for opcodes with no meaning assigned by RFC 6455.
    pub fn is_reserved(&self) -> bool {
        matches!(*self, OpCode::Reserved(_))
    }
}

impl From<u8> for OpCode {
    /// Interprets the low nibble of `value`.
    fn from(value: u8) -> Self {
        match value & 0x0F {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
            OpCode::Reserved(n) => n & 0x0F,
        }
    }
}

/// The fixed part of a frame: flags, opcode, mask bit and announced payload length.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: OpCode,
    pub masked: bool,
    pub payload_len: u64,
}

impl FrameHeader {
    /// Decodes the first two header bytes. `payload_len` holds the 7-bit length field, which
    /// the decoder replaces once the extended length has been read.
    pub(crate) fn from_head(first: u8, second: u8) -> Self {
        Self {
            fin: first & 0x80 != 0,
            rsv1: first & 0x40 != 0,
            rsv2: first & 0x20 != 0,
            rsv3: first & 0x10 != 0,
            opcode: OpCode::from(first),
            masked: second & 0x80 != 0,
            payload_len: u64::from(second & 0x7F),
        }
    }
}

/// A single WebSocket frame.
///
/// Fields are public so that tests and custom clients can build frames the engine would reject,
/// e.g. unmasked or fragmented control frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment of a message.
    pub fin: bool,
    /// Per-message compression flag under permessage-deflate.
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: OpCode,
    /// Masking key. Set on frames sent by clients, `None` once decoded.
    pub mask: Option<[u8; 4]>,
    pub payload: BytesMut,
}

impl Frame {
    /// Creates an unmasked frame without any RSV bit.
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<BytesMut>) -> Self {
        Self {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    pub fn text(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Text, payload)
    }

    pub fn binary(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Binary, payload)
    }

    pub fn continuation(fin: bool, payload: impl Into<BytesMut>) -> Self {
        Self::new(fin, OpCode::Continuation, payload)
    }

    pub fn ping(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Ping, payload)
    }

    pub fn pong(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Pong, payload)
    }

    /// Creates a close frame whose payload is the big-endian `code` followed by `reason`.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let reason = reason.as_ref();
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(reason);
        Self::new(true, OpCode::Close, payload)
    }

    /// Creates a close frame with a payload that is not checked in any way.
    pub fn close_raw(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Close, BytesMut::from(payload.as_ref()))
    }

    /// Marks the frame as the first frame of a compressed message.
    pub fn compressed(mut self) -> Self {
        self.rsv1 = true;
        self
    }

    /// Sets the masking key. The encoder masks the payload when writing the frame.
    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }

    #[inline]
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Status code of a close frame, `None` when the payload has no code.
    pub fn close_code(&self) -> Option<CloseCode> {
        let code = u16::from_be_bytes(self.payload.get(0..2)?.try_into().ok()?);
        Some(CloseCode::from(code))
    }

    /// Reason text of a close frame, `None` when absent or not UTF-8.
    pub fn close_reason(&self) -> Option<&str> {
        std::str::from_utf8(self.payload.get(2..)?).ok()
    }

    /// Removes the mask from the payload.
    pub(crate) fn unmask(&mut self) {
        if let Some(mask) = self.mask.take() {
            crate::mask::apply_mask(&mut self.payload, mask);
        }
    }

    /// Writes the frame header into `head` and returns its length (2 to 14 bytes).
    ///
    /// `head` must hold at least [`MAX_HEAD_SIZE`] bytes.
    pub(crate) fn fmt_head(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7
            | (self.rsv1 as u8) << 6
            | (self.rsv2 as u8) << 5
            | (self.rsv3 as u8) << 4
            | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len <= u16::MAX as usize {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        match self.mask {
            Some(mask) => {
                head[1] |= 0x80;
                head[size..size + 4].copy_from_slice(&mask);
                size + 4
            }
            None => size,
        }
    }
}
