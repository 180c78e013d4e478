//! Turns data frames into complete messages.
//!
//! A message is either one frame with FIN set or a text/binary frame followed by continuation
//! frames, the last of which has FIN set. The reassembler tracks which kind of message is in
//! progress, buffers fragments, inflates compressed messages once the last fragment arrives and
//! checks that text is UTF-8.
//!
//! Control frames may be interleaved with fragments; the connection handles them and never
//! passes them here.
use bytes::{Bytes, BytesMut};

use crate::{
    compression::Decompressor,
    frame::{Frame, OpCode},
    validate::utf8,
    Result, WebSocketError,
};

/// A complete application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    pub fn len(&self) -> usize {
        match self {
            Message::Text(text) => text.len(),
            Message::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fragmentation state of the inbound direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    /// A fragmented text message is in progress. `compressed` comes from the first frame's RSV1.
    InText { compressed: bool },
    /// A fragmented binary message is in progress.
    InBinary { compressed: bool },
}

pub struct Reassembler {
    state: State,
    buffer: BytesMut,
    inflate: Option<Decompressor>,
    max_message_size: usize,
}

impl Reassembler {
    /// `inflate` is the connection's decompressor when permessage-deflate was negotiated.
    pub fn new(inflate: Option<Decompressor>, max_message_size: usize) -> Self {
        Self {
            state: State::Idle,
            buffer: BytesMut::new(),
            inflate,
            max_message_size,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Feeds one data frame. Returns the message it completes, if any.
    ///
    /// Errors are fatal for the connection; the state is left as it was.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>> {
        let compressed = match (self.state, frame.opcode) {
            (State::Idle, OpCode::Continuation) => {
                return Err(WebSocketError::InvalidContinuationFrame)
            }
            (State::Idle, OpCode::Text | OpCode::Binary) => frame.rsv1,
            (State::InText { .. } | State::InBinary { .. }, OpCode::Text) => {
                return Err(WebSocketError::UnexpectedTextFrame)
            }
            (State::InText { .. } | State::InBinary { .. }, OpCode::Binary) => {
                return Err(WebSocketError::UnexpectedBinaryFrame)
            }
            (State::InText { compressed } | State::InBinary { compressed }, OpCode::Continuation) => {
                compressed
            }
            (_, opcode) => {
                log::trace!("reassembler ignoring {opcode:?} frame");
                return Ok(None);
            }
        };

        if self.buffer.len() + frame.payload.len() > self.max_message_size {
            return Err(WebSocketError::MessageTooLarge);
        }

        let is_text = match (self.state, frame.opcode) {
            (State::InText { .. }, _) | (State::Idle, OpCode::Text) => true,
            _ => false,
        };

        if !frame.fin {
            self.buffer.extend_from_slice(&frame.payload);
            self.state = if is_text {
                State::InText { compressed }
            } else {
                State::InBinary { compressed }
            };
            return Ok(None);
        }

        let payload = if self.state == State::Idle {
            frame.payload
        } else {
            self.buffer.extend_from_slice(&frame.payload);
            self.buffer.split()
        };
        self.state = State::Idle;

        let payload = if compressed {
            let inflate = self
                .inflate
                .as_mut()
                .ok_or(WebSocketError::CompressionNotNegotiated)?;
            inflate.decompress(&payload)?
        } else {
            payload
        };

        if payload.len() > self.max_message_size {
            return Err(WebSocketError::MessageTooLarge);
        }

        let message = if is_text {
            let text = utf8(&payload).ok_or(WebSocketError::InvalidUTF8)?;
            Message::Text(text.to_owned())
        } else {
            Message::Binary(payload.freeze())
        };

        Ok(Some(message))
    }
}
