//! Structural checks applied to every frame received from a client.
//!
//! Header rules run in a fixed order and the first failure wins:
//!
//! 1. the opcode is known,
//! 2. RSV1 only on the first frame of a message and only when permessage-deflate was
//!    negotiated, RSV2 and RSV3 never,
//! 3. the frame is masked,
//! 4. control frames carry at most 125 bytes and are not fragmented.
//!
//! Close payloads are checked once the payload is available, see [`check_close_payload`].
use crate::{
    close::CloseCode,
    frame::{FrameHeader, OpCode, MAX_CONTROL_PAYLOAD},
    Result, WebSocketError,
};

/// Validates frame headers for one connection.
#[derive(Debug, Clone, Copy)]
pub struct Validator {
    compression: bool,
}

impl Validator {
    /// `compression` tells whether permessage-deflate was negotiated, which gives RSV1 a meaning.
    pub fn new(compression: bool) -> Self {
        Self { compression }
    }

    pub fn check_header(&self, header: &FrameHeader) -> Result<()> {
        if header.opcode.is_reserved() {
            return Err(WebSocketError::InvalidOpCode(u8::from(header.opcode)));
        }

        // RSV1 marks the first frame of a compressed message, nothing else
        let first_data_frame = matches!(header.opcode, OpCode::Text | OpCode::Binary);
        if header.rsv1 && (!self.compression || !first_data_frame) {
            return Err(WebSocketError::CompressionNotNegotiated);
        }
        if header.rsv2 || header.rsv3 {
            return Err(WebSocketError::ReservedBitsNotZero);
        }

        if !header.masked {
            return Err(WebSocketError::UnmaskedFrame);
        }

        if header.opcode.is_control() {
            if header.payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(WebSocketError::ControlFrameTooLarge);
            }
            if !header.fin {
                return Err(WebSocketError::ControlFrameFragmented);
            }
        }

        Ok(())
    }
}

/// Checks the payload of a received close frame.
///
/// An empty payload is valid. Otherwise it must start with a code that is legal on the wire,
/// followed by an optional UTF-8 reason.
pub fn check_close_payload(payload: &[u8]) -> Result<()> {
    match payload {
        [] => Ok(()),
        [_] => Err(WebSocketError::InvalidCloseFrame),
        [hi, lo, reason @ ..] => {
            let code = u16::from_be_bytes([*hi, *lo]);
            if !CloseCode::from(code).is_allowed() {
                return Err(WebSocketError::InvalidCloseCode(code));
            }
            if utf8(reason).is_none() {
                return Err(WebSocketError::InvalidCloseReason);
            }
            Ok(())
        }
    }
}

/// Returns `bytes` as a string slice when it is valid UTF-8.
#[inline]
pub fn utf8(bytes: &[u8]) -> Option<&str> {
    #[cfg(feature = "simd")]
    {
        simdutf8::basic::from_utf8(bytes).ok()
    }
    #[cfg(not(feature = "simd"))]
    {
        std::str::from_utf8(bytes).ok()
    }
}
