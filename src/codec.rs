//! Frame codec for [`tokio_util::codec::Framed`].
//!
//! The [`Decoder`] is the server side of the wire: it expects masked client frames and runs the
//! [`Validator`] on every header before waiting for the payload, so a bad length or a forbidden
//! flag is rejected without buffering the body. The [`Encoder`] writes any [`Frame`], masking it
//! when a key is set.
use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, FrameHeader, MAX_HEAD_SIZE},
    mask::apply_mask,
    validate::{check_close_payload, Validator},
    OpCode, WebSocketError,
};

enum ReadState {
    /// First two bytes parsed, waiting for the extended length and the mask.
    Header { header: FrameHeader, extra: usize },
    /// Header validated, waiting for `header.payload_len` bytes.
    Payload {
        header: FrameHeader,
        mask: Option<[u8; 4]>,
    },
}

/// Encoder and decoder pair driving one connection.
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl From<(Decoder, Encoder)> for Codec {
    fn from((decoder, encoder): (Decoder, Encoder)) -> Self {
        Self { decoder, encoder }
    }
}

impl codec::Decoder for Codec {
    type Item = Frame;
    type Error = WebSocketError;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = WebSocketError;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}

/// Incremental decoder for client frames.
///
/// Returns `Ok(None)` while `src` holds an incomplete frame; the bytes already parsed are
/// consumed and the position is remembered for the next call.
pub struct Decoder {
    state: Option<ReadState>,
    validator: Validator,
    max_payload_size: usize,
}

impl Decoder {
    /// Creates a decoder rejecting frames whose payload is larger than `max_payload_size`.
    pub fn new(validator: Validator, max_payload_size: usize) -> Self {
        Self {
            state: None,
            validator,
            max_payload_size,
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let header = FrameHeader::from_head(src[0], src[1]);
                    let extra = match header.payload_len {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    } + if header.masked { 4 } else { 0 };
                    src.advance(2);

                    self.state = Some(ReadState::Header { header, extra });
                }
                Some(ReadState::Header { mut header, extra }) => {
                    if src.remaining() < extra {
                        self.state = Some(ReadState::Header { header, extra });
                        return Ok(None);
                    }

                    header.payload_len = match header.payload_len {
                        126 => u64::from(src.get_u16()),
                        127 => src.get_u64(),
                        len => len,
                    };
                    let mask = header.masked.then(|| src.get_u32().to_be_bytes());

                    self.validator.check_header(&header)?;
                    let payload_len = usize::try_from(header.payload_len)
                        .map_err(|_| WebSocketError::FrameTooLarge)?;
                    if payload_len > self.max_payload_size {
                        return Err(WebSocketError::FrameTooLarge);
                    }

                    src.reserve(payload_len);
                    self.state = Some(ReadState::Payload { header, mask });
                }
                Some(ReadState::Payload { header, mask }) => {
                    // fits in usize, checked in the previous state
                    let payload_len = header.payload_len as usize;
                    if src.remaining() < payload_len {
                        self.state = Some(ReadState::Payload { header, mask });
                        return Ok(None);
                    }

                    let mut frame = Frame {
                        fin: header.fin,
                        rsv1: header.rsv1,
                        rsv2: header.rsv2,
                        rsv3: header.rsv3,
                        opcode: header.opcode,
                        mask,
                        payload: src.split_to(payload_len),
                    };
                    frame.unmask();

                    if frame.opcode == OpCode::Close {
                        check_close_payload(&frame.payload)?;
                    }

                    log::trace!(
                        "decoded {:?} frame (fin: {}, {} bytes)",
                        frame.opcode,
                        frame.fin,
                        frame.payload.len()
                    );
                    return Ok(Some(frame));
                }
            }
        }
    }
}

/// Serializes frames. Masked frames are masked on the way out.
#[derive(Default)]
pub struct Encoder;

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut head = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut head);

        if let Some(mask) = frame.mask {
            apply_mask(&mut frame.payload, mask);
        }

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&head[..size]);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}
