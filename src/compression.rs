use std::io;

use bytes::BytesMut;
use flate2::{CompressError, DecompressError, FlushCompress, FlushDecompress, Status};

use crate::{CompressionLevel, Result, WebSocketError};

/// Empty stored block produced by a sync flush. Stripped from compressed messages and restored
/// before inflating them (RFC 7692, Section 7.2).
const SYNC_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Spare capacity kept available for zlib on every call.
const CHUNK: usize = 4096;

const MIN_WINDOW_BITS: u8 = 9;
const MAX_WINDOW_BITS: u8 = 15;

/// Compresses the messages the server sends with permessage-deflate.
///
/// With context takeover the LZ77 window survives between messages, so repeated content
/// compresses better. Otherwise the window is reset after every message and each message can be
/// inflated on its own.
pub struct Compressor {
    compress: flate2::Compress,
    no_context_takeover: bool,
    output: Vec<u8>,
}

impl Compressor {
    /// Creates a raw deflate compressor.
    ///
    /// `window_bits` is clamped to `9..=15`, the range zlib accepts for raw streams.
    pub fn new(level: CompressionLevel, window_bits: u8, no_context_takeover: bool) -> Self {
        let window_bits = window_bits.clamp(MIN_WINDOW_BITS, MAX_WINDOW_BITS);
        Self {
            compress: flate2::Compress::new_with_window_bits(level, false, window_bits),
            no_context_takeover,
            output: Vec::with_capacity(CHUNK),
        }
    }

    /// Compresses one complete message.
    ///
    /// The result ends with a sync flush and has the trailing `00 00 ff ff` removed.
    pub fn compress(&mut self, input: &[u8]) -> Result<BytesMut> {
        let result = self.deflate(input);
        if self.no_context_takeover || result.is_err() {
            self.compress.reset();
        }
        result.map_err(WebSocketError::Compression)
    }

    fn deflate(&mut self, input: &[u8]) -> io::Result<BytesMut> {
        self.output.clear();
        let start = self.compress.total_in();

        loop {
            reserve_chunk(&mut self.output);
            let consumed = (self.compress.total_in() - start) as usize;
            self.compress
                .compress_vec(&input[consumed..], &mut self.output, FlushCompress::Sync)
                .map_err(deflate_error)?;

            // the flush is complete once zlib stops before filling the buffer
            let consumed = (self.compress.total_in() - start) as usize;
            if consumed == input.len() && self.output.len() < self.output.capacity() {
                break;
            }
        }

        if self.output.ends_with(&SYNC_TRAILER) {
            self.output.truncate(self.output.len() - SYNC_TRAILER.len());
        }

        Ok(BytesMut::from(&self.output[..]))
    }
}

/// Inflates the compressed messages received from the client.
///
/// Each call to [`Decompressor::decompress`] takes the concatenated payload of one message. On
/// error the inflater is reset, which leaves it usable for the close handshake.
pub struct Decompressor {
    decompress: flate2::Decompress,
    window_bits: u8,
    no_context_takeover: bool,
    max_output: usize,
    output: Vec<u8>,
}

impl Decompressor {
    /// Creates a raw deflate decompressor.
    ///
    /// An 8-bit window is inflated with a 9-bit one: zlib does not support 8 bits for raw
    /// streams, and a larger window reads any stream written with a smaller one.
    pub fn new(window_bits: u8, no_context_takeover: bool) -> Self {
        let window_bits = window_bits.clamp(MIN_WINDOW_BITS, MAX_WINDOW_BITS);
        Self {
            decompress: flate2::Decompress::new_with_window_bits(false, window_bits),
            window_bits,
            no_context_takeover,
            max_output: usize::MAX,
            output: Vec::with_capacity(CHUNK),
        }
    }

    /// Fails with [`WebSocketError::MessageTooLarge`] once a message inflates past `max_output`.
    pub fn with_max_output(mut self, max_output: usize) -> Self {
        self.max_output = max_output;
        self
    }

    /// Decompresses one complete message.
    pub fn decompress(&mut self, input: &[u8]) -> Result<BytesMut> {
        self.output.clear();

        let result = self
            .inflate(input)
            .and_then(|()| self.inflate(&SYNC_TRAILER));

        if self.no_context_takeover || result.is_err() {
            self.reset();
        }
        result?;

        Ok(BytesMut::from(&self.output[..]))
    }

    fn inflate(&mut self, input: &[u8]) -> Result<()> {
        let start = self.decompress.total_in();

        loop {
            reserve_chunk(&mut self.output);
            let before = (self.decompress.total_in(), self.decompress.total_out());
            let consumed = (before.0 - start) as usize;

            let status = self
                .decompress
                .decompress_vec(&input[consumed..], &mut self.output, FlushDecompress::Sync)
                .map_err(|err| WebSocketError::Decompression(inflate_error(err)))?;

            if self.output.len() > self.max_output {
                return Err(WebSocketError::MessageTooLarge);
            }

            if status == Status::StreamEnd {
                // the client ended the deflate stream, the next message starts a new one
                self.reset();
                return Ok(());
            }

            let consumed = (self.decompress.total_in() - start) as usize;
            let stalled = before == (self.decompress.total_in(), self.decompress.total_out());
            if stalled || (consumed == input.len() && self.output.len() < self.output.capacity())
            {
                return Ok(());
            }
        }
    }

    fn reset(&mut self) {
        self.decompress = flate2::Decompress::new_with_window_bits(false, self.window_bits);
    }
}

fn reserve_chunk(output: &mut Vec<u8>) {
    if output.capacity() - output.len() < CHUNK {
        output.reserve(CHUNK);
    }
}

fn deflate_error(err: CompressError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("deflate: {err}"))
}

fn inflate_error(err: DecompressError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("inflate: {err}"))
}
