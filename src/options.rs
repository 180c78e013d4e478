use std::time::Duration;

/// Compression level used by the permessage-deflate compressor.
pub type CompressionLevel = flate2::Compression;

/// Default limit for the payload of a single frame: 1 MiB.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// Default limit for a reassembled (and inflated) message: 2 MiB.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// Default time to wait for the peer's close frame after the application closed a connection.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-connection settings, passed to [`Registry::upgrade`](crate::Registry::upgrade).
///
/// Unset limits fall back to the defaults in this module.
#[derive(Clone, Debug)]
pub struct Options {
    /// Largest payload accepted in a single frame. Bigger frames close the connection with
    /// [`CloseCode::Size`](crate::CloseCode::Size).
    ///
    /// Default: [`MAX_PAYLOAD_READ`]
    pub max_payload_read: Option<usize>,

    /// Largest message accepted after reassembly and decompression.
    ///
    /// Default: [`MAX_MESSAGE_SIZE`]
    pub max_message_size: Option<usize>,

    /// Compression level for permessage-deflate, or `None` to decline compression even when the
    /// client offers it.
    ///
    /// Default: `Some(CompressionLevel::default())`
    pub compression: Option<CompressionLevel>,

    /// How long an application-initiated close waits for the client's close frame.
    ///
    /// Default: [`CLOSE_TIMEOUT`]
    pub close_timeout: Option<Duration>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_payload_read: None,
            max_message_size: None,
            compression: Some(CompressionLevel::default()),
            close_timeout: None,
        }
    }
}

impl Options {
    pub fn with_compression_level(self, level: CompressionLevel) -> Self {
        Self {
            compression: Some(level),
            ..self
        }
    }

    /// Declines permessage-deflate for every connection using these options.
    pub fn without_compression(self) -> Self {
        Self {
            compression: None,
            ..self
        }
    }

    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: Some(size),
            ..self
        }
    }

    pub fn with_max_message_size(self, size: usize) -> Self {
        Self {
            max_message_size: Some(size),
            ..self
        }
    }

    pub fn with_close_timeout(self, timeout: Duration) -> Self {
        Self {
            close_timeout: Some(timeout),
            ..self
        }
    }

    pub(crate) fn payload_limit(&self) -> usize {
        self.max_payload_read.unwrap_or(MAX_PAYLOAD_READ)
    }

    pub(crate) fn message_limit(&self) -> usize {
        self.max_message_size.unwrap_or(MAX_MESSAGE_SIZE)
    }

    pub(crate) fn close_wait(&self) -> Duration {
        self.close_timeout.unwrap_or(CLOSE_TIMEOUT)
    }
}
