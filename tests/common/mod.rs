#![allow(dead_code)]
//! Shared integration test utilities: an echoing service that records its callbacks and a
//! minimal client speaking raw frames over an in-memory duplex stream.
//!
//! ```ignore
//! mod common;
//! use common::*;
//! ```

use std::{
    sync::{Arc, Once},
    time::Duration,
};

use bytes::{Buf, Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::mpsc,
};
use tokio_util::codec::Encoder as _;
use wsengine::{
    codec::Encoder, CloseCode, CompressionLevel, Compressor, Connection, ConnectionHandle,
    ConnectionId, Decompressor, ExtensionParameters, Frame, Message, OpCode, Options, Registry,
    WebSocketService,
};

pub const PATH: &str = "/wstester";

static INIT_LOGGING: Once = Once::new();

/// Installs a logger once per test binary. `RUST_LOG` overrides the level.
pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = simple_logger::SimpleLogger::new()
            .with_level(log::LevelFilter::Warn)
            .env()
            .init();
    });
}

/// Callbacks observed by [`EchoService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected(ConnectionId),
    Text(String),
    Binary(Bytes),
    Pong(Bytes),
    Disconnected(ConnectionId, CloseCode),
}

/// Echoes every message back and reports each callback on a channel.
pub struct EchoService {
    events: mpsc::UnboundedSender<Event>,
    timeout: Option<Duration>,
}

impl EchoService {
    pub fn new(timeout: Option<Duration>) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { events, timeout }), rx)
    }
}

impl WebSocketService for EchoService {
    fn connected(&self, connection: &Connection) {
        let _ = self.events.send(Event::Connected(connection.id()));
    }

    fn disconnected(&self, connection: &Connection, reason: CloseCode) {
        let _ = self.events.send(Event::Disconnected(connection.id(), reason));
    }

    fn received_binary(&self, message: Bytes, from: &Connection) {
        let _ = self.events.send(Event::Binary(message.clone()));
        let _ = from.send_binary(message);
    }

    fn received_text(&self, message: String, from: &Connection) {
        let _ = self.events.send(Event::Text(message.clone()));
        let _ = from.send_text(message);
    }

    fn received_pong(&self, payload: Bytes, _from: &Connection) {
        let _ = self.events.send(Event::Pong(payload));
    }

    fn connection_timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Registry with an [`EchoService`] on [`PATH`].
pub fn echo_registry(
    timeout: Option<Duration>,
) -> (Arc<Registry>, mpsc::UnboundedReceiver<Event>) {
    init_logging();
    let registry = Arc::new(Registry::new());
    let (service, events) = EchoService::new(timeout);
    registry.register(service, PATH);
    (registry, events)
}

/// Upgrades a connection on `path` and returns the client end with the server's handle.
pub fn connect(
    registry: &Arc<Registry>,
    path: &str,
    extensions: Option<&str>,
) -> (TestClient, ConnectionHandle) {
    connect_with(registry, path, extensions, Options::default())
}

pub fn connect_with(
    registry: &Arc<Registry>,
    path: &str,
    extensions: Option<&str>,
    options: Options,
) -> (TestClient, ConnectionHandle) {
    let upgrade = registry
        .upgrade(path, extensions, options)
        .expect("service should be registered");
    let parameters = upgrade.parameters().copied();

    let (client, server) = tokio::io::duplex(1 << 20);
    let handle = upgrade.serve(server);
    (TestClient::new(client, parameters), handle)
}

/// Waits for the next callback, failing the test after 10 (possibly virtual) seconds.
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timed out waiting for a service event")
        .expect("service dropped")
}

/// Text made of a repeated sentence, `len` bytes long.
pub fn payload(len: usize) -> String {
    "Testing, testing 1,2,3. "
        .chars()
        .cycle()
        .take(len)
        .collect()
}

/// Client end of a connection. Frames it sends are masked with a random key; frames it receives
/// are parsed without any validation.
pub struct TestClient {
    io: DuplexStream,
    read: BytesMut,
    deflate: Option<Compressor>,
    inflate: Option<Decompressor>,
}

impl TestClient {
    fn new(io: DuplexStream, parameters: Option<ExtensionParameters>) -> Self {
        let (deflate, inflate) = match parameters {
            Some(p) => (
                Some(Compressor::new(
                    CompressionLevel::default(),
                    p.inflater_window_bits,
                    p.client_no_context_takeover,
                )),
                Some(Decompressor::new(
                    p.deflater_window_bits,
                    p.server_no_context_takeover,
                )),
            ),
            None => (None, None),
        };

        Self {
            io,
            read: BytesMut::with_capacity(8192),
            deflate,
            inflate,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.deflate.is_some()
    }

    /// Masks and sends one frame.
    pub async fn send(&mut self, frame: Frame) -> std::io::Result<()> {
        self.send_all(vec![frame]).await
    }

    /// Masks and sends frames with a single write.
    pub async fn send_all(&mut self, frames: Vec<Frame>) -> std::io::Result<()> {
        let frames = frames
            .into_iter()
            .map(|frame| frame.with_mask(rand::random()))
            .collect();
        self.send_unmasked(frames).await
    }

    /// Sends frames exactly as given.
    pub async fn send_unmasked(&mut self, frames: Vec<Frame>) -> std::io::Result<()> {
        let mut buf = BytesMut::new();
        for frame in frames {
            Encoder.encode(frame, &mut buf).expect("frames always encode");
        }
        self.send_raw(&buf).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.io.write_all(bytes).await?;
        self.io.flush().await
    }

    /// Builds a single-frame message, compressed when permessage-deflate was negotiated.
    pub fn message(&mut self, opcode: OpCode, payload: &[u8]) -> Frame {
        match self.deflate.as_mut() {
            Some(deflate) => {
                Frame::new(true, opcode, deflate.compress(payload).unwrap()).compressed()
            }
            None => Frame::new(true, opcode, payload),
        }
    }

    /// Splits a message in two frames. When compressed, the whole message is compressed first
    /// and only the first frame carries RSV1.
    pub fn fragments(&mut self, opcode: OpCode, payload: &[u8]) -> (Frame, Frame) {
        let (data, compressed) = match self.deflate.as_mut() {
            Some(deflate) => (deflate.compress(payload).unwrap(), true),
            None => (BytesMut::from(payload), false),
        };

        let (head, tail) = data.split_at(data.len() / 2);
        let mut first = Frame::new(false, opcode, head);
        first.rsv1 = compressed;
        (first, Frame::continuation(true, tail))
    }

    pub async fn send_text(&mut self, text: &str) -> std::io::Result<()> {
        let frame = self.message(OpCode::Text, text.as_bytes());
        self.send(frame).await
    }

    /// Next frame from the server, `None` once the server closed the stream.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = parse_frame(&mut self.read) {
                return Some(frame);
            }
            match self.io.read_buf(&mut self.read).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Next data message from the server, inflated when needed.
    pub async fn recv_message(&mut self) -> Message {
        let frame = self.recv().await.expect("connection closed");
        assert!(frame.fin, "the server does not fragment messages");

        let payload = if frame.rsv1 {
            self.inflate
                .as_mut()
                .expect("compressed frame without permessage-deflate")
                .decompress(&frame.payload)
                .expect("server sent an invalid deflate stream")
        } else {
            frame.payload
        };

        match frame.opcode {
            OpCode::Text => Message::Text(String::from_utf8(payload.to_vec()).unwrap()),
            OpCode::Binary => Message::Binary(payload.freeze()),
            other => panic!("expected a data frame, got {other:?}"),
        }
    }

    /// Expects a close frame and returns its raw payload.
    pub async fn expect_close(&mut self) -> BytesMut {
        let frame = self.recv().await.expect("connection closed without close frame");
        assert_eq!(frame.opcode, OpCode::Close, "unexpected frame {frame:?}");
        frame.payload
    }

    /// Expects a close frame with `code` and `reason`, then the end of the stream.
    pub async fn expect_close_with(&mut self, code: CloseCode, reason: &str) {
        let payload = self.expect_close().await;
        assert_eq!(close_payload(code, reason), payload);
        self.expect_eof().await;
    }

    pub async fn expect_eof(&mut self) {
        if let Some(frame) = self.recv().await {
            panic!("expected end of stream, got {frame:?}");
        }
    }
}

pub fn close_payload(code: CloseCode, reason: &str) -> BytesMut {
    let mut payload = BytesMut::new();
    payload.extend_from_slice(&code.code().to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}

fn parse_frame(buf: &mut BytesMut) -> Option<Frame> {
    if buf.len() < 2 {
        return None;
    }

    let (first, second) = (buf[0], buf[1]);
    assert_eq!(second & 0x80, 0, "server frames must not be masked");

    let (len, offset) = match second & 0x7F {
        126 if buf.len() >= 4 => (usize::from(u16::from_be_bytes([buf[2], buf[3]])), 4),
        127 if buf.len() >= 10 => {
            let len = u64::from_be_bytes(buf[2..10].try_into().unwrap());
            (len as usize, 10)
        }
        126 | 127 => return None,
        len => (usize::from(len), 2),
    };
    if buf.len() < offset + len {
        return None;
    }

    buf.advance(offset);
    Some(Frame {
        fin: first & 0x80 != 0,
        rsv1: first & 0x40 != 0,
        rsv2: first & 0x20 != 0,
        rsv3: first & 0x10 != 0,
        opcode: OpCode::from(first),
        mask: None,
        payload: buf.split_to(len),
    })
}
