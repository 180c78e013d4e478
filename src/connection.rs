//! Connection handles and the per-connection task.
//!
//! Every upgraded connection is driven by one [`Session`], spawned on the runtime by
//! [`Upgrade::serve`](crate::Upgrade::serve). The session owns the framed transport, the
//! reassembler, both compression contexts and the timers, so no state is shared between
//! connections. It multiplexes three event sources with `tokio::select!`:
//!
//! - frames read from the client,
//! - commands queued through [`Connection`] handles,
//! - the idle/close timer.
//!
//! Exactly one event is handled at a time, so a frame and a timeout can never both be
//! processed: whichever the select picks first decides.
use std::{
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tokio_util::codec::Framed;

use crate::{
    close::CloseCode,
    codec::{Codec, Decoder, Encoder},
    compression::{Compressor, Decompressor},
    extensions::ExtensionParameters,
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD},
    reassembly::{Message, Reassembler},
    service::WebSocketService,
    validate::Validator,
    Options, Result, WebSocketError,
};

/// Process-wide unique identifier of a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Requests from [`Connection`] handles to the session.
enum Command {
    Send(Message),
    Ping(Bytes),
    Close(CloseCode, String),
}

/// Handle to a live connection.
///
/// Handles are cheap to clone and can be used from any task. Sending only queues the message;
/// the connection's task compresses and writes it in order.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Shared>,
}

struct Shared {
    id: ConnectionId,
    path: String,
    commands: mpsc::UnboundedSender<Command>,
    open: AtomicBool,
}

impl Connection {
    fn new(id: ConnectionId, path: String) -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let connection = Self {
            inner: Arc::new(Shared {
                id,
                path,
                commands,
                open: AtomicBool::new(true),
            }),
        };
        (connection, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Normalized path of the service this connection was upgraded for.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// `false` once a close handshake started or the connection was dropped.
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send_message(Message::Text(text.into()))
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send_message(Message::Binary(data.into()))
    }

    /// Queues a message. Fails with [`WebSocketError::ConnectionClosed`] once the connection is
    /// closing.
    pub fn send_message(&self, message: Message) -> Result<()> {
        self.command(Command::Send(message))
    }

    /// Sends a ping. The answer is delivered to
    /// [`WebSocketService::received_pong`].
    pub fn ping(&self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge);
        }
        self.command(Command::Ping(payload))
    }

    /// Starts the close handshake.
    ///
    /// `code` must be legal on the wire (see [`CloseCode::is_sendable`]) and the reason must
    /// fit in a control frame. Messages queued before the call are still sent.
    pub fn close(&self, code: CloseCode, reason: impl Into<String>) -> Result<()> {
        if !code.is_sendable() {
            return Err(WebSocketError::InvalidCloseCode(code.into()));
        }
        let reason = reason.into();
        if reason.len() + 2 > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge);
        }

        if !self.inner.open.swap(false, Ordering::AcqRel) {
            return Err(WebSocketError::ConnectionClosed);
        }
        self.inner
            .commands
            .send(Command::Close(code, reason))
            .map_err(|_| WebSocketError::ConnectionClosed)
    }

    fn command(&self, command: Command) -> Result<()> {
        if !self.is_open() {
            return Err(WebSocketError::ConnectionClosed);
        }
        self.inner
            .commands
            .send(command)
            .map_err(|_| WebSocketError::ConnectionClosed)
    }

    fn mark_closed(&self) {
        self.inner.open.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("path", &self.inner.path)
            .field("open", &self.is_open())
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

/// Resolves with the disconnect reason once the connection's task has finished.
///
/// Resolves to `None` if [`WebSocketService::disconnected`] panicked or the runtime shut down.
/// A panic in any other callback drops the connection with [`CloseCode::Abnormal`].
pub struct ConnectionHandle {
    connection: Connection,
    task: JoinHandle<CloseCode>,
}

impl ConnectionHandle {
    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl Future for ConnectionHandle {
    type Output = Option<CloseCode>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task).poll(cx).map(|result| result.ok())
    }
}

/// How the session ended.
struct End {
    reason: CloseCode,
    /// Whether the transport is still usable for flushing and shutting down.
    graceful: bool,
}

impl End {
    fn graceful(reason: CloseCode) -> Self {
        Self {
            reason,
            graceful: true,
        }
    }

    fn abrupt(reason: CloseCode) -> Self {
        Self {
            reason,
            graceful: false,
        }
    }
}

enum Flow {
    Continue,
    Stop(End),
}

/// State of one connection, owned by its task.
pub(crate) struct Session<S> {
    framed: Framed<S, Codec>,
    connection: Connection,
    commands: mpsc::UnboundedReceiver<Command>,
    service: Arc<dyn WebSocketService>,
    reassembler: Reassembler,
    deflate: Option<Compressor>,
    timeout: Option<Duration>,
    close_wait: Duration,
    last_activity: Instant,
    ping_sent: bool,
    /// Code of the close frame we sent, if any.
    close_sent: Option<CloseCode>,
    /// Set when the application started the handshake and we wait for the client's answer.
    close_deadline: Option<Instant>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(
        io: S,
        id: ConnectionId,
        path: String,
        service: Arc<dyn WebSocketService>,
        parameters: Option<ExtensionParameters>,
        options: &Options,
    ) -> Self {
        let (connection, commands) = Connection::new(id, path);

        let (deflate, inflate) = match options.compression.zip(parameters) {
            Some((level, params)) => (
                Some(Compressor::new(
                    level,
                    params.deflater_window_bits,
                    params.server_no_context_takeover,
                )),
                Some(
                    Decompressor::new(
                        params.inflater_window_bits,
                        params.client_no_context_takeover,
                    )
                    .with_max_output(options.message_limit()),
                ),
            ),
            None => (None, None),
        };

        let decoder = Decoder::new(Validator::new(inflate.is_some()), options.payload_limit());
        let timeout = service.connection_timeout();

        Self {
            framed: Framed::new(io, Codec::from((decoder, Encoder))),
            connection,
            commands,
            service,
            reassembler: Reassembler::new(inflate, options.message_limit()),
            deflate,
            timeout,
            close_wait: options.close_wait(),
            last_activity: Instant::now(),
            ping_sent: false,
            close_sent: None,
            close_deadline: None,
        }
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Runs the connection to completion and returns the reason reported to the service.
    pub(crate) async fn run(mut self) -> CloseCode {
        let id = self.connection.id();
        log::debug!("connection {id} opened on {}", self.connection.path());

        let served = AssertUnwindSafe(async {
            self.service.connected(&self.connection);
            self.drive().await
        })
        .catch_unwind()
        .await;

        // a panicking callback drops the connection but `disconnected` still runs
        let end = served.unwrap_or_else(|_| {
            log::error!("connection {id}: service callback panicked, dropping connection");
            End::abrupt(CloseCode::Abnormal)
        });
        self.connection.mark_closed();

        if end.graceful {
            if let Err(err) = self.framed.close().await {
                log::trace!("connection {id}: shutdown failed: {err}");
            }
        }

        log::debug!("connection {id} closed ({})", end.reason);
        self.service.disconnected(&self.connection, end.reason);
        end.reason
    }

    async fn drive(&mut self) -> End {
        let timer = sleep_until(self.deadline().unwrap_or_else(Instant::now));
        tokio::pin!(timer);

        loop {
            let deadline = self.deadline();
            if let Some(deadline) = deadline {
                if timer.deadline() != deadline {
                    timer.as_mut().reset(deadline);
                }
            }

            let flow = tokio::select! {
                frame = self.framed.next() => match frame {
                    Some(Ok(frame)) => {
                        self.last_activity = Instant::now();
                        self.ping_sent = false;
                        self.on_frame(frame).await
                    }
                    Some(Err(err)) => Flow::Stop(self.fail(err).await),
                    None => Flow::Stop(self.on_eof()),
                },
                Some(command) = self.commands.recv(), if self.close_sent.is_none() => {
                    self.on_command(command).await
                }
                () = &mut timer, if deadline.is_some() => self.on_timer().await,
            };

            if let Flow::Stop(end) = flow {
                return end;
            }
        }
    }

    /// When the timer should fire next: end of the close handshake, keepalive ping or timeout.
    fn deadline(&self) -> Option<Instant> {
        if let Some(deadline) = self.close_deadline {
            return Some(deadline);
        }

        let timeout = self.timeout?;
        if self.ping_sent {
            Some(self.last_activity + timeout)
        } else {
            Some(self.last_activity + timeout / 2)
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> Flow {
        match frame.opcode {
            OpCode::Ping => {
                if self.close_sent.is_some() {
                    return Flow::Continue;
                }
                self.write(Frame::pong(frame.payload)).await
            }
            OpCode::Pong => {
                self.service
                    .received_pong(frame.payload.freeze(), &self.connection);
                Flow::Continue
            }
            OpCode::Close => Flow::Stop(self.on_close(frame).await),
            // data sent after our close frame is discarded
            _ if self.close_sent.is_some() => Flow::Continue,
            _ => match self.reassembler.push(frame) {
                Ok(Some(Message::Text(text))) => {
                    self.service.received_text(text, &self.connection);
                    Flow::Continue
                }
                Ok(Some(Message::Binary(data))) => {
                    self.service.received_binary(data, &self.connection);
                    Flow::Continue
                }
                Ok(None) => Flow::Continue,
                Err(err) => Flow::Stop(self.fail(err).await),
            },
        }
    }

    async fn on_close(&mut self, frame: Frame) -> End {
        let id = self.connection.id();
        let code = frame.close_code().unwrap_or(CloseCode::NoStatus);

        if let Some(sent) = self.close_sent {
            log::debug!("connection {id}: close handshake completed ({code})");
            return End::graceful(sent);
        }

        log::debug!("connection {id}: client closed with {code}");
        self.connection.mark_closed();
        self.close_sent = Some(code);

        let echo = Frame::close_raw(&frame.payload);
        match self.framed.send(echo).await {
            Ok(()) => End::graceful(code),
            Err(err) => {
                log::debug!("connection {id}: failed to echo close: {err}");
                End::abrupt(code)
            }
        }
    }

    fn on_eof(&mut self) -> End {
        match self.close_sent {
            Some(code) => End::graceful(code),
            None => {
                log::debug!("connection {}: end of stream", self.connection.id());
                End::graceful(CloseCode::NoStatus)
            }
        }
    }

    /// Closes the connection after a protocol violation, a size limit or an I/O failure.
    async fn fail(&mut self, err: WebSocketError) -> End {
        let id = self.connection.id();
        self.connection.mark_closed();

        let Some(code) = err.close_code() else {
            log::debug!("connection {id} failed: {err}");
            return End::abrupt(CloseCode::Abnormal);
        };

        log::warn!("closing connection {id} with {code}: {err}");
        if self.close_sent.is_some() {
            return End::graceful(code);
        }
        self.close_sent = Some(code);

        match self.framed.send(Frame::close(code, err.close_reason())).await {
            Ok(()) => End::graceful(code),
            Err(_) => End::abrupt(code),
        }
    }

    async fn on_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Send(message) => match self.encode(message) {
                Ok(frame) => self.write(frame).await,
                Err(err) => Flow::Stop(self.fail(err).await),
            },
            Command::Ping(payload) => self.write(Frame::ping(&payload[..])).await,
            Command::Close(code, reason) => {
                log::debug!("connection {}: closing with {code}", self.connection.id());
                self.close_sent = Some(code);
                self.close_deadline = Some(Instant::now() + self.close_wait);
                self.write(Frame::close(code, reason)).await
            }
        }
    }

    async fn on_timer(&mut self) -> Flow {
        let id = self.connection.id();

        if self.close_deadline.is_some() {
            log::debug!("connection {id}: no close frame from client");
            let code = self.close_sent.unwrap_or(CloseCode::NoStatus);
            return Flow::Stop(End::graceful(code));
        }

        if !self.ping_sent {
            log::trace!("connection {id}: idle, sending keepalive ping");
            self.ping_sent = true;
            return self.write(Frame::ping(BytesMut::new())).await;
        }

        log::debug!("connection {id}: timed out after {:?}", self.timeout);
        Flow::Stop(End::abrupt(CloseCode::NoStatus))
    }

    /// Builds the frame for an outgoing message, compressed when permessage-deflate is active.
    fn encode(&mut self, message: Message) -> Result<Frame> {
        let (opcode, payload) = match &message {
            Message::Text(text) => (OpCode::Text, text.as_bytes()),
            Message::Binary(data) => (OpCode::Binary, &data[..]),
        };

        match self.deflate.as_mut() {
            Some(deflate) => Ok(Frame::new(true, opcode, deflate.compress(payload)?).compressed()),
            None => Ok(Frame::new(true, opcode, payload)),
        }
    }

    async fn write(&mut self, frame: Frame) -> Flow {
        match self.framed.send(frame).await {
            Ok(()) => Flow::Continue,
            Err(err) => {
                log::debug!("connection {}: write failed: {err}", self.connection.id());
                Flow::Stop(End::abrupt(CloseCode::Abnormal))
            }
        }
    }
}

/// Spawns the session on the current runtime.
pub(crate) fn spawn<S, F>(session: Session<S>, on_finish: F) -> ConnectionHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: FnOnce(&Connection) + Send + 'static,
{
    let connection = session.connection().clone();
    let finish = OnFinish {
        connection: connection.clone(),
        callback: Some(on_finish),
    };

    let task = tokio::spawn(async move {
        // dropped after `run`, or while unwinding if `disconnected` itself panics
        let _finish = finish;
        session.run().await
    });

    ConnectionHandle { connection, task }
}

/// Runs the finish callback when the connection's task ends, however it ends.
struct OnFinish<F: FnOnce(&Connection)> {
    connection: Connection,
    callback: Option<F>,
}

impl<F: FnOnce(&Connection)> Drop for OnFinish<F> {
    fn drop(&mut self) {
        self.connection.mark_closed();
        if let Some(callback) = self.callback.take() {
            callback(&self.connection);
        }
    }
}
