use std::time::Duration;

use bytes::Bytes;

use crate::{close::CloseCode, connection::Connection};

/// Application callbacks for the connections accepted on one path.
///
/// Callbacks run on the connection's task, in the order frames arrive. They should return
/// quickly; long work belongs on a separate task that keeps a clone of the [`Connection`].
pub trait WebSocketService: Send + Sync + 'static {
    /// A connection was upgraded. Called before its first frame is read.
    fn connected(&self, connection: &Connection);

    /// The connection is gone. Called exactly once per connection, whatever ended it.
    ///
    /// `reason` is the code of the close handshake, or [`CloseCode::NoStatus`] when the
    /// connection was dropped without one (idle timeout, end of stream) and
    /// [`CloseCode::Abnormal`] when the transport failed or another callback panicked.
    fn disconnected(&self, connection: &Connection, reason: CloseCode);

    fn received_binary(&self, message: Bytes, from: &Connection);

    fn received_text(&self, message: String, from: &Connection);

    /// A pong arrived, either answering [`Connection::ping`] or unsolicited.
    fn received_pong(&self, _payload: Bytes, _from: &Connection) {}

    /// Idle timeout for this service's connections, or `None` to keep idle connections forever.
    ///
    /// A connection that receives nothing for half the timeout is sent a ping. If nothing
    /// arrives before the full timeout, it is dropped.
    fn connection_timeout(&self) -> Option<Duration> {
        None
    }
}
