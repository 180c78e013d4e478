//! Services by path and the connections they currently serve.
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    connection::{self, Connection, ConnectionHandle, ConnectionId, Session},
    extensions::{self, ExtensionParameters},
    service::WebSocketService,
    Options, Result, WebSocketError,
};

/// Maps request paths to services and tracks live connections.
///
/// A registry is created once by the server and shared through an `Arc`. All mutations go
/// through one lock and are idempotent, so connections opening and closing concurrently on
/// different tasks cannot corrupt it.
///
/// Paths are normalized before use: `wstester`, `/wstester` and `/wstester?id=1` are the same
/// path.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    services: HashMap<String, Arc<dyn WebSocketService>>,
    connections: HashMap<ConnectionId, Connection>,
    paths: HashMap<String, HashSet<ConnectionId>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `service` on `path`, replacing any service registered there before.
    ///
    /// Connections already served by a replaced service keep using it.
    pub fn register(&self, service: Arc<dyn WebSocketService>, path: &str) {
        let path = normalize_path(path);
        log::debug!("registering WebSocket service on {path}");
        self.inner.write().services.insert(path, service);
    }

    /// Removes the service on `path`. Live connections are not affected, new upgrades fail.
    ///
    /// Returns whether a service was registered.
    pub fn unregister(&self, path: &str) -> bool {
        let path = normalize_path(path);
        let removed = self.inner.write().services.remove(&path).is_some();
        if removed {
            log::debug!("unregistered WebSocket service on {path}");
        }
        removed
    }

    pub fn lookup(&self, path: &str) -> Option<Arc<dyn WebSocketService>> {
        self.inner.read().services.get(&normalize_path(path)).cloned()
    }

    /// Live connections upgraded on `path`.
    pub fn connections(&self, path: &str) -> Vec<Connection> {
        let inner = self.inner.read();
        inner
            .paths
            .get(&normalize_path(path))
            .into_iter()
            .flatten()
            .filter_map(|id| inner.connections.get(id).cloned())
            .collect()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.inner.read().connections.get(&id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.read().connections.len()
    }

    /// Prepares the upgrade of a request for `path`.
    ///
    /// `extensions` is the `Sec-WebSocket-Extensions` request header, if any. Fails with
    /// [`WebSocketError::ServiceNotFound`] when no service is registered on `path`; the HTTP
    /// layer should then reject the handshake with `400 Bad Request`.
    pub fn upgrade(
        self: &Arc<Self>,
        path: &str,
        extensions: Option<&str>,
        options: Options,
    ) -> Result<Upgrade> {
        let path = normalize_path(path);
        let Some(service) = self.lookup(&path) else {
            log::debug!("upgrade refused, no service on {path}");
            return Err(WebSocketError::ServiceNotFound(path));
        };

        let negotiated = if options.compression.is_some() {
            extensions::negotiate(extensions)
        } else {
            None
        };

        Ok(Upgrade {
            registry: Arc::clone(self),
            path,
            service,
            negotiated,
            options,
        })
    }

    fn track(&self, connection: &Connection) {
        let mut inner = self.inner.write();
        inner.connections.insert(connection.id(), connection.clone());
        inner
            .paths
            .entry(connection.path().to_string())
            .or_default()
            .insert(connection.id());
    }

    fn forget(&self, connection: &Connection) {
        let mut inner = self.inner.write();
        inner.connections.remove(&connection.id());

        let path = connection.path();
        if let Some(ids) = inner.paths.get_mut(path) {
            ids.remove(&connection.id());
            if ids.is_empty() {
                inner.paths.remove(path);
            }
        }
    }
}

/// An accepted upgrade, waiting for the upgraded transport.
pub struct Upgrade {
    registry: Arc<Registry>,
    path: String,
    service: Arc<dyn WebSocketService>,
    negotiated: Option<(ExtensionParameters, String)>,
    options: Options,
}

impl Upgrade {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Value for the `Sec-WebSocket-Extensions` response header, `None` to omit the header.
    pub fn response_header(&self) -> Option<&str> {
        self.negotiated.as_ref().map(|(_, header)| header.as_str())
    }

    pub fn parameters(&self) -> Option<&ExtensionParameters> {
        self.negotiated.as_ref().map(|(params, _)| params)
    }

    /// Starts serving the upgraded transport on a new task.
    ///
    /// The connection is tracked by the registry until its task finishes. The returned handle
    /// resolves with the reason passed to [`WebSocketService::disconnected`].
    pub fn serve<S>(self, io: S) -> ConnectionHandle
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session = Session::new(
            io,
            ConnectionId::next(),
            self.path,
            self.service,
            self.negotiated.map(|(params, _)| params),
            &self.options,
        );

        let registry = self.registry;
        registry.track(session.connection());
        connection::spawn(session, move |connection| registry.forget(connection))
    }
}

/// Normalizes a request path: the query string is dropped and a leading `/` is added.
pub fn normalize_path(path: &str) -> String {
    let path = path.split_once('?').map_or(path, |(path, _)| path);
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}
