//! Transport seam.
//!
//! The engine needs a byte stream and the peer's identity. TLS and Unix
//! socket transports live outside this crate and plug in through
//! [`Connector`] and [`Listener`]. [`MemoryNetwork`] pairs in-process
//! duplex streams and is what the tests run on.

use crate::destination::{Destination, Endpoint};
use crate::error::{SyncError, SyncResult};
use entanglement_protocol::DestHash;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// Buffer size of each direction of an in-memory stream.
const MEMORY_STREAM_BUFFER: usize = 64 * 1024;

/// A duplex byte stream the engine can run a connection over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Boxed transport stream.
pub type BoxStream = Box<dyn AsyncStream>;

/// Boxed future returned by transport traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An established transport with the identity the transport vouches for.
pub struct Connected {
    /// The byte stream.
    pub stream: BoxStream,
    /// Peer identity, e.g. the hash of its certificate.
    pub peer: DestHash,
}

impl fmt::Debug for Connected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connected").field("peer", &self.peer).finish()
    }
}

/// Dials destinations.
pub trait Connector: Send + Sync {
    /// Opens a transport to the destination's endpoint.
    ///
    /// Failures marked retryable are retried with backoff.
    fn connect<'a>(&'a self, dest: &'a Destination) -> BoxFuture<'a, SyncResult<Connected>>;
}

/// Accepts incoming transports.
pub trait Listener: Send {
    /// Waits for the next incoming transport. `None` once the listener is closed.
    fn accept(&mut self) -> BoxFuture<'_, Option<Connected>>;
}

/// An in-process network of named listeners.
///
/// Identities are assigned by whoever creates the connector or listener,
/// standing in for certificate hashes.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<String, (DestHash, mpsc::UnboundedSender<Connected>)>>>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a listener under `name` for the endpoint with `identity`.
    ///
    /// Rebinding a name replaces the previous listener.
    pub fn listen(&self, name: impl Into<String>, identity: DestHash) -> MemoryListener {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().insert(name.into(), (identity, tx));
        MemoryListener { rx }
    }

    /// Removes a listener; later dials to it fail.
    pub fn unbind(&self, name: &str) {
        self.listeners.lock().remove(name);
    }

    /// A connector dialing out as `identity`.
    pub fn connector(&self, identity: DestHash) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
            identity,
        }
    }

    fn dial(&self, name: &str, identity: DestHash) -> SyncResult<Connected> {
        let listeners = self.listeners.lock();
        let (peer, tx) = listeners
            .get(name)
            .ok_or_else(|| SyncError::transport_retryable(format!("no listener named {name}")))?;
        let (ours, theirs) = tokio::io::duplex(MEMORY_STREAM_BUFFER);
        tx.send(Connected {
            stream: Box::new(theirs),
            peer: identity,
        })
        .map_err(|_| SyncError::transport_retryable(format!("listener {name} is closed")))?;
        Ok(Connected {
            stream: Box::new(ours),
            peer: *peer,
        })
    }
}

impl fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.lock();
        let mut names: Vec<&String> = listeners.keys().collect();
        names.sort();
        f.debug_struct("MemoryNetwork").field("listeners", &names).finish()
    }
}

/// Dials [`Endpoint::Memory`] endpoints on a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    network: MemoryNetwork,
    identity: DestHash,
}

impl Connector for MemoryConnector {
    fn connect<'a>(&'a self, dest: &'a Destination) -> BoxFuture<'a, SyncResult<Connected>> {
        Box::pin(async move {
            match &dest.endpoint {
                Some(Endpoint::Memory(name)) => self.network.dial(name, self.identity),
                Some(other) => Err(SyncError::transport_fatal(format!(
                    "memory transport cannot reach {other:?}"
                ))),
                None => Err(SyncError::transport_fatal(format!("{dest} has no endpoint"))),
            }
        })
    }
}

/// Incoming side of a [`MemoryNetwork`] binding.
#[derive(Debug)]
pub struct MemoryListener {
    rx: mpsc::UnboundedReceiver<Connected>,
}

impl Listener for MemoryListener {
    fn accept(&mut self) -> BoxFuture<'_, Option<Connected>> {
        Box::pin(self.rx.recv())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn memory_dial_reports_identities() {
        let network = MemoryNetwork::new();
        let server = DestHash::from_string("server");
        let client = DestHash::from_string("client");
        let mut listener = network.listen("server", server);
        let connector = network.connector(client);

        let dest = Destination::new(server, "server").with_endpoint(Endpoint::Memory("server".into()));
        let mut outgoing = connector.connect(&dest).await.unwrap();
        let mut incoming = listener.accept().await.unwrap();
        assert_eq!(outgoing.peer, server);
        assert_eq!(incoming.peer, client);

        outgoing.stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        incoming.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn missing_listener_is_retryable() {
        let network = MemoryNetwork::new();
        let connector = network.connector(DestHash::from_string("client"));
        let dest = Destination::new(DestHash::from_string("server"), "server")
            .with_endpoint(Endpoint::Memory("nowhere".into()));
        let err = connector.connect(&dest).await.unwrap_err();
        assert!(err.is_retryable());

        let _listener = network.listen("nowhere", DestHash::from_string("server"));
        network.unbind("nowhere");
        assert!(connector.connect(&dest).await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn foreign_endpoint_is_fatal() {
        let network = MemoryNetwork::new();
        let connector = network.connector(DestHash::from_string("client"));
        let dest = Destination::new(DestHash::from_string("server"), "server").with_endpoint(Endpoint::Tcp {
            host: "localhost".into(),
            port: 9120,
        });
        let err = connector.connect(&dest).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
