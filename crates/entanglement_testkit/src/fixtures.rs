//! Test fixtures for in-memory meshes.
//!
//! A [`Mesh`] owns a `MemoryNetwork` and a set of named sync managers,
//! each listening on the network under its own name. Identities are
//! derived from the names, so tests can refer to nodes by string.

use crate::types::sample_registry;
use crate::wait::{wait_until, DEFAULT_WAIT};
use entanglement_engine::{
    BackoffConfig, ConnectionState, Destination, Endpoint, ManagerConfig, MemoryNetwork, SyncManager,
};
use entanglement_protocol::DestHash;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Configuration with timings short enough for tests.
pub fn fast_config() -> ManagerConfig {
    ManagerConfig::new()
        .with_you_have_timeout(Duration::from_millis(20))
        .with_backoff(BackoffConfig::new(Duration::from_millis(10), Duration::from_millis(100)))
        .with_collision_delay(Duration::from_millis(10))
}

/// Identity of the node called `name`.
pub fn node_hash(name: &str) -> DestHash {
    DestHash::from_string(name)
}

struct Node {
    manager: SyncManager,
    listener: JoinHandle<()>,
}

/// A set of named sync managers on one in-memory network.
///
/// Must be created inside a Tokio runtime. Dropping the mesh closes
/// every manager.
pub struct Mesh {
    network: MemoryNetwork,
    config: ManagerConfig,
    nodes: BTreeMap<String, Node>,
}

impl Mesh {
    /// Creates an empty mesh using [`fast_config`].
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    /// Creates an empty mesh whose nodes use `config`.
    pub fn with_config(config: ManagerConfig) -> Self {
        Self {
            network: MemoryNetwork::new(),
            config,
            nodes: BTreeMap::new(),
        }
    }

    /// The underlying network.
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    /// Adds a node with the sample registry and starts its listener.
    pub fn add_node(&mut self, name: &str) -> SyncManager {
        let hash = node_hash(name);
        let manager = SyncManager::builder(hash)
            .registry(sample_registry())
            .config(self.config.clone())
            .connector(self.network.connector(hash))
            .build();
        let listener = manager.serve(self.network.listen(name, hash));
        self.nodes.insert(
            name.to_string(),
            Node {
                manager: manager.clone(),
                listener,
            },
        );
        manager
    }

    /// The node called `name`.
    ///
    /// # Panics
    ///
    /// Panics if no such node was added.
    pub fn node(&self, name: &str) -> SyncManager {
        self.nodes
            .get(name)
            .map(|node| node.manager.clone())
            .unwrap_or_else(|| panic!("no node named {name}"))
    }

    /// Makes `client` dial `server`; the server accepts it as a passive destination.
    pub fn link(&self, client: &str, server: &str) {
        self.node(server)
            .add_destination(Destination::new(node_hash(client), client))
            .expect("Failed to add passive destination");
        self.node(client)
            .add_destination(
                Destination::new(node_hash(server), server).with_endpoint(Endpoint::Memory(server.to_string())),
            )
            .expect("Failed to add dialing destination");
    }

    /// Removes the destinations `a` and `b` hold for each other.
    pub fn unlink(&self, a: &str, b: &str) {
        self.node(a).remove_destination(&node_hash(b));
        self.node(b).remove_destination(&node_hash(a));
    }

    /// Stops accepting connections on `name`'s listener.
    pub fn stop_listening(&self, name: &str) {
        self.network.unbind(name);
    }

    /// Rebinds `name`'s listener after [`Mesh::stop_listening`].
    pub fn resume_listening(&mut self, name: &str) {
        let hash = node_hash(name);
        let Some(node) = self.nodes.get_mut(name) else {
            panic!("no node named {name}");
        };
        node.listener.abort();
        node.listener = node.manager.serve(self.network.listen(name, hash));
    }

    /// True once `a` has finished the handshake with `b`.
    pub fn is_connected(&self, a: &str, b: &str) -> bool {
        matches!(
            self.node(a).connection_state(&node_hash(b)),
            Some(ConnectionState::Active | ConnectionState::Draining)
        )
    }

    /// Waits until both ends of the `a`-`b` link are active.
    pub async fn wait_linked(&self, a: &str, b: &str) -> bool {
        wait_until(DEFAULT_WAIT, || self.is_connected(a, b) && self.is_connected(b, a)).await
    }

    /// Links `client` to `server` and waits for the handshake.
    pub async fn link_and_wait(&self, client: &str, server: &str) {
        self.link(client, server);
        assert!(
            self.wait_linked(client, server).await,
            "{client} and {server} did not connect"
        );
    }
}

impl Default for Mesh {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Mesh {
    fn drop(&mut self) {
        for node in self.nodes.values() {
            node.listener.abort();
            node.manager.close();
        }
    }
}
