//! Peers and their per-connection bookkeeping.

use crate::connection::Connection;
use crate::object::SyncObject;
use entanglement_protocol::DestHash;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Where a destination can be dialed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP host and port.
    Tcp {
        /// Host name or address.
        host: String,
        /// Port.
        port: u16,
    },
    /// Unix domain socket path.
    Unix(PathBuf),
    /// Name of a listener on an in-process [`MemoryNetwork`](crate::MemoryNetwork).
    Memory(String),
}

type SendFilter = Arc<dyn Fn(&SyncObject) -> bool + Send + Sync>;

/// A peer identity and how to reach it.
#[derive(Clone)]
pub struct Destination {
    /// Peer identity.
    pub dest_hash: DestHash,
    /// Display name used in logs.
    pub name: String,
    /// Dial coordinates; without one the peer must connect to us.
    pub endpoint: Option<Endpoint>,
    /// Bandwidth cap overriding the manager default.
    pub bw_per_sec: Option<u64>,
    send_filter: Option<SendFilter>,
}

impl Destination {
    /// Creates a destination that can only be reached by incoming connections.
    pub fn new(dest_hash: DestHash, name: impl Into<String>) -> Self {
        Self {
            dest_hash,
            name: name.into(),
            endpoint: None,
            bw_per_sec: None,
            send_filter: None,
        }
    }

    /// Sets the dial coordinates.
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Caps outgoing bandwidth for this peer.
    pub fn with_bandwidth(mut self, chars_per_sec: u64) -> Self {
        self.bw_per_sec = Some(chars_per_sec);
        self
    }

    /// Restricts which objects are sent to this peer.
    pub fn with_send_filter(mut self, filter: impl Fn(&SyncObject) -> bool + Send + Sync + 'static) -> Self {
        self.send_filter = Some(Arc::new(filter));
        self
    }

    /// True if we may dial this destination.
    pub fn can_connect(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Applies the destination's own send filter.
    pub fn should_send(&self, obj: &SyncObject) -> bool {
        self.send_filter.as_ref().map_or(true, |filter| filter(obj))
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("dest_hash", &self.dest_hash)
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("bw_per_sec", &self.bw_per_sec)
            .field("send_filter", &self.send_filter.is_some())
            .finish()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Destination {}>", self.name)
    }
}

/// Runtime state the manager keeps per destination.
#[derive(Default)]
pub(crate) struct DestinationState {
    /// Active connection, once the transport is up.
    pub connection: Option<Arc<Connection>>,
    /// Outgoing connect loop, if running.
    pub connect_task: Option<JoinHandle<()>>,
    /// An outgoing dial is in progress.
    pub connecting: bool,
    /// Consecutive failed connection attempts.
    pub attempt: u32,
    /// Earliest time of the next dial.
    pub connect_at: Option<Instant>,
    /// Owner ids the peer announced in its last MyOwners.
    pub peer_owners: Vec<Uuid>,
    /// Owners the peer has sent an IHave for on this connection.
    pub received_i_have: HashSet<Uuid>,
    /// Owners whose YouHave is due to this peer.
    pub send_you_have: Vec<Uuid>,
    /// A YouHave batch is scheduled.
    pub you_have_task: bool,
    /// First owner we announced to the peer; unowned objects belong to it.
    pub first_local_owner: Option<Uuid>,
}

impl DestinationState {
    /// Forgets everything tied to the previous connection.
    pub fn reset_connection(&mut self) {
        self.connection = None;
        self.peer_owners.clear();
        self.received_i_have.clear();
        self.send_you_have.clear();
        self.you_have_task = false;
        self.first_local_owner = None;
    }

    /// Queues a YouHave for `owner`; returns true if a batch must be scheduled.
    pub fn queue_you_have(&mut self, owner: Uuid) -> bool {
        if !self.send_you_have.contains(&owner) {
            self.send_you_have.push(owner);
        }
        if self.you_have_task {
            false
        } else {
            self.you_have_task = true;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::PrimaryKey;
    use serde_json::Map;

    #[test]
    fn destination_builder() {
        let dest = Destination::new(DestHash::from_string("peer"), "peer")
            .with_endpoint(Endpoint::Tcp {
                host: "localhost".into(),
                port: 9120,
            })
            .with_bandwidth(5000);
        assert!(dest.can_connect());
        assert_eq!(dest.bw_per_sec, Some(5000));
        assert_eq!(dest.to_string(), "<Destination peer>");

        let passive = Destination::new(DestHash::from_string("client"), "client");
        assert!(!passive.can_connect());
    }

    #[test]
    fn send_filter_applies() {
        let dest = Destination::new(DestHash::from_string("peer"), "peer")
            .with_send_filter(|obj| obj.sync_type() != "Secret");
        let public = SyncObject::new("Widget", PrimaryKey::unique(), Map::new());
        let secret = SyncObject::new("Secret", PrimaryKey::unique(), Map::new());
        assert!(dest.should_send(&public));
        assert!(!dest.should_send(&secret));
    }

    #[test]
    fn you_have_batches_coalesce() {
        let mut state = DestinationState::default();
        let owner = Uuid::new_v4();
        assert!(state.queue_you_have(owner));
        assert!(!state.queue_you_have(owner));
        assert!(!state.queue_you_have(Uuid::new_v4()));
        assert_eq!(state.send_you_have.len(), 2);

        state.reset_connection();
        assert!(state.send_you_have.is_empty());
        assert!(!state.you_have_task);
    }
}
