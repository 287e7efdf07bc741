//! The sync manager.
//!
//! A [`SyncManager`] owns the object store, the owner table, the
//! transition table and one connection per connected destination. Local
//! changes enter through the typed API ([`SyncManager::commit`],
//! [`SyncManager::forward`], ...). Remote changes arrive on connections and
//! run through the receive pipeline. Both end in `synchronize`, which fans
//! an object out to the dirty queues of its destinations.
//!
//! ## Locking
//!
//! Store and owners, transitions, and peers each sit behind their own
//! mutex. No code path holds two of them at once, and none is held while a
//! connection is closed.
//!
//! Every method must be called from within a Tokio runtime.

use crate::catchup::{self, SYNC_OWNER};
use crate::config::{BandwidthConfig, ManagerConfig};
use crate::connection::{Connection, ConnectionState, ConnectionStats, MessageHandler};
use crate::destination::{Destination, DestinationState};
use crate::dirty::DirtyItem;
use crate::error::{SyncError, SyncResult};
use crate::object::{AttributeSet, OwnerRef, PrimaryKey, SyncObject, SERIAL_ATTRIBUTE, TRANSITION_ATTRIBUTE};
use crate::operations::{self, FloodAttributes, FloodStep, Operation, Targets};
use crate::owner::{OwnerRecord, OwnerTable};
use crate::registry::{ClassDescriptor, ClassKind, PrimaryKeys, Registry, Syncable};
use crate::response::{Completion, ResponseContext, ResponseFuture, ResponseOutcome};
use crate::store::ObjectStore;
use crate::transition::{BrokenRecord, LocalCommit, TransitionTable};
use crate::transport::{BoxStream, Connected, Connector, Listener};
use entanglement_protocol::{DestHash, SyncMessage};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Decides whether a peer we know nothing about may stay connected.
pub type UnknownDestinationHook = Arc<dyn Fn(DestHash) -> Option<Destination> + Send + Sync>;

/// Options of one [`SyncManager::synchronize`] call.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub(crate) destinations: Option<Vec<DestHash>>,
    pub(crate) exclude: Vec<DestHash>,
    pub(crate) operation: Operation,
    pub(crate) attributes: AttributeSet,
    pub(crate) response: bool,
    pub(crate) response_for: Option<ResponseContext>,
    pub(crate) priority: Option<i32>,
}

impl SyncOptions {
    /// Sends with `operation` to every connected destination.
    pub fn new(operation: Operation) -> Self {
        Self {
            destinations: None,
            exclude: Vec::new(),
            operation,
            attributes: AttributeSet::All,
            response: false,
            response_for: None,
            priority: None,
        }
    }

    /// Sends only to these destinations; each must be connected.
    pub fn to(mut self, destinations: Vec<DestHash>) -> Self {
        self.destinations = Some(destinations);
        self
    }

    /// Skips these destinations.
    pub fn excluding(mut self, destinations: Vec<DestHash>) -> Self {
        self.exclude.extend(destinations);
        self
    }

    /// Restricts the attributes sent.
    pub fn attributes(mut self, attributes: AttributeSet) -> Self {
        self.attributes = attributes;
        self
    }

    /// Returns a future resolving with the response.
    pub fn with_response(mut self) -> Self {
        self.response = true;
        self
    }

    /// Sends as part of an existing response context.
    pub fn response_for(mut self, ctx: Option<ResponseContext>) -> Self {
        self.response_for = ctx;
        self
    }

    /// Overrides the class priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

pub(crate) struct State {
    pub store: ObjectStore,
    pub owners: OwnerTable,
}

pub(crate) struct Peer {
    pub destination: Destination,
    pub state: DestinationState,
}

impl Peer {
    fn new(destination: Destination) -> Self {
        Self {
            destination,
            state: DestinationState::default(),
        }
    }

    /// The connection, unless it has closed.
    pub fn live_connection(&self) -> Option<Arc<Connection>> {
        self.state.connection.clone().filter(|conn| !conn.is_closed())
    }

    pub fn is_current(&self, conn: &Arc<Connection>) -> bool {
        self.state
            .connection
            .as_ref()
            .map_or(false, |current| Arc::ptr_eq(current, conn))
    }
}

pub(crate) struct ManagerInner {
    pub dest_hash: DestHash,
    pub config: ManagerConfig,
    meta: Registry,
    errors: Registry,
    registries: Vec<Registry>,
    pub state: Mutex<State>,
    pub transitions: Mutex<TransitionTable>,
    pub peers: Mutex<HashMap<DestHash, Peer>>,
    connector: Option<Arc<dyn Connector>>,
    unknown_destination: Option<UnknownDestinationHook>,
    next_connection_id: AtomicU64,
    shutdown: watch::Sender<bool>,
    pub me: Weak<ManagerInner>,
}

/// Builds a [`SyncManager`].
pub struct SyncManagerBuilder {
    dest_hash: DestHash,
    config: ManagerConfig,
    registries: Vec<Registry>,
    connector: Option<Arc<dyn Connector>>,
    unknown_destination: Option<UnknownDestinationHook>,
}

impl SyncManagerBuilder {
    /// Starts a manager whose own identity is `dest_hash`.
    pub fn new(dest_hash: DestHash) -> Self {
        Self {
            dest_hash,
            config: ManagerConfig::default(),
            registries: Vec::new(),
            connector: None,
            unknown_destination: None,
        }
    }

    /// Adds an application registry. Earlier registries win name clashes.
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registries.push(registry);
        self
    }

    /// Replaces the configuration.
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the transport used to dial destinations with an endpoint.
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Decides what to do with incoming peers that are not destinations.
    ///
    /// Without a hook they are disconnected.
    pub fn unknown_destination(
        mut self,
        hook: impl Fn(DestHash) -> Option<Destination> + Send + Sync + 'static,
    ) -> Self {
        self.unknown_destination = Some(Arc::new(hook));
        self
    }

    /// Creates the manager.
    pub fn build(self) -> SyncManager {
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new_cyclic(|me| ManagerInner {
            dest_hash: self.dest_hash,
            config: self.config,
            meta: catchup::meta_registry(),
            errors: catchup::error_registry(),
            registries: self.registries,
            state: Mutex::new(State {
                store: ObjectStore::new(),
                owners: OwnerTable::new(),
            }),
            transitions: Mutex::new(TransitionTable::new()),
            peers: Mutex::new(HashMap::new()),
            connector: self.connector,
            unknown_destination: self.unknown_destination,
            next_connection_id: AtomicU64::new(1),
            shutdown,
            me: me.clone(),
        });
        SyncManager { inner }
    }
}

/// An endpoint of the mesh.
///
/// Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncManager")
            .field("dest_hash", &self.inner.dest_hash)
            .field("registries", &self.inner.registries)
            .finish()
    }
}

/// Serializes an application value into its attribute map.
fn value_attributes<T: Syncable>(value: &T) -> SyncResult<Map<String, Value>> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(SyncError::BadEncoding(format!(
            "{} must serialize to an object, not {other}",
            T::SYNC_TYPE
        ))),
        Err(e) => Err(SyncError::BadEncoding(format!("{}: {e}", T::SYNC_TYPE))),
    }
}

/// Primary key of an object with the given attributes.
pub(crate) fn object_key(class: &ClassDescriptor, attributes: &Map<String, Value>) -> SyncResult<PrimaryKey> {
    match class.primary_keys() {
        PrimaryKeys::Fields(fields) => PrimaryKey::from_attributes(fields, attributes),
        PrimaryKeys::Unique => Ok(PrimaryKey::unique()),
    }
}

/// The primary key attributes, optionally with `sync_serial`.
pub(crate) fn key_attributes(class: &ClassDescriptor, with_serial: bool) -> AttributeSet {
    let mut names: BTreeSet<String> = class
        .primary_keys()
        .fields()
        .iter()
        .map(|field| field.to_string())
        .collect();
    if with_serial {
        names.insert(SERIAL_ATTRIBUTE.to_string());
    }
    AttributeSet::Only(names)
}

impl SyncManager {
    /// Starts building a manager.
    pub fn builder(dest_hash: DestHash) -> SyncManagerBuilder {
        SyncManagerBuilder::new(dest_hash)
    }

    /// This endpoint's identity.
    pub fn dest_hash(&self) -> DestHash {
        self.inner.dest_hash
    }

    /// The configuration in use.
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    // ---- destinations and connections ----

    /// Adds a destination and starts dialing it if it has an endpoint.
    ///
    /// Adding a known destination replaces its settings.
    pub fn add_destination(&self, destination: Destination) -> SyncResult<()> {
        if destination.dest_hash == self.inner.dest_hash {
            return Err(SyncError::WrongDestination(format!(
                "{destination} is this endpoint"
            )));
        }
        let hash = destination.dest_hash;
        let name = destination.name.clone();
        let dial = destination.can_connect() && self.inner.connector.is_some();
        {
            let mut peers = self.inner.peers.lock();
            match peers.get_mut(&hash) {
                Some(peer) => peer.destination = destination,
                None => {
                    peers.insert(hash, Peer::new(destination));
                }
            }
        }
        info!(dest = %name, "destination added");
        if dial {
            self.inner.spawn_connect(hash);
        }
        Ok(())
    }

    /// Forgets a destination, closing its connection and stopping reconnection.
    pub fn remove_destination(&self, dest_hash: &DestHash) -> Option<Destination> {
        let peer = self.inner.peers.lock().remove(dest_hash)?;
        if let Some(task) = peer.state.connect_task {
            task.abort();
        }
        if let Some(conn) = peer.state.connection {
            conn.close(None);
        }
        info!(dest = %peer.destination.name, "destination removed");
        Some(peer.destination)
    }

    /// Every known destination.
    pub fn destinations(&self) -> Vec<Destination> {
        self.inner
            .peers
            .lock()
            .values()
            .map(|peer| peer.destination.clone())
            .collect()
    }

    /// Lifecycle of the connection to a destination.
    pub fn connection_state(&self, dest_hash: &DestHash) -> Option<ConnectionState> {
        let peers = self.inner.peers.lock();
        let peer = peers.get(dest_hash)?;
        Some(match &peer.state.connection {
            Some(conn) => conn.lifecycle(),
            None if peer.state.connecting => ConnectionState::Connecting,
            None => ConnectionState::Closed,
        })
    }

    /// Traffic counters of the current connection to a destination.
    pub fn connection_stats(&self, dest_hash: &DestHash) -> Option<ConnectionStats> {
        let peers = self.inner.peers.lock();
        peers
            .get(dest_hash)?
            .state
            .connection
            .as_ref()
            .map(|conn| conn.stats())
    }

    /// Holds writes to a destination back until [`SyncManager::resume_writing`].
    ///
    /// For transports that signal a full send buffer. Returns false if the
    /// destination has no connection.
    pub fn pause_writing(&self, dest_hash: &DestHash) -> bool {
        self.live_connection(dest_hash)
            .map(|conn| conn.pause_writing())
            .is_some()
    }

    /// Lets writes held back by [`SyncManager::pause_writing`] continue.
    pub fn resume_writing(&self, dest_hash: &DestHash) -> bool {
        self.live_connection(dest_hash)
            .map(|conn| conn.resume_writing())
            .is_some()
    }

    fn live_connection(&self, dest_hash: &DestHash) -> Option<Arc<Connection>> {
        let peers = self.inner.peers.lock();
        peers.get(dest_hash).and_then(Peer::live_connection)
    }

    /// Accepts incoming transports until the listener or the manager closes.
    pub fn serve<L: Listener + 'static>(&self, mut listener: L) -> JoinHandle<()> {
        let me = Arc::downgrade(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let connected = tokio::select! {
                    connected = listener.accept() => connected,
                    _ = shutdown.changed() => break,
                };
                let Some(connected) = connected else {
                    break;
                };
                let Some(inner) = me.upgrade() else {
                    break;
                };
                tokio::spawn(async move { inner.accept(connected).await });
            }
            debug!("listener stopped");
        })
    }

    /// Runs one incoming transport through identity checks and the handshake.
    pub async fn accept(&self, connected: Connected) {
        self.inner.accept(connected).await;
    }

    /// Resolves once everything queued for the destination has been written.
    pub async fn drain(&self, dest_hash: &DestHash) -> SyncResult<()> {
        let conn = {
            let peers = self.inner.peers.lock();
            peers.get(dest_hash).and_then(Peer::live_connection)
        };
        match conn {
            Some(conn) => conn.drain().await,
            None => Err(SyncError::NotConnected {
                dest: dest_hash.to_string(),
            }),
        }
    }

    /// Closes every connection and stops dialing.
    pub fn close(&self) {
        self.inner.shutdown.send_replace(true);
        let (tasks, connections): (Vec<_>, Vec<_>) = {
            let mut peers = self.inner.peers.lock();
            peers
                .values_mut()
                .map(|peer| {
                    peer.state.connecting = false;
                    (peer.state.connect_task.take(), peer.state.connection.take())
                })
                .unzip()
        };
        for task in tasks.into_iter().flatten() {
            task.abort();
        }
        for conn in connections.into_iter().flatten() {
            conn.close(None);
        }
        info!("sync manager closed");
    }

    // ---- sending ----

    /// Queues an object for its destinations.
    ///
    /// Fails with `NotConnected` if an explicitly requested destination has
    /// no connection. Returns a future when a response was requested.
    pub fn synchronize(&self, obj: &SyncObject, options: SyncOptions) -> SyncResult<Option<ResponseFuture>> {
        let (registry, class) = self.inner.find_class(obj.sync_type())?;
        self.inner.synchronize(obj, registry, class, options)
    }

    /// Commits a value owned by this endpoint and floods it.
    pub fn commit<T: Syncable>(&self, value: &T) -> SyncResult<SyncObject> {
        let (registry, class) = self.inner.user_class::<T>()?;
        let attributes = value_attributes(value)?;
        let obj = SyncObject::new(T::SYNC_TYPE, object_key(class, &attributes)?, attributes);
        self.inner.commit_object(registry, class, obj, None, false)
    }

    /// Commits the end state of a transition.
    ///
    /// The initiator's future resolves with the committed object. A plain
    /// [`SyncManager::commit`] breaks the transition instead.
    pub fn commit_transition<T: Syncable>(&self, value: &T) -> SyncResult<SyncObject> {
        let (registry, class) = self.inner.user_class::<T>()?;
        let attributes = value_attributes(value)?;
        let obj = SyncObject::new(T::SYNC_TYPE, object_key(class, &attributes)?, attributes);
        self.inner.commit_object(registry, class, obj, None, true)
    }

    /// Proposes a change to an object owned elsewhere.
    ///
    /// The future resolves with the owner's version once it is synchronized
    /// back, or with the error the owner raised.
    pub fn forward<T: Syncable>(&self, value: &T) -> SyncResult<ResponseFuture> {
        let inner = &self.inner;
        let (registry, class) = inner.user_class::<T>()?;
        let attributes = value_attributes(value)?;
        let mut obj = SyncObject::new(T::SYNC_TYPE, object_key(class, &attributes)?, attributes);
        let dest = {
            let state = inner.state.lock();
            let existing = state
                .store
                .get(class.bucket(), &obj.key)
                .ok_or_else(|| SyncError::NotFound(format!("{obj} is not in the store")))?;
            obj.owner = existing.owner;
            obj.sync_serial = existing.sync_serial;
            existing
                .owner
                .id()
                .and_then(|id| state.owners.get(&id))
                .and_then(|owner| owner.dest)
                .ok_or_else(|| SyncError::BadOwner(format!("{obj} is owned here; commit it instead")))?
        };
        obj.transition_id = {
            let transitions = inner.transitions.lock();
            transitions
                .get(class.bucket(), &obj.key)
                .filter(|record| record.destination.is_none())
                .map(|record| record.transition_id)
        };
        inner.request(&obj, registry, class, SyncOptions::new(Operation::Forward).to(vec![dest]))
    }

    /// Asks `owner` to create an object.
    ///
    /// Without `include_keys` the owner chooses the primary keys. Creating
    /// under a local owner commits immediately.
    pub fn create<T: Syncable>(&self, owner: Uuid, value: &T, include_keys: bool) -> SyncResult<ResponseFuture> {
        let inner = &self.inner;
        let (registry, class) = inner.user_class::<T>()?;
        let mut attributes = value_attributes(value)?;
        let record = {
            let state = inner.state.lock();
            state.owners.get(&owner).cloned()
        }
        .ok_or_else(|| SyncError::NotFound(format!("owner {owner}")))?;

        let Some(dest) = record.dest else {
            if !include_keys {
                (class.hooks.assign_primary_keys)(&mut attributes);
            }
            let obj = SyncObject::new(T::SYNC_TYPE, object_key(class, &attributes)?, attributes);
            let committed = inner.commit_object(registry, class, obj, Some(owner), false)?;
            return Ok(ResponseFuture::ready(Ok(Some(committed))));
        };

        let mut obj = SyncObject::new(T::SYNC_TYPE, PrimaryKey::unique(), attributes);
        obj.owner = OwnerRef::Owner(owner);
        let sent = if include_keys {
            AttributeSet::All
        } else {
            let keys = class.primary_keys().fields();
            AttributeSet::Only(
                class
                    .attributes()
                    .iter()
                    .filter(|name| !keys.contains(&name.as_str()))
                    .cloned()
                    .collect(),
            )
        };
        inner.request(
            &obj,
            registry,
            class,
            SyncOptions::new(Operation::Create).to(vec![dest]).attributes(sent),
        )
    }

    /// Deletes an object.
    ///
    /// Objects owned here are removed, tombstoned and the delete is flooded.
    /// Others are forwarded to their owner.
    pub fn delete<T: Syncable>(&self, value: &T) -> SyncResult<ResponseFuture> {
        let inner = &self.inner;
        let (registry, class) = inner.user_class::<T>()?;
        let attributes = value_attributes(value)?;
        let key = object_key(class, &attributes)?;
        let bucket = class.bucket();

        let (obj, owner_dest, serial) = {
            let mut guard = inner.state.lock();
            let state = &mut *guard;
            let existing = state
                .store
                .get(bucket, &key)
                .cloned()
                .ok_or_else(|| SyncError::NotFound(format!("<{} {key}> is not in the store", T::SYNC_TYPE)))?;
            let record = existing.owner.id().and_then(|id| state.owners.get(&id)).cloned();
            if operations::is_local(&existing, record.as_ref()) {
                state.store.remove(bucket, &key);
                let serial = state.owners.next_serial();
                state
                    .store
                    .add_tombstone(bucket, &existing, class.primary_keys().fields(), serial);
                let mut obj = existing;
                obj.sync_serial = serial;
                (obj, None, Some(serial))
            } else {
                let dest = record
                    .and_then(|owner| owner.dest)
                    .ok_or_else(|| SyncError::BadOwner(format!("{existing} has no reachable owner")))?;
                (existing, Some(dest), None)
            }
        };

        match (owner_dest, serial) {
            (Some(dest), _) => inner.request(
                &obj,
                registry,
                class,
                SyncOptions::new(Operation::Delete)
                    .to(vec![dest])
                    .attributes(key_attributes(class, false)),
            ),
            (None, serial) => {
                let outcome = inner.transitions.lock().commit_local(bucket, &obj, None);
                if let LocalCommit::Broken(broken) = outcome {
                    inner.report_broken(broken);
                }
                debug!(object = %obj, "deleted");
                inner.synchronize(
                    &obj,
                    registry,
                    class,
                    SyncOptions::new(Operation::Delete).attributes(key_attributes(class, true)),
                )?;
                inner.trigger_you_haves(serial.unwrap_or_default());
                Ok(ResponseFuture::ready(Ok(None)))
            }
        }
    }

    /// Sends an intermediate state of an object.
    ///
    /// The first call starts the transition and returns a future that
    /// resolves with the committed object or `BrokenTransition`. Later
    /// calls continue the same transition and return `None`.
    pub fn perform_transition<T: Syncable>(&self, value: &T) -> SyncResult<Option<ResponseFuture>> {
        let inner = &self.inner;
        let (registry, class) = inner.user_class::<T>()?;
        if !class.supports_transitions() {
            return Err(SyncError::BadOperation(format!(
                "{} does not support transitions",
                T::SYNC_TYPE
            )));
        }
        let attributes = value_attributes(value)?;
        let mut obj = SyncObject::new(T::SYNC_TYPE, object_key(class, &attributes)?, attributes);
        let bucket = class.bucket();

        let owner_dest = {
            let state = inner.state.lock();
            let existing = state
                .store
                .get(bucket, &obj.key)
                .ok_or_else(|| SyncError::NotFound(format!("{obj} is not in the store")))?;
            obj.owner = existing.owner;
            obj.sync_serial = existing.sync_serial;
            let record = existing.owner.id().and_then(|id| state.owners.get(&id));
            if operations::is_local(existing, record) {
                None
            } else {
                Some(
                    record
                        .and_then(|owner| owner.dest)
                        .ok_or_else(|| SyncError::BadOwner(format!("{obj} has no reachable owner")))?,
                )
            }
        };

        let existing_id = {
            let transitions = inner.transitions.lock();
            transitions
                .get(bucket, &obj.key)
                .filter(|record| record.destination.is_none())
                .map(|record| record.transition_id)
        };
        let transition_id = existing_id.unwrap_or_else(Uuid::new_v4);
        obj.transition_id = Some(transition_id);
        obj.generated_locally = true;

        let sent = match (class.hooks.transition_modified_attrs)(&obj) {
            None => AttributeSet::All,
            Some(modified) => {
                let mut names: BTreeSet<String> = modified.into_iter().collect();
                names.extend(class.primary_keys().fields().iter().map(|field| field.to_string()));
                names.insert(TRANSITION_ATTRIBUTE.to_string());
                AttributeSet::Only(names)
            }
        };

        let (completion, future) = if existing_id.is_none() {
            let (completion, future) = Completion::new();
            completion.on_complete(inner.transition_cleanup(bucket, obj.key.clone(), transition_id));
            (Some(completion), Some(future))
        } else {
            (None, None)
        };
        // Only a remote owner answers; a local transition ends with our own commit.
        let ctx = match (&completion, owner_dest) {
            (Some(completion), Some(_)) => {
                let ctx = ResponseContext::new();
                ctx.add_completion(completion.clone());
                Some(ctx)
            }
            _ => None,
        };

        let mut options = SyncOptions::new(Operation::Transition)
            .attributes(sent)
            .response_for(ctx);
        if let Some(dest) = owner_dest {
            options = options.to(vec![dest]);
        }
        inner.synchronize(&obj, registry, class, options)?;

        let (broken, _) = inner
            .transitions
            .lock()
            .store(bucket, obj, transition_id, None, None, completion);
        if let Some(broken) = broken {
            inner.report_broken(broken);
        }
        Ok(future)
    }

    // ---- lookups ----

    /// The stored value with these primary key values.
    pub fn get<T: Syncable>(&self, key: &[Value]) -> Option<T> {
        self.object::<T>(key)?.decode().ok()
    }

    /// The stored envelope with these primary key values.
    pub fn object<T: Syncable>(&self, key: &[Value]) -> Option<SyncObject> {
        let (_, class) = self.inner.user_class::<T>().ok()?;
        let key = PrimaryKey::from_values(key);
        let state = self.inner.state.lock();
        state
            .store
            .get(class.bucket(), &key)
            .filter(|obj| obj.sync_type() == T::SYNC_TYPE)
            .cloned()
    }

    /// Every stored value of a type.
    pub fn objects<T: Syncable>(&self) -> Vec<T> {
        let Ok((_, class)) = self.inner.user_class::<T>() else {
            return Vec::new();
        };
        let state = self.inner.state.lock();
        state
            .store
            .objects_of_type(class.bucket(), T::SYNC_TYPE)
            .filter_map(|obj| obj.decode().ok())
            .collect()
    }

    /// Number of stored objects of a type.
    pub fn count<T: Syncable>(&self) -> usize {
        let Ok((_, class)) = self.inner.user_class::<T>() else {
            return 0;
        };
        let state = self.inner.state.lock();
        state.store.objects_of_type(class.bucket(), T::SYNC_TYPE).count()
    }

    /// The in-transition state of an object, if it is in transition.
    pub fn transition_state<T: Syncable>(&self, key: &[Value]) -> Option<T> {
        let (_, class) = self.inner.user_class::<T>().ok()?;
        let key = PrimaryKey::from_values(key);
        let transitions = self.inner.transitions.lock();
        transitions
            .get(class.bucket(), &key)
            .and_then(|record| record.object.decode().ok())
    }

    // ---- owners ----

    /// Every known owner, in the order they became known.
    pub fn owners(&self) -> Vec<OwnerRecord> {
        self.inner.state.lock().owners.iter().cloned().collect()
    }

    /// One owner record.
    pub fn owner(&self, id: &Uuid) -> Option<OwnerRecord> {
        self.inner.state.lock().owners.get(id).cloned()
    }

    /// The first local owner, created on demand.
    pub fn local_owner(&self) -> Uuid {
        self.inner.state.lock().owners.ensure_local()
    }

    /// Moves every local owner to a fresh epoch so peers resynchronize.
    pub fn force_resync(&self) {
        self.inner.force_resync();
    }

    /// Deletes a local owner and every object it owns, here and on peers.
    pub fn delete_owner(&self, id: Uuid) -> SyncResult<()> {
        self.inner.delete_owner(id)
    }
}

impl ManagerInner {
    /// Looks a class up in the internal registries, then the application's.
    pub fn find_class(&self, sync_type: &str) -> SyncResult<(&Registry, &Arc<ClassDescriptor>)> {
        [&self.meta, &self.errors]
            .into_iter()
            .chain(self.registries.iter())
            .find_map(|registry| registry.class(sync_type).map(|class| (registry, class)))
            .ok_or_else(|| SyncError::UnregisteredClass(sync_type.to_string()))
    }

    fn user_class<T: Syncable>(&self) -> SyncResult<(&Registry, &Arc<ClassDescriptor>)> {
        self.registries
            .iter()
            .find_map(|registry| registry.class(T::SYNC_TYPE).map(|class| (registry, class)))
            .ok_or_else(|| SyncError::UnregisteredClass(T::SYNC_TYPE.to_string()))
    }

    fn may_send(&self, obj: &SyncObject, registry: &Registry, class: &ClassDescriptor, dest: &Destination) -> bool {
        dest.should_send(obj) && registry.hooks().should_send(obj, dest) && (class.hooks.should_send)(obj, dest)
    }

    fn dirty_item(
        &self,
        obj: &SyncObject,
        class: &ClassDescriptor,
        operation: Operation,
        attributes: AttributeSet,
        response_for: Option<ResponseContext>,
        priority: Option<i32>,
    ) -> DirtyItem {
        DirtyItem {
            object: obj.clone(),
            bucket: class.bucket().to_string(),
            operation,
            attributes,
            response_for,
            priority: priority.unwrap_or_else(|| class.priority()),
            with_serial: class.is_stored(),
            is_error: class.kind() == ClassKind::Error || class.sync_type() == catchup::WRONG_EPOCH,
        }
    }

    /// Fans an object out to the dirty queues of its destinations.
    pub fn synchronize(
        &self,
        obj: &SyncObject,
        registry: &Registry,
        class: &ClassDescriptor,
        options: SyncOptions,
    ) -> SyncResult<Option<ResponseFuture>> {
        let SyncOptions {
            destinations,
            exclude,
            operation,
            attributes,
            response,
            response_for,
            priority,
        } = options;
        let response_for = match (response_for, response) {
            (Some(ctx), _) => Some(ctx),
            (None, true) => Some(ResponseContext::new()),
            (None, false) => None,
        };
        let future = match (&response_for, response) {
            (Some(ctx), true) => Some(ctx.add_future()),
            _ => None,
        };

        let explicit = destinations.is_some();
        let candidates: Vec<(Destination, Option<Arc<Connection>>, bool)> = {
            let peers = self.peers.lock();
            let chosen: Vec<DestHash> = match destinations {
                Some(list) => {
                    if let Some(unknown) = list.iter().find(|hash| !peers.contains_key(hash)) {
                        return Err(SyncError::NotConnected {
                            dest: unknown.to_string(),
                        });
                    }
                    list
                }
                None => peers
                    .iter()
                    .filter(|(_, peer)| peer.live_connection().is_some())
                    .map(|(hash, _)| *hash)
                    .collect(),
            };
            chosen
                .into_iter()
                .filter(|hash| !exclude.contains(hash))
                .filter_map(|hash| peers.get(&hash))
                .map(|peer| {
                    let conn = peer.live_connection();
                    let dialing = conn.is_none() && peer.state.connecting;
                    (peer.destination.clone(), conn, dialing)
                })
                .collect()
        };

        let mut targets = Vec::with_capacity(candidates.len());
        for (dest, conn, dialing) in candidates {
            if !self.may_send(obj, registry, class, &dest) {
                continue;
            }
            match conn {
                Some(conn) => targets.push(conn),
                None if dialing => {
                    debug!(dest = %dest.name, object = %obj, "destination still connecting; not queued")
                }
                None if explicit => return Err(SyncError::NotConnected { dest: dest.name }),
                None => {}
            }
        }

        if let Some(ctx) = &response_for {
            let dests: Vec<DestHash> = targets.iter().map(|conn| conn.dest_hash()).collect();
            ctx.sending_to(&dests);
        }
        for conn in targets {
            let item = self.dirty_item(obj, class, operation, attributes.clone(), response_for.clone(), priority);
            if let Err(e) = conn.enqueue(item) {
                debug!(dest = %conn.name(), object = %obj, error = %e, "could not queue object");
            }
        }
        Ok(future)
    }

    /// Synchronizes with a fresh response future.
    pub fn request(
        &self,
        obj: &SyncObject,
        registry: &Registry,
        class: &ClassDescriptor,
        options: SyncOptions,
    ) -> SyncResult<ResponseFuture> {
        let ctx = options.response_for.clone().unwrap_or_default();
        let future = ctx.add_future();
        self.synchronize(obj, registry, class, options.response_for(Some(ctx)))?;
        Ok(future)
    }

    /// Queues an object on one connection, bypassing destination selection.
    pub fn send_on(
        &self,
        conn: &Connection,
        obj: &SyncObject,
        class: &ClassDescriptor,
        operation: Operation,
        attributes: AttributeSet,
        response_for: Option<ResponseContext>,
    ) -> SyncResult<()> {
        if let Some(ctx) = &response_for {
            ctx.sending_to(&[conn.dest_hash()]);
        }
        conn.enqueue(self.dirty_item(obj, class, operation, attributes, response_for, None))
    }

    /// Runs the steps of a flood rule.
    ///
    /// A step toward one destination carrying the response context fails
    /// the whole flood, so the sender learns the object went nowhere.
    pub fn flood(
        &self,
        obj: &SyncObject,
        registry: &Registry,
        class: &ClassDescriptor,
        steps: Vec<FloodStep>,
        received: &BTreeSet<String>,
        response_for: Option<&ResponseContext>,
    ) -> SyncResult<()> {
        for step in steps {
            let attributes = match step.attributes {
                FloodAttributes::All => AttributeSet::All,
                FloodAttributes::Received => {
                    let mut names = received.clone();
                    names.extend(class.primary_keys().fields().iter().map(|field| field.to_string()));
                    AttributeSet::Only(names)
                }
                FloodAttributes::Keys => key_attributes(class, false),
                FloodAttributes::KeysAndSerial => key_attributes(class, true),
            };
            let mut options = SyncOptions::new(step.operation)
                .excluding(step.exclude)
                .attributes(attributes);
            let directed = matches!(step.targets, Targets::Only(_));
            if let Targets::Only(dest) = step.targets {
                options = options.to(vec![dest]);
            }
            if step.keep_response {
                options = options.response_for(response_for.cloned());
            }
            if let Err(e) = self.synchronize(obj, registry, class, options) {
                if directed && step.keep_response && step.operation != Operation::Error {
                    return Err(e);
                }
                warn!(object = %obj, operation = %step.operation, error = %e, "flood step failed");
            }
        }
        Ok(())
    }

    /// Stores a local commit and floods it.
    fn commit_object(
        &self,
        registry: &Registry,
        class: &ClassDescriptor,
        mut obj: SyncObject,
        owner: Option<Uuid>,
        transition: bool,
    ) -> SyncResult<SyncObject> {
        let bucket = class.bucket();
        obj.generated_locally = true;
        let serial = if class.is_stored() {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let existing = state.store.get(bucket, &obj.key).map(|o| o.owner);
            let owner_id = match (owner, existing) {
                (Some(id), _) => id,
                (None, Some(OwnerRef::Owner(id))) => match state.owners.get(&id) {
                    Some(record) if !record.is_local() => {
                        return Err(SyncError::BadOwner(format!(
                            "{obj} belongs to owner {id} on another destination"
                        )))
                    }
                    Some(_) => id,
                    None => state.owners.ensure_local(),
                },
                (None, _) => state.owners.ensure_local(),
            };
            let serial = state.owners.next_serial();
            obj.owner = OwnerRef::Owner(owner_id);
            obj.sync_serial = serial;
            obj.transition_id = None;
            state.store.add(bucket, obj.clone());
            serial
        } else {
            obj.owner = OwnerRef::Ephemeral(owner);
            0
        };

        let outcome = {
            let mut transitions = self.transitions.lock();
            let transition_id = if transition {
                transitions.get(bucket, &obj.key).map(|record| record.transition_id)
            } else {
                None
            };
            obj.transition_id = transition_id;
            transitions.commit_local(bucket, &obj, transition_id)
        };
        let response_for = match outcome {
            LocalCommit::NotInTransition => None,
            LocalCommit::Completed(ctx) => ctx,
            LocalCommit::Broken(broken) => {
                self.report_broken(broken);
                None
            }
        };

        debug!(object = %obj, serial, "committed");
        self.synchronize(
            &obj,
            registry,
            class,
            SyncOptions::new(Operation::Sync).response_for(response_for),
        )?;
        self.trigger_you_haves(serial);
        obj.transition_id = None;
        Ok(obj)
    }

    /// True if this endpoint owns the stored object.
    pub fn object_is_local(&self, bucket: &str, key: &PrimaryKey) -> bool {
        let state = self.state.lock();
        match state.store.get(bucket, key) {
            Some(obj) => {
                let record = obj.owner.id().and_then(|id| state.owners.get(&id));
                operations::is_local(obj, record)
            }
            None => false,
        }
    }

    /// Drops the transition record once its initiator has an outcome.
    ///
    /// A transition on an object owned here outlives a missing response;
    /// only the owner's commit ends it.
    pub fn transition_cleanup(
        &self,
        bucket: &'static str,
        key: PrimaryKey,
        transition_id: Uuid,
    ) -> impl FnOnce(&ResponseOutcome) + Send + 'static {
        let me = self.me.clone();
        move |outcome| {
            let Some(inner) = me.upgrade() else {
                return;
            };
            if matches!(outcome, Ok(None)) && inner.object_is_local(bucket, &key) {
                return;
            }
            let removed = inner.transitions.lock().remove_matching(bucket, &key, transition_id);
            if removed.is_some() {
                debug!(%transition_id, "transition finished");
            }
        }
    }

    /// Tells whoever started a broken transition.
    pub fn report_broken(&self, broken: BrokenRecord) {
        if let Some(dest) = broken.destination {
            self.send_error_to(dest, &broken.error, broken.response_for);
        }
    }

    fn error_object(&self, error: &SyncError) -> Option<(&Arc<ClassDescriptor>, &Registry, SyncObject)> {
        let sync_type = error.wire_type()?;
        let (registry, class) = self.find_class(sync_type).ok()?;
        let mut obj = SyncObject::new(sync_type, PrimaryKey::unique(), error.wire_attributes());
        obj.owner = OwnerRef::Ephemeral(None);
        obj.generated_locally = true;
        Some((class, registry, obj))
    }

    /// Best effort: sends an error to a destination.
    pub fn send_error_to(&self, dest: DestHash, error: &SyncError, response_for: Option<ResponseContext>) {
        let Some((class, registry, obj)) = self.error_object(error) else {
            debug!(error = %error, "error has no wire form");
            return;
        };
        let options = SyncOptions::new(Operation::Error)
            .to(vec![dest])
            .response_for(response_for);
        if let Err(e) = self.synchronize(&obj, registry, class, options) {
            warn!(dest = %dest, error = %error, cause = %e, "could not send error");
        }
    }

    // ---- connections ----

    fn spawn_connect(&self, hash: DestHash) {
        let me = self.me.clone();
        let mut peers = self.peers.lock();
        let Some(peer) = peers.get_mut(&hash) else {
            return;
        };
        if peer.state.connecting || peer.live_connection().is_some() {
            return;
        }
        peer.state.connecting = true;
        peer.state.connect_task = Some(tokio::spawn(connect_loop(me, hash)));
    }

    /// Marks a dial as over without a connection.
    fn stop_connecting(&self, hash: DestHash) {
        if let Some(peer) = self.peers.lock().get_mut(&hash) {
            peer.state.connecting = false;
            peer.state.connect_task = None;
        }
    }

    /// Starts a connection over an established transport and sends the handshake.
    pub fn establish(&self, hash: DestHash, stream: BoxStream) {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let handler: Weak<dyn MessageHandler> = self.me.clone();
        let (conn, previous) = {
            let mut peers = self.peers.lock();
            let Some(peer) = peers.get_mut(&hash) else {
                debug!(dest = %hash, "destination removed before the connection was set up");
                return;
            };
            let bandwidth = match peer.destination.bw_per_sec {
                Some(chars_per_sec) => BandwidthConfig::new(chars_per_sec, self.config.bandwidth.quantum),
                None => self.config.bandwidth.clone(),
            };
            let conn = Connection::new(id, hash, peer.destination.name.clone(), &bandwidth, handler);
            let previous = peer.state.connection.take();
            peer.state.reset_connection();
            peer.state.connection = Some(conn.clone());
            peer.state.connecting = false;
            peer.state.connect_task = None;
            peer.state.attempt = 0;
            peer.state.connect_at = None;
            (conn, previous)
        };
        if let Some(previous) = previous {
            previous.close(None);
        }

        conn.start(stream);
        info!(dest = %conn.name(), connection = id, "connected");
        let me = self.me.clone();
        tokio::spawn(async move {
            let Some(inner) = me.upgrade() else {
                return;
            };
            match inner.handle_connected(&conn).await {
                Ok(()) => {
                    conn.mark_active();
                    debug!(dest = %conn.name(), "handshake sent");
                }
                Err(e) => {
                    warn!(dest = %conn.name(), error = %e, "handshake failed");
                    conn.close(Some(e));
                }
            }
        });
    }

    async fn accept(&self, connected: Connected) {
        let peer = connected.peer;
        if peer == self.dest_hash {
            warn!("refusing a connection from this endpoint's own identity");
            return;
        }
        let known = self.peers.lock().contains_key(&peer);
        if !known {
            let destination = self.unknown_destination.as_ref().and_then(|hook| hook(peer));
            match destination {
                Some(destination) if destination.dest_hash == peer => {
                    info!(dest = %destination.name, "accepted unknown destination");
                    self.peers
                        .lock()
                        .entry(peer)
                        .or_insert_with(|| Peer::new(destination));
                }
                _ => {
                    error!(dest = %peer, "connection from unknown destination refused");
                    return;
                }
            }
        }

        let dialing = {
            let peers = self.peers.lock();
            peers.get(&peer).map_or(false, |p| p.state.connecting)
        };
        if dialing && self.dest_hash > peer {
            // Both sides dialed; the smaller identity keeps the other's dial.
            tokio::time::sleep(self.config.collision_delay).await;
            let ours_won = {
                let peers = self.peers.lock();
                peers.get(&peer).and_then(Peer::live_connection).is_some()
            };
            if ours_won {
                debug!(dest = %peer, "keeping our own connection");
                return;
            }
        }

        let task = {
            let mut peers = self.peers.lock();
            match peers.get_mut(&peer) {
                Some(p) => {
                    p.state.connecting = false;
                    p.state.connect_task.take()
                }
                None => return,
            }
        };
        if let Some(task) = task {
            task.abort();
        }
        self.establish(peer, connected.stream);
    }

    fn on_connection_lost(&self, conn: &Arc<Connection>) {
        let hash = conn.dest_hash();
        let reconnect = {
            let mut peers = self.peers.lock();
            let Some(peer) = peers.get_mut(&hash) else {
                return;
            };
            if !peer.is_current(conn) {
                return;
            }
            peer.state.reset_connection();
            peer.destination.can_connect()
                && self.connector.is_some()
                && !*self.shutdown.borrow()
                && !peer.state.connecting
        };
        if reconnect {
            self.spawn_connect(hash);
        }
    }
}

/// Dials a destination until it connects, fails for good or goes away.
async fn connect_loop(me: Weak<ManagerInner>, hash: DestHash) {
    let mut shutdown = match me.upgrade() {
        Some(inner) => inner.shutdown.subscribe(),
        None => return,
    };
    loop {
        let Some(inner) = me.upgrade() else {
            return;
        };
        let Some(connector) = inner.connector.clone() else {
            inner.stop_connecting(hash);
            return;
        };
        let (destination, connect_at) = {
            let peers = inner.peers.lock();
            match peers.get(&hash) {
                Some(peer) => (peer.destination.clone(), peer.state.connect_at),
                None => return,
            }
        };
        drop(inner);

        if let Some(at) = connect_at {
            debug!(dest = %destination.name, delay = ?at.saturating_duration_since(Instant::now()), "waiting to reconnect");
            tokio::select! {
                _ = tokio::time::sleep_until(at) => {}
                _ = shutdown.changed() => return,
            }
        }
        if *shutdown.borrow() {
            return;
        }
        let result = tokio::select! {
            result = connector.connect(&destination) => result,
            _ = shutdown.changed() => return,
        };

        let Some(inner) = me.upgrade() else {
            return;
        };
        match result {
            Ok(connected) if connected.peer != hash => {
                let e = SyncError::WrongDestination(format!(
                    "{} presented identity {}",
                    destination.name, connected.peer
                ));
                error!(dest = %destination.name, error = %e, "refusing connection");
                inner.stop_connecting(hash);
                return;
            }
            Ok(connected) => {
                inner.establish(hash, connected.stream);
                return;
            }
            Err(e) if e.is_retryable() => {
                let mut peers = inner.peers.lock();
                let Some(peer) = peers.get_mut(&hash) else {
                    return;
                };
                peer.state.attempt += 1;
                let delay = inner.config.backoff.delay_for_attempt(peer.state.attempt);
                peer.state.connect_at = Some(Instant::now() + delay);
                warn!(dest = %destination.name, error = %e, attempt = peer.state.attempt, ?delay, "connection attempt failed");
            }
            Err(e) => {
                error!(dest = %destination.name, error = %e, "giving up on destination");
                inner.stop_connecting(hash);
                return;
            }
        }
    }
}

impl MessageHandler for ManagerInner {
    fn receive(
        &self,
        conn: &Arc<Connection>,
        msg: SyncMessage,
        response_for: Option<ResponseContext>,
    ) -> SyncResult<()> {
        self.incoming_message(conn, msg, response_for)
    }

    fn send_error(&self, conn: &Arc<Connection>, error: &SyncError, response_for: Option<ResponseContext>) {
        let Some((class, _, obj)) = self.error_object(error) else {
            return;
        };
        if let Err(e) = self.send_on(conn, &obj, class, Operation::Error, AttributeSet::All, response_for) {
            warn!(dest = %conn.name(), error = %error, cause = %e, "could not send error");
        }
    }

    fn connection_lost(&self, conn: &Arc<Connection>, _error: Option<SyncError>) {
        self.on_connection_lost(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Syncable;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Lamp {
        id: u32,
        on: bool,
    }

    impl Syncable for Lamp {
        const SYNC_TYPE: &'static str = "Lamp";
        const PRIMARY_KEYS: PrimaryKeys = PrimaryKeys::Fields(&["id"]);
    }

    fn manager() -> SyncManager {
        SyncManager::builder(DestHash::from_string("lonely"))
            .registry(Registry::new("lamps").with_class::<Lamp>().unwrap())
            .build()
    }

    #[tokio::test]
    async fn commit_stores_under_local_owner() {
        let manager = manager();
        let committed = manager.commit(&Lamp { id: 1, on: true }).unwrap();
        let owner = manager.local_owner();
        assert_eq!(committed.owner(), OwnerRef::Owner(owner));
        assert_eq!(committed.sync_serial(), 1);
        assert_eq!(manager.get::<Lamp>(&[json!(1)]), Some(Lamp { id: 1, on: true }));

        let again = manager.commit(&Lamp { id: 1, on: false }).unwrap();
        assert_eq!(again.sync_serial(), 2);
        assert_eq!(manager.count::<Lamp>(), 1);
    }

    #[tokio::test]
    async fn explicit_unknown_destination_is_not_connected() {
        let manager = manager();
        let committed = manager.commit(&Lamp { id: 1, on: true }).unwrap();
        let err = manager
            .synchronize(&committed, SyncOptions::new(Operation::Sync).to(vec![DestHash::from_string("nobody")]))
            .unwrap_err();
        assert!(matches!(err, SyncError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn passive_destination_without_connection_is_not_connected() {
        let manager = manager();
        let peer = DestHash::from_string("peer");
        manager.add_destination(Destination::new(peer, "peer")).unwrap();
        assert_eq!(manager.connection_state(&peer), Some(ConnectionState::Closed));

        let committed = manager.commit(&Lamp { id: 2, on: true }).unwrap();
        let err = manager
            .synchronize(&committed, SyncOptions::new(Operation::Sync).to(vec![peer]))
            .unwrap_err();
        assert_eq!(err, SyncError::NotConnected { dest: "peer".into() });
        // Broadcasts skip unconnected peers
        assert!(manager.synchronize(&committed, SyncOptions::new(Operation::Sync)).is_ok());
    }

    #[tokio::test]
    async fn local_delete_leaves_tombstone_and_resolves() {
        let manager = manager();
        manager.commit(&Lamp { id: 3, on: true }).unwrap();
        let outcome = manager.delete(&Lamp { id: 3, on: true }).unwrap().await;
        assert_eq!(outcome, Ok(None));
        assert_eq!(manager.count::<Lamp>(), 0);
        assert!(matches!(
            manager.delete(&Lamp { id: 3, on: true }),
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cannot_add_self() {
        let manager = manager();
        let me = manager.dest_hash();
        assert!(matches!(
            manager.add_destination(Destination::new(me, "me")),
            Err(SyncError::WrongDestination(_))
        ));
    }

    #[tokio::test]
    async fn unregistered_type_is_rejected() {
        #[derive(Debug, Clone, Default, Serialize, Deserialize)]
        struct Stranger {
            id: u32,
        }
        impl Syncable for Stranger {
            const SYNC_TYPE: &'static str = "Stranger";
            const PRIMARY_KEYS: PrimaryKeys = PrimaryKeys::Fields(&["id"]);
        }
        let manager = manager();
        assert!(matches!(
            manager.commit(&Stranger { id: 1 }),
            Err(SyncError::UnregisteredClass(_))
        ));
    }

    #[tokio::test]
    async fn transition_on_local_object_completes_on_commit_transition() {
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        struct Dimmer {
            id: u32,
            level: u8,
        }
        impl Syncable for Dimmer {
            const SYNC_TYPE: &'static str = "Dimmer";
            const PRIMARY_KEYS: PrimaryKeys = PrimaryKeys::Fields(&["id"]);
            const TRANSITIONS: bool = true;
        }
        let manager = SyncManager::builder(DestHash::from_string("solo"))
            .registry(Registry::new("dimmers").with_class::<Dimmer>().unwrap())
            .build();
        manager.commit(&Dimmer { id: 1, level: 0 }).unwrap();

        let future = manager
            .perform_transition(&Dimmer { id: 1, level: 40 })
            .unwrap()
            .expect("first call starts the transition");
        assert_eq!(
            manager.transition_state::<Dimmer>(&[json!(1)]),
            Some(Dimmer { id: 1, level: 40 })
        );
        assert!(manager.perform_transition(&Dimmer { id: 1, level: 60 }).unwrap().is_none());

        let committed = manager.commit_transition(&Dimmer { id: 1, level: 60 }).unwrap();
        let outcome = future.await.unwrap().unwrap();
        assert_eq!(outcome.get("level"), Some(&json!(60)));
        assert_eq!(committed.transition_id(), None);
        assert!(manager.transition_state::<Dimmer>(&[json!(1)]).is_none());
    }
}
