//! Owners and incremental catch-up.
//!
//! On connect each side announces its owners, then a `MyOwners` list. For
//! every owner announced to it, a peer sends `IHave` with the highest
//! serial it holds and the epoch it expects. The side closer to the owner
//! answers with tombstones and objects newer than that serial, followed by
//! `YouHave` carrying the new high-water mark. An epoch mismatch is
//! answered with `WrongEpoch` instead, and the peer starts over from zero.
//!
//! Later commits schedule further `YouHave` batches to every peer that has
//! sent an `IHave` for the owner on its current connection.

use crate::connection::Connection;
use crate::destination::Destination;
use crate::error::{SyncError, SyncResult, ERROR_ATTRIBUTES};
use crate::manager::{key_attributes, ManagerInner, SyncOptions};
use crate::object::{AttributeSet, OwnerRef, PrimaryKey, SyncObject};
use crate::operations::Operation;
use crate::owner::{Epoch, OwnerRecord};
use crate::receive::epoch_attribute;
use crate::registry::{
    ClassDescriptor, ClassKind, PrimaryKeys, ReceiveInfo, Registry, RegistryHooks, ERROR_PRIORITY, META_PRIORITY,
    OWNER_PRIORITY,
};
use entanglement_protocol::{DestHash, SyncMessage};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Owner announcement.
pub const SYNC_OWNER: &str = "SyncOwner";
/// Catch-up request.
pub const I_HAVE: &str = "IHave";
/// Catch-up high-water mark.
pub const YOU_HAVE: &str = "YouHave";
/// Epoch mismatch answer to `IHave`.
pub const WRONG_EPOCH: &str = "WrongEpoch";
/// Complete list of a peer's owners.
pub const MY_OWNERS: &str = "MyOwners";

/// Name of the registry holding the catch-up classes.
pub const META_REGISTRY: &str = "sync_meta";
/// Name of the registry holding the error classes.
pub const ERROR_REGISTRY: &str = "sync_errors";

struct MetaHooks;

impl RegistryHooks for MetaHooks {
    fn should_listen(&self, msg: &SyncMessage, info: &ReceiveInfo) -> SyncResult<()> {
        if info.operation == Operation::Delete && msg.sync_type() != Some(SYNC_OWNER) {
            return Err(SyncError::Unauthorized(format!(
                "{} cannot be deleted",
                msg.sync_type().unwrap_or("?")
            )));
        }
        Ok(())
    }
}

/// Catch-up messages describe this endpoint's view and are never relayed.
fn generated_here(obj: &SyncObject, _dest: &Destination) -> bool {
    obj.generated_locally()
}

pub(crate) fn meta_registry() -> Registry {
    let mut registry = Registry::new(META_REGISTRY)
        .with_operations(&[Operation::Sync, Operation::Forward, Operation::Delete])
        .with_hooks(MetaHooks);
    registry.insert(ClassDescriptor::internal(
        SYNC_OWNER,
        ClassKind::Owner,
        PrimaryKeys::Fields(&["id"]),
        &["id", "epoch"],
        OWNER_PRIORITY,
    ));
    for sync_type in [I_HAVE, YOU_HAVE] {
        registry.insert(
            ClassDescriptor::internal(
                sync_type,
                ClassKind::Meta,
                PrimaryKeys::Fields(&["serial", "epoch"]),
                &["serial", "epoch"],
                META_PRIORITY,
            )
            .with_should_send(generated_here),
        );
    }
    registry.insert(ClassDescriptor::internal(
        WRONG_EPOCH,
        ClassKind::Meta,
        PrimaryKeys::Unique,
        &["new_epoch"],
        META_PRIORITY,
    ));
    registry.insert(ClassDescriptor::internal(
        MY_OWNERS,
        ClassKind::Meta,
        PrimaryKeys::Unique,
        &["owners"],
        META_PRIORITY,
    ));
    registry
}

pub(crate) fn error_registry() -> Registry {
    let mut registry = Registry::new(ERROR_REGISTRY).with_operations(&[Operation::Sync]);
    for sync_type in SyncError::wire_types() {
        registry.insert(ClassDescriptor::internal(
            sync_type,
            ClassKind::Error,
            PrimaryKeys::Unique,
            &ERROR_ATTRIBUTES,
            ERROR_PRIORITY,
        ));
    }
    registry
}

/// The announcement of an owner.
pub(crate) fn owner_object(record: &OwnerRecord) -> SyncObject {
    let id = Value::String(record.id.to_string());
    let mut attributes = Map::new();
    attributes.insert("id".into(), id.clone());
    attributes.insert("epoch".into(), Value::String(record.advertised_epoch().to_wire()));
    let mut obj = SyncObject::new(SYNC_OWNER, PrimaryKey::from_values(&[id]), attributes);
    obj.owner = OwnerRef::Owner(record.id);
    obj.generated_locally = record.is_local();
    obj
}

/// An `IHave` or `YouHave` about `owner`.
///
/// Keyed by owner so a newer mark replaces one still queued.
pub(crate) fn serial_object(sync_type: &'static str, owner: Uuid, serial: u64, epoch: Epoch) -> SyncObject {
    let mut attributes = Map::new();
    attributes.insert("serial".into(), Value::from(serial));
    attributes.insert("epoch".into(), Value::String(epoch.to_wire()));
    let key = PrimaryKey::from_values(&[Value::String(owner.to_string())]);
    let mut obj = SyncObject::new(sync_type, key, attributes);
    obj.owner = OwnerRef::Ephemeral(Some(owner));
    obj.generated_locally = true;
    obj
}

fn about_owner(obj: &SyncObject) -> SyncResult<Uuid> {
    obj.owner()
        .id()
        .ok_or_else(|| SyncError::BadEncoding(format!("{} requires _sync_owner", obj.sync_type())))
}

fn serial_and_epoch(obj: &SyncObject) -> SyncResult<(u64, Epoch)> {
    let serial = obj
        .get("serial")
        .and_then(Value::as_u64)
        .ok_or_else(|| SyncError::BadEncoding(format!("{} serial must be an unsigned integer", obj.sync_type())))?;
    Ok((serial, epoch_attribute(obj.attributes(), "epoch")?))
}

impl ManagerInner {
    /// Announces our owners on a fresh connection.
    pub(crate) async fn handle_connected(&self, conn: &Arc<Connection>) -> SyncResult<()> {
        let peer = conn.dest_hash();
        let destination = {
            let peers = self.peers.lock();
            peers.get(&peer).map(|p| p.destination.clone())
        }
        .ok_or(SyncError::Closed)?;

        let owners: Vec<SyncObject> = {
            let mut state = self.state.lock();
            state.owners.ensure_local();
            let (local, relayed): (Vec<&OwnerRecord>, Vec<&OwnerRecord>) = state
                .owners
                .iter()
                .filter(|record| record.dest != Some(peer))
                .partition(|record| record.is_local());
            local.into_iter().chain(relayed).map(owner_object).collect()
        };
        let owners: Vec<SyncObject> = owners.into_iter().filter(|obj| destination.should_send(obj)).collect();

        let (_, owner_class) = self.find_class(SYNC_OWNER)?;
        for obj in &owners {
            self.send_on(conn, obj, owner_class, Operation::Sync, AttributeSet::All, None)?;
        }
        {
            let mut peers = self.peers.lock();
            if let Some(p) = peers.get_mut(&peer) {
                if p.is_current(conn) {
                    p.state.first_local_owner = owners.first().and_then(|obj| obj.owner().id());
                }
            }
        }
        if owners.is_empty() {
            return Ok(());
        }

        conn.drain().await?;
        let ids: Vec<Value> = owners
            .iter()
            .filter_map(|obj| obj.owner().id())
            .map(|id| Value::String(id.to_string()))
            .collect();
        let mut attributes = Map::new();
        attributes.insert("owners".into(), Value::Array(ids));
        let mut my_owners = SyncObject::new(MY_OWNERS, PrimaryKey::unique(), attributes);
        my_owners.owner = OwnerRef::Ephemeral(None);
        my_owners.generated_locally = true;
        let (_, class) = self.find_class(MY_OWNERS)?;
        debug!(dest = %conn.name(), owners = owners.len(), "owners announced");
        self.send_on(conn, &my_owners, class, Operation::Sync, AttributeSet::All, None)
    }

    /// A peer asks for what changed since a serial.
    pub(crate) fn i_have(&self, conn: &Arc<Connection>, obj: &SyncObject) -> SyncResult<()> {
        let sender = conn.dest_hash();
        let owner = about_owner(obj)?;
        let (serial, epoch) = serial_and_epoch(obj)?;
        {
            let state = self.state.lock();
            match state.owners.get(&owner) {
                None => return Err(SyncError::BadOwner(format!("IHave for unknown owner {owner}"))),
                Some(record) if record.dest == Some(sender) => {
                    return Err(SyncError::BadOwner(format!(
                        "IHave for owner {owner}, which {} itself provides",
                        conn.name()
                    )))
                }
                Some(_) => {}
            }
        }
        let me = self.me.clone();
        let conn = conn.clone();
        tokio::spawn(async move {
            let Some(inner) = me.upgrade() else {
                return;
            };
            if let Err(e) = inner.answer_i_have(&conn, owner, serial, epoch).await {
                debug!(dest = %conn.name(), owner = %owner, error = %e, "catch-up aborted");
            }
        });
        Ok(())
    }

    async fn answer_i_have(&self, conn: &Arc<Connection>, owner: Uuid, serial: u64, epoch: Epoch) -> SyncResult<()> {
        if conn.is_closed() {
            return Ok(());
        }
        let peer = conn.dest_hash();
        let (destination, first_local) = {
            let peers = self.peers.lock();
            match peers.get(&peer) {
                Some(p) => (p.destination.clone(), p.state.first_local_owner),
                None => return Ok(()),
            }
        };
        let Some(record) = self.state.lock().owners.get(&owner).cloned() else {
            return Ok(());
        };

        let advertised = record.advertised_epoch();
        if epoch != advertised {
            info!(dest = %conn.name(), owner = %owner, theirs = %epoch, ours = %advertised, "epoch mismatch");
            let mut attributes = Map::new();
            attributes.insert("new_epoch".into(), Value::String(advertised.to_wire()));
            let mut wrong = SyncObject::new(WRONG_EPOCH, PrimaryKey::unique(), attributes);
            wrong.owner = OwnerRef::Ephemeral(Some(owner));
            wrong.generated_locally = true;
            let (_, class) = self.find_class(WRONG_EPOCH)?;
            return self.send_on(conn, &wrong, class, Operation::Sync, AttributeSet::All, None);
        }

        let (tombstones, live) = {
            let state = self.state.lock();
            state.store.changes_since(owner, first_local == Some(owner), serial)
        };
        let mut max_sent = 0;
        if serial > 0 {
            for stone in &tombstones {
                let Ok((_, class)) = self.find_class(stone.object.sync_type()) else {
                    error!(object = %stone.object, "tombstone of an unregistered type");
                    continue;
                };
                self.send_on(
                    conn,
                    &stone.object,
                    class,
                    Operation::Delete,
                    key_attributes(class, true),
                    None,
                )?;
                max_sent = max_sent.max(stone.object.sync_serial());
            }
        }
        let mut sent = 0usize;
        for (_, obj) in &live {
            let Ok((registry, class)) = self.find_class(obj.sync_type()) else {
                error!(object = %obj, "stored object of an unregistered type");
                continue;
            };
            if !(destination.should_send(obj)
                && registry.hooks().should_send(obj, &destination)
                && (class.hooks.should_send)(obj, &destination))
            {
                continue;
            }
            self.send_on(conn, obj, class, Operation::Sync, AttributeSet::All, None)?;
            max_sent = max_sent.max(obj.sync_serial());
            sent += 1;
        }
        debug!(
            dest = %conn.name(),
            owner = %owner,
            since = serial,
            objects = sent,
            deletes = if serial > 0 { tombstones.len() } else { 0 },
            "catch-up queued"
        );

        conn.drain().await?;
        {
            let mut peers = self.peers.lock();
            if let Some(p) = peers.get_mut(&peer) {
                if p.is_current(conn) {
                    p.state.received_i_have.insert(owner);
                }
            }
        }

        let max = {
            let mut state = self.state.lock();
            match state.owners.get_mut(&owner) {
                Some(record) if record.is_local() => {
                    record.outgoing_serial = record.outgoing_serial.max(max_sent);
                    max_sent
                }
                Some(record) => record.incoming_serial,
                None => return Ok(()),
            }
        };
        if max > serial {
            let you_have = serial_object(YOU_HAVE, owner, max, advertised);
            let (_, class) = self.find_class(YOU_HAVE)?;
            self.send_on(conn, &you_have, class, Operation::Sync, AttributeSet::All, None)?;
        }
        Ok(())
    }

    /// The peer closer to an owner reports a new high-water mark.
    pub(crate) fn you_have(&self, conn: &Arc<Connection>, obj: &SyncObject) -> SyncResult<()> {
        let sender = conn.dest_hash();
        let owner = about_owner(obj)?;
        let (serial, epoch) = serial_and_epoch(obj)?;
        {
            let mut state = self.state.lock();
            let record = state
                .owners
                .get_mut(&owner)
                .filter(|record| record.dest == Some(sender))
                .ok_or_else(|| {
                    SyncError::BadOwner(format!("YouHave for owner {owner} from {}", conn.name()))
                })?;
            if record.incoming_serial > serial {
                error!(
                    dest = %conn.name(),
                    owner = %owner,
                    ours = record.incoming_serial,
                    theirs = serial,
                    "serial went backwards"
                );
            }
            record.incoming_serial = record.incoming_serial.max(serial);
            record.incoming_epoch = Some(epoch);
        }
        trace!(owner = %owner, serial, "high-water mark updated");

        let scheduled: Vec<DestHash> = {
            let mut peers = self.peers.lock();
            peers
                .iter_mut()
                .filter(|(hash, p)| **hash != sender && p.live_connection().is_some())
                .filter(|(_, p)| p.state.received_i_have.contains(&owner))
                .filter_map(|(hash, p)| p.state.queue_you_have(owner).then_some(*hash))
                .collect()
        };
        for hash in scheduled {
            self.schedule_you_haves(hash);
        }
        Ok(())
    }

    /// Our epoch for a remote owner is stale: forget its objects and start over.
    pub(crate) fn wrong_epoch(&self, conn: &Arc<Connection>, obj: &SyncObject) -> SyncResult<()> {
        let sender = conn.dest_hash();
        let owner = about_owner(obj)?;
        let new_epoch = epoch_attribute(obj.attributes(), "new_epoch")?;
        let removed = {
            let mut state = self.state.lock();
            match state.owners.get(&owner) {
                Some(record) if !record.is_local() && record.dest == Some(sender) => {}
                _ => {
                    return Err(SyncError::BadOwner(format!(
                        "WrongEpoch for owner {owner} from {}",
                        conn.name()
                    )))
                }
            }
            let removed = state.store.clear_owner(owner).len();
            if let Some(record) = state.owners.get_mut(&owner) {
                record.incoming_epoch = Some(new_epoch);
                record.incoming_serial = 0;
            }
            removed
        };
        info!(dest = %conn.name(), owner = %owner, epoch = %new_epoch, removed, "owner restarted; resynchronizing");
        self.send_i_have(conn, owner, 0, new_epoch)
    }

    /// The peer's complete owner list; owners it no longer has are deleted.
    pub(crate) fn my_owners(&self, conn: &Arc<Connection>, obj: &SyncObject) -> SyncResult<()> {
        let sender = conn.dest_hash();
        let ids: Vec<Uuid> = match obj.get("owners") {
            Some(Value::Array(values)) => values
                .iter()
                .map(|value| match value {
                    Value::String(text) => Uuid::parse_str(text)
                        .map_err(|e| SyncError::BadEncoding(format!("owners entry is not a uuid: {e}"))),
                    other => Err(SyncError::BadEncoding(format!("owners entry is not a uuid: {other}"))),
                })
                .collect::<SyncResult<_>>()?,
            _ => return Err(SyncError::BadEncoding("owners must be a list".into())),
        };
        let Some(primary) = ids.first().copied() else {
            return Err(SyncError::BadEncoding("MyOwners must list at least one owner".into()));
        };

        let stale: Vec<OwnerRecord> = {
            let mut state = self.state.lock();
            if state.owners.get(&primary).and_then(|record| record.dest) != Some(sender) {
                return Err(SyncError::Unauthorized(format!(
                    "{} announced owner {primary} as its own",
                    conn.name()
                )));
            }
            let stale: Vec<Uuid> = state
                .owners
                .owned_by(&sender)
                .into_iter()
                .filter(|id| !ids.contains(id))
                .collect();
            stale
                .into_iter()
                .filter_map(|id| {
                    state.store.clear_owner(id);
                    state.owners.remove(&id)
                })
                .collect()
        };
        {
            let mut peers = self.peers.lock();
            if let Some(p) = peers.get_mut(&sender) {
                if p.is_current(conn) {
                    p.state.peer_owners = ids;
                }
            }
        }

        if stale.is_empty() {
            return Ok(());
        }
        let (registry, class) = self.find_class(SYNC_OWNER)?;
        for record in stale {
            info!(dest = %conn.name(), owner = %record.id, "owner gone");
            let obj = owner_object(&record);
            let options = SyncOptions::new(Operation::Delete)
                .excluding(vec![sender])
                .attributes(key_attributes(class, false));
            if let Err(e) = self.synchronize(&obj, registry, class, options) {
                warn!(owner = %record.id, error = %e, "could not flood owner delete");
            }
        }
        Ok(())
    }

    /// Records a local change at `serial` and schedules the YouHaves it makes due.
    pub(crate) fn trigger_you_haves(&self, serial: u64) {
        if serial == 0 {
            return;
        }
        let locals = {
            let mut state = self.state.lock();
            let ids = state.owners.local_ids();
            for id in &ids {
                if let Some(record) = state.owners.get_mut(id) {
                    record.outgoing_serial = record.outgoing_serial.max(serial);
                }
            }
            ids
        };
        let scheduled: Vec<DestHash> = {
            let mut peers = self.peers.lock();
            peers
                .iter_mut()
                .filter(|(_, p)| p.live_connection().is_some())
                .filter_map(|(hash, p)| {
                    let mut schedule = false;
                    for id in &locals {
                        if p.state.received_i_have.contains(id) {
                            schedule |= p.state.queue_you_have(*id);
                        }
                    }
                    schedule.then_some(*hash)
                })
                .collect()
        };
        for hash in scheduled {
            self.schedule_you_haves(hash);
        }
    }

    fn schedule_you_haves(&self, hash: DestHash) {
        let me = self.me.clone();
        let delay = self.config.you_have_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = me.upgrade() {
                inner.send_you_have_batch(hash).await;
            }
        });
    }

    async fn send_you_have_batch(&self, hash: DestHash) {
        let (conn, pending) = {
            let mut peers = self.peers.lock();
            let Some(p) = peers.get_mut(&hash) else {
                return;
            };
            match p.live_connection() {
                Some(conn) => (conn, std::mem::take(&mut p.state.send_you_have)),
                None => {
                    p.state.you_have_task = false;
                    return;
                }
            }
        };
        let you_haves: Vec<SyncObject> = {
            let state = self.state.lock();
            pending
                .iter()
                .filter_map(|id| state.owners.get(id))
                .map(|record| {
                    let serial = if record.is_local() {
                        record.outgoing_serial
                    } else {
                        record.incoming_serial
                    };
                    serial_object(YOU_HAVE, record.id, serial, record.advertised_epoch())
                })
                .collect()
        };

        match conn.drain().await {
            Ok(()) => match self.find_class(YOU_HAVE) {
                Ok((_, class)) => {
                    for obj in &you_haves {
                        if let Err(e) = self.send_on(&conn, obj, class, Operation::Sync, AttributeSet::All, None) {
                            warn!(dest = %conn.name(), error = %e, "could not queue YouHave");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "YouHave class missing"),
            },
            Err(e) => debug!(dest = %conn.name(), error = %e, "YouHave batch dropped"),
        }

        let again = {
            let mut peers = self.peers.lock();
            match peers.get_mut(&hash) {
                Some(p) if p.is_current(&conn) => {
                    p.state.you_have_task = !p.state.send_you_have.is_empty();
                    p.state.you_have_task
                }
                _ => false,
            }
        };
        if again {
            self.schedule_you_haves(hash);
        }
    }

    /// Moves local owners to a new epoch and re-announces them.
    pub(crate) fn force_resync(&self) {
        let owners: Vec<SyncObject> = {
            let mut state = self.state.lock();
            state.owners.ensure_local();
            let ids = state.owners.local_ids();
            ids.iter()
                .filter_map(|id| {
                    let record = state.owners.get_mut(id)?;
                    record.outgoing_epoch = Epoch::after(record.outgoing_epoch);
                    Some(owner_object(record))
                })
                .collect()
        };
        let Ok((registry, class)) = self.find_class(SYNC_OWNER) else {
            return;
        };
        for obj in &owners {
            if let Err(e) = self.synchronize(obj, registry, class, SyncOptions::new(Operation::Sync)) {
                warn!(object = %obj, error = %e, "could not announce new epoch");
            }
        }
        info!(owners = owners.len(), "forced resynchronization");
    }

    /// Deletes a local owner with its objects, here and on every peer.
    pub(crate) fn delete_owner(&self, id: Uuid) -> SyncResult<()> {
        let (record, removed) = {
            let mut state = self.state.lock();
            let record = state
                .owners
                .get(&id)
                .cloned()
                .ok_or_else(|| SyncError::NotFound(format!("owner {id}")))?;
            if !record.is_local() {
                return Err(SyncError::BadOwner(format!("owner {id} is not local")));
            }
            let removed = state.store.clear_owner(id).len();
            state.owners.remove(&id);
            (record, removed)
        };
        info!(owner = %id, removed, "owner deleted");
        let (registry, class) = self.find_class(SYNC_OWNER)?;
        let obj = owner_object(&record);
        self.synchronize(
            &obj,
            registry,
            class,
            SyncOptions::new(Operation::Delete).attributes(key_attributes(class, false)),
        )?;
        Ok(())
    }
}
