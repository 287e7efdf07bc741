//! Receive pipeline.
//!
//! Every decoded message goes through the same steps: decode checks,
//! listen hooks, object construction, authorization, the operation's
//! effect on the store, application hooks and finally the flood rule of
//! [`crate::operations::flood_plan`]. Owner, catch-up and error messages
//! branch off after the listen hooks.

use crate::catchup::{self, I_HAVE};
use crate::connection::Connection;
use crate::error::{SyncError, SyncResult};
use crate::manager::{key_attributes, object_key, ManagerInner, SyncOptions};
use crate::object::{AttributeSet, OwnerRef, PrimaryKey, SyncObject, SERIAL_ATTRIBUTE, TRANSITION_ATTRIBUTE};
use crate::operations::{self, Operation};
use crate::owner::{Epoch, OwnerRecord};
use crate::registry::{ClassDescriptor, ClassKind, PrimaryKeys, ReceiveInfo, Registry};
use crate::response::{Completion, ResponseContext};
use crate::transition::TransitionLookup;
use entanglement_protocol::SyncMessage;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// One message on its way through the pipeline.
pub(crate) struct Incoming<'a> {
    pub conn: &'a Arc<Connection>,
    pub registry: &'a Registry,
    pub class: &'a ClassDescriptor,
    pub msg: &'a SyncMessage,
    pub info: ReceiveInfo,
    /// Owner id named by `_sync_owner`, known or not.
    pub owner_id: Option<Uuid>,
    /// The sender supplied at least one primary key value.
    pub keys_in_message: bool,
}

fn present(msg: &SyncMessage, name: &str) -> bool {
    msg.get(name).map_or(false, |value| !value.is_null())
}

/// Parses a uuid attribute.
pub(crate) fn uuid_attribute(attributes: &Map<String, Value>, name: &str) -> SyncResult<Uuid> {
    match attributes.get(name) {
        Some(Value::String(text)) => Uuid::parse_str(text)
            .map_err(|e| SyncError::BadEncoding(format!("{name} is not a uuid: {e}"))),
        Some(other) => Err(SyncError::BadEncoding(format!("{name} is not a uuid: {other}"))),
        None => Err(SyncError::BadEncoding(format!("{name} is required"))),
    }
}

/// Parses an epoch attribute.
pub(crate) fn epoch_attribute(attributes: &Map<String, Value>, name: &str) -> SyncResult<Epoch> {
    match attributes.get(name) {
        Some(Value::String(text)) => Epoch::from_wire(text),
        _ => Err(SyncError::BadEncoding(format!("{name} must be an epoch string"))),
    }
}

impl ManagerInner {
    /// Entry point for every message a connection decodes.
    pub(crate) fn incoming_message(
        &self,
        conn: &Arc<Connection>,
        msg: SyncMessage,
        response_for: Option<ResponseContext>,
    ) -> SyncResult<()> {
        msg.validate()?;
        let sync_type = msg
            .sync_type()
            .ok_or_else(|| SyncError::BadEncoding("message without _sync_type".into()))?;
        let operation: Operation = msg.operation()?.parse()?;
        let (registry, class) = self.find_class(sync_type)?;
        if !registry.supports(operation) {
            return Err(SyncError::BadOperation(format!(
                "registry {} does not accept {operation}",
                registry.name()
            )));
        }

        let owner_id = msg.owner()?;
        let owner = owner_id.and_then(|id| self.state.lock().owners.get(&id).cloned());
        let info = ReceiveInfo {
            sender: conn.dest_hash(),
            operation,
            registry: registry.name().to_string(),
            owner,
            response_for,
        };
        trace!(dest = %conn.name(), sync_type, %operation, "message received");

        for (name, _) in msg.attributes() {
            if !class.accepts_attribute(name) {
                return Err(SyncError::BadEncoding(format!(
                    "{name} is not an attribute of {sync_type}"
                )));
            }
        }
        let fields = class.primary_keys().fields();
        let keys_in_message = fields.iter().any(|field| present(&msg, field));
        if operation.primary_keys_required() && !fields.iter().all(|field| present(&msg, field)) {
            return Err(SyncError::BadEncoding(format!(
                "{sync_type} {operation} requires primary keys {fields:?}"
            )));
        }

        registry.hooks().should_listen(&msg, &info)?;
        (class.hooks.should_listen)(&msg, &info)?;

        let incoming = Incoming {
            conn,
            registry,
            class,
            msg: &msg,
            info,
            owner_id,
            keys_in_message,
        };
        match class.kind() {
            ClassKind::Meta => self.receive_meta(&incoming),
            ClassKind::Error => self.receive_error(&incoming),
            ClassKind::Owner => self.receive_owner(&incoming),
            ClassKind::Stored | ClassKind::Message => self.receive_object(&incoming),
        }
    }

    fn receive_meta(&self, incoming: &Incoming<'_>) -> SyncResult<()> {
        let Incoming {
            conn,
            registry,
            class,
            msg,
            info,
            owner_id,
            ..
        } = incoming;
        let attributes: Map<String, Value> = msg.attributes().map(|(k, v)| (k.clone(), v.clone())).collect();
        let mut obj = SyncObject::new(class.sync_type(), PrimaryKey::unique(), attributes);
        obj.owner = OwnerRef::Ephemeral(*owner_id);

        registry.hooks().should_listen_constructed(&obj, info)?;
        (class.hooks.should_listen_constructed)(&obj, info)?;
        match class.sync_type() {
            catchup::I_HAVE => self.i_have(conn, &obj),
            catchup::YOU_HAVE => self.you_have(conn, &obj),
            catchup::WRONG_EPOCH => self.wrong_epoch(conn, &obj),
            catchup::MY_OWNERS => self.my_owners(conn, &obj),
            other => Err(SyncError::UnregisteredClass(other.to_string())),
        }
    }

    /// Relays an error toward whoever waits on it and settles local futures.
    fn receive_error(&self, incoming: &Incoming<'_>) -> SyncResult<()> {
        let Incoming {
            conn,
            registry,
            class,
            msg,
            info,
            ..
        } = incoming;
        let attributes: Map<String, Value> = msg.attributes().map(|(k, v)| (k.clone(), v.clone())).collect();
        let error = SyncError::from_wire(class.sync_type(), &attributes);
        let Some(ctx) = &info.response_for else {
            warn!(dest = %conn.name(), error = %error, "error received with no request waiting");
            return Ok(());
        };

        let mut obj = SyncObject::new(class.sync_type(), PrimaryKey::unique(), attributes);
        obj.owner = OwnerRef::Ephemeral(None);
        let steps = operations::flood_plan(
            Operation::Error,
            &obj,
            None,
            info.sender,
            &ctx.forward_destinations(),
        );
        self.flood(&obj, registry, class, steps, &BTreeSet::new(), Some(ctx))?;
        debug!(dest = %conn.name(), error = %error, "error response received");
        ctx.resolve(Err(error));
        Ok(())
    }

    fn receive_owner(&self, incoming: &Incoming<'_>) -> SyncResult<()> {
        let Incoming {
            conn,
            registry,
            class,
            msg,
            info,
            ..
        } = incoming;
        let sender = info.sender;
        let attributes: Map<String, Value> = msg.attributes().map(|(k, v)| (k.clone(), v.clone())).collect();
        let id = uuid_attribute(&attributes, "id")?;

        match info.operation {
            Operation::Sync => {
                let epoch = epoch_attribute(&attributes, "epoch")?;
                let mut obj = SyncObject::new(class.sync_type(), object_key(class, &attributes)?, attributes);
                obj.owner = OwnerRef::Owner(id);
                registry.hooks().should_listen_constructed(&obj, info)?;
                (class.hooks.should_listen_constructed)(&obj, info)?;

                let (existing, serial, advertised) = {
                    let mut state = self.state.lock();
                    let existing = state.owners.get(&id).cloned();
                    operations::authorize(class, &obj, existing.as_ref(), true, info)?;
                    if existing.is_none() {
                        state.owners.insert(OwnerRecord::remote(id, sender, Some(epoch)));
                    }
                    let record = state
                        .owners
                        .get(&id)
                        .ok_or_else(|| SyncError::BadOwner(format!("owner {id} vanished")))?;
                    (existing, record.incoming_serial, record.advertised_epoch())
                };
                if existing.is_none() {
                    info!(dest = %conn.name(), owner = %id, epoch = %epoch, "new owner");
                }
                {
                    let mut peers = self.peers.lock();
                    if let Some(peer) = peers.get_mut(&sender) {
                        if peer.is_current(conn) && !peer.state.peer_owners.contains(&id) {
                            peer.state.peer_owners.push(id);
                        }
                    }
                }

                self.send_i_have(conn, id, serial, advertised)?;
                (class.hooks.incoming)(&obj, info);
                registry.hooks().incoming(&obj, info)?;
                let steps = operations::flood_plan(Operation::Sync, &obj, existing.as_ref(), sender, &[]);
                self.flood(&obj, registry, class, steps, &BTreeSet::new(), None)?;
                registry.hooks().after_flood(&obj, info)
            }
            Operation::Delete => {
                let (record, removed) = {
                    let mut state = self.state.lock();
                    let record = state
                        .owners
                        .get(&id)
                        .cloned()
                        .ok_or_else(|| SyncError::NotFound(format!("owner {id}")))?;
                    if record.dest != Some(sender) {
                        return Err(SyncError::BadOwner(format!(
                            "{} may not delete owner {id}",
                            conn.name()
                        )));
                    }
                    let removed = state.store.clear_owner(id);
                    state.owners.remove(&id);
                    (record, removed.len())
                };
                info!(dest = %conn.name(), owner = %id, removed, "owner deleted");
                let obj = catchup::owner_object(&record);
                self.synchronize(
                    &obj,
                    registry,
                    class,
                    SyncOptions::new(Operation::Delete)
                        .excluding(vec![sender])
                        .attributes(key_attributes(class, false)),
                )?;
                Ok(())
            }
            other => Err(SyncError::BadOperation(format!("owners cannot be sent with {other}"))),
        }
    }

    /// Stored objects and messages.
    fn receive_object(&self, incoming: &Incoming<'_>) -> SyncResult<()> {
        let Incoming {
            registry,
            class,
            msg,
            info,
            owner_id,
            keys_in_message,
            ..
        } = incoming;
        let operation = info.operation;
        let sender = info.sender;
        let bucket = class.bucket();

        let serial = match msg.get(SERIAL_ATTRIBUTE) {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.as_u64().ok_or_else(|| {
                SyncError::BadEncoding(format!("{SERIAL_ATTRIBUTE} must be an unsigned integer"))
            })?),
        };
        let transition_id = match msg.get(TRANSITION_ATTRIBUTE) {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(Uuid::parse_str(text).map_err(|e| {
                SyncError::BadEncoding(format!("{TRANSITION_ATTRIBUTE} is not a uuid: {e}"))
            })?),
            Some(other) => {
                return Err(SyncError::BadEncoding(format!(
                    "{TRANSITION_ATTRIBUTE} is not a uuid: {other}"
                )))
            }
        };
        let attributes: Map<String, Value> = msg
            .attributes()
            .filter(|(name, _)| name.as_str() != SERIAL_ATTRIBUTE && name.as_str() != TRANSITION_ATTRIBUTE)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let key = match class.primary_keys() {
            PrimaryKeys::Fields(fields) if *keys_in_message || operation.primary_keys_required() => {
                PrimaryKey::from_attributes(fields, &attributes)?
            }
            // The owner assigns keys when it creates the object.
            _ => PrimaryKey::unique(),
        };

        let mut continued = None;
        if class.supports_transitions() && matches!(key, PrimaryKey::Values(_)) {
            let lookup = self.transitions.lock().incoming(
                bucket,
                &key,
                transition_id,
                operation == Operation::Transition,
                sender,
                info.response_for.as_ref(),
                &attributes,
            );
            match lookup {
                TransitionLookup::Absent | TransitionLookup::Ended { .. } => {}
                TransitionLookup::Continued(obj) => continued = Some(obj),
                TransitionLookup::Broken(broken) => {
                    debug!(dest = %sender, error = %broken.error, "transition broken by incoming message");
                    self.report_broken(broken);
                }
            }
        }

        let mut obj = if class.is_stored() {
            let owner = owner_id.ok_or_else(|| {
                SyncError::BadEncoding(format!("{} requires _sync_owner", class.sync_type()))
            })?;
            let state = self.state.lock();
            if !state.owners.contains(&owner) {
                return Err(SyncError::BadOwner(format!("unknown owner {owner}")));
            }
            let mut obj = match continued {
                Some(obj) => obj,
                None => state.store.get_or_create(bucket, class.sync_type(), &key, class.defaults()),
            };
            obj.owner = OwnerRef::Owner(owner);
            obj
        } else {
            let mut obj = continued
                .unwrap_or_else(|| SyncObject::new(class.sync_type(), key.clone(), class.defaults().clone()));
            obj.owner = match owner_id {
                Some(id) => OwnerRef::Owner(*id),
                None => OwnerRef::Ephemeral(None),
            };
            obj
        };
        for (name, value) in attributes {
            obj.attributes.insert(name, value);
        }
        (class.hooks.validate)(&obj.attributes)?;
        obj.sync_type = class.sync_type().to_string();
        obj.key = key;
        if let Some(serial) = serial {
            obj.sync_serial = serial;
        }
        obj.transition_id = transition_id;
        obj.generated_locally = false;

        let owner_record = obj
            .owner
            .id()
            .and_then(|id| self.state.lock().owners.get(&id).cloned());
        registry.hooks().should_listen_constructed(&obj, info)?;
        operations::authorize(class, &obj, owner_record.as_ref(), *keys_in_message, info)?;
        (class.hooks.should_listen_constructed)(&obj, info)?;

        let local = operations::is_local(&obj, owner_record.as_ref());
        let new_serial = self.apply(&mut obj, class, owner_record.as_ref(), local, incoming)?;

        (class.hooks.incoming)(&obj, info);
        registry.hooks().incoming(&obj, info)?;

        let received: BTreeSet<String> = msg.attribute_names();
        let steps = operations::flood_plan(operation, &obj, owner_record.as_ref(), sender, &[]);
        self.flood(&obj, registry, class, steps, &received, info.response_for.as_ref())?;
        registry.hooks().after_flood(&obj, info)?;

        if let Some(serial) = new_serial {
            self.trigger_you_haves(serial);
        }
        if let Some(ctx) = &info.response_for {
            ctx.resolve(Ok(Some(obj)));
        }
        Ok(())
    }

    /// Applies the operation to the store. Returns the serial of a local change.
    fn apply(
        &self,
        obj: &mut SyncObject,
        class: &ClassDescriptor,
        owner: Option<&OwnerRecord>,
        local: bool,
        incoming: &Incoming<'_>,
    ) -> SyncResult<Option<u64>> {
        let info = &incoming.info;
        let bucket = class.bucket();
        let stored = class.is_stored();
        match info.operation {
            Operation::Sync => {
                if stored {
                    let mut copy = obj.clone();
                    copy.transition_id = None;
                    self.state.lock().store.add(bucket, copy);
                }
                Ok(None)
            }
            Operation::Forward if local => {
                obj.transition_id = None;
                if !stored {
                    return Ok(None);
                }
                let mut state = self.state.lock();
                if !state.store.contains(bucket, &obj.key) {
                    return Err(SyncError::NotFound(format!("{obj} is not in the store")));
                }
                let serial = state.owners.next_serial();
                obj.sync_serial = serial;
                obj.generated_locally = true;
                state.store.add(bucket, obj.clone());
                Ok(Some(serial))
            }
            Operation::Create if local => {
                if !incoming.keys_in_message {
                    (class.hooks.assign_primary_keys)(&mut obj.attributes);
                    (class.hooks.validate)(&obj.attributes)?;
                }
                obj.key = object_key(class, &obj.attributes)?;
                obj.transition_id = None;
                if !stored {
                    return Ok(None);
                }
                let mut state = self.state.lock();
                if state.store.contains(bucket, &obj.key) {
                    return Err(SyncError::NotFound(format!("{obj} already exists")));
                }
                let serial = state.owners.next_serial();
                obj.sync_serial = serial;
                obj.generated_locally = true;
                state.store.add(bucket, obj.clone());
                Ok(Some(serial))
            }
            Operation::Delete if local => {
                if !stored {
                    return Ok(None);
                }
                let mut state = self.state.lock();
                let Some(existing) = state.store.remove(bucket, &obj.key) else {
                    return Err(SyncError::NotFound(format!("{obj} is not in the store")));
                };
                let serial = state.owners.next_serial();
                state
                    .store
                    .add_tombstone(bucket, &existing, class.primary_keys().fields(), serial);
                obj.sync_serial = serial;
                Ok(Some(serial))
            }
            Operation::Delete => {
                if stored && owner.and_then(|o| o.dest) == Some(info.sender) {
                    let mut state = self.state.lock();
                    state.store.remove(bucket, &obj.key);
                    state
                        .store
                        .add_tombstone(bucket, obj, class.primary_keys().fields(), obj.sync_serial);
                }
                Ok(None)
            }
            Operation::Transition => {
                let transition_id = obj.transition_id.ok_or_else(|| {
                    SyncError::BadEncoding("Objects in transition must have a transition_id".into())
                })?;
                let is_new = {
                    let transitions = self.transitions.lock();
                    transitions
                        .get(bucket, &obj.key)
                        .map_or(true, |record| record.transition_id != transition_id)
                };
                if is_new {
                    if let Some(ctx) = &info.response_for {
                        let (completion, _) = Completion::new();
                        completion.on_complete(self.transition_cleanup(bucket, obj.key.clone(), transition_id));
                        ctx.add_completion(completion);
                    }
                }
                let (broken, _) = self.transitions.lock().store(
                    bucket,
                    obj.clone(),
                    transition_id,
                    Some(info.sender),
                    info.response_for.clone(),
                    None,
                );
                if let Some(broken) = broken {
                    self.report_broken(broken);
                }
                Ok(None)
            }
            // Relayed toward the owner by the flood rule.
            Operation::Forward | Operation::Create | Operation::Error => Ok(None),
        }
    }

    /// Asks the peer for what changed since `serial`.
    pub(crate) fn send_i_have(&self, conn: &Arc<Connection>, owner: Uuid, serial: u64, epoch: Epoch) -> SyncResult<()> {
        let (_, class) = self.find_class(I_HAVE)?;
        let obj = catchup::serial_object(I_HAVE, owner, serial, epoch);
        self.send_on(conn, &obj, class, Operation::Forward, AttributeSet::All, None)
    }
}
