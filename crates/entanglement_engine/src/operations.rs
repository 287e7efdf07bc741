//! Operations and their authorization and flood rules.
//!
//! Every received object goes through the same sequence: the operation
//! vets the constructed object, the engine applies it, and the flood rule
//! decides where it travels next. The rules here are pure; the manager
//! executes the [`FloodStep`]s they return.

use crate::error::{SyncError, SyncResult};
use crate::object::{OwnerRef, SyncObject};
use crate::owner::OwnerRecord;
use crate::registry::{ClassDescriptor, ReceiveInfo};
use entanglement_protocol::DestHash;
use std::fmt;
use std::str::FromStr;

/// A built-in operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    /// Owner-originated state, flooded outward.
    Sync,
    /// A proposed change travelling toward the owner.
    Forward,
    /// A request for the owner to create an object.
    Create,
    /// Removal, flooded outward or forwarded toward the owner.
    Delete,
    /// A transient intermediate state.
    Transition,
    /// An error response travelling back toward the requester.
    Error,
}

impl Operation {
    /// Every built-in operation.
    pub const ALL: [Operation; 6] = [
        Operation::Sync,
        Operation::Forward,
        Operation::Create,
        Operation::Delete,
        Operation::Transition,
        Operation::Error,
    ];

    /// Wire name.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Sync => "sync",
            Operation::Forward => "forward",
            Operation::Create => "create",
            Operation::Delete => "delete",
            Operation::Transition => "transition",
            Operation::Error => "error",
        }
    }

    /// Parses a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    /// Whether incoming messages must carry every primary key.
    pub fn primary_keys_required(&self) -> bool {
        !matches!(self, Operation::Create)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operation {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| SyncError::BadOperation(format!("unknown operation {s}")))
    }
}

/// True if this endpoint is authoritative for the object.
///
/// Objects without an owner count as local.
pub(crate) fn is_local(obj: &SyncObject, owner: Option<&OwnerRecord>) -> bool {
    match obj.owner {
        OwnerRef::Unowned => true,
        OwnerRef::Ephemeral(_) => false,
        OwnerRef::Owner(_) => owner.map_or(false, OwnerRecord::is_local),
    }
}

/// Operation-specific check of a constructed object.
///
/// `owner` is the record of the object's owner and `keys_in_message`
/// tells whether the sender supplied primary key values.
pub(crate) fn authorize(
    class: &ClassDescriptor,
    obj: &SyncObject,
    owner: Option<&OwnerRecord>,
    keys_in_message: bool,
    info: &ReceiveInfo,
) -> SyncResult<()> {
    let sender = info.sender;
    match info.operation {
        Operation::Sync => {
            if obj.owner.is_ephemeral() {
                return Ok(());
            }
            if is_local(obj, owner) {
                return Err(SyncError::BadOwner(format!(
                    "{sender} synchronized one of our objects to us: {obj}"
                )));
            }
            if let Some(record) = owner {
                if record.dest != Some(sender) {
                    return Err(SyncError::BadOwner(format!(
                        "{sender} sent {obj} belonging to another destination"
                    )));
                }
            }
            if let Some(context) = &info.owner {
                if context.dest != Some(sender) {
                    return Err(SyncError::BadOwner(format!(
                        "{sender} sent an object with owner {} it does not own",
                        context.id
                    )));
                }
            }
            Ok(())
        }
        Operation::Forward => {
            if obj.owner.is_ephemeral() {
                return Err(SyncError::BadOwner(format!("{obj} is ephemeral and cannot be forwarded")));
            }
            if !is_local(obj, owner) && owner.and_then(|o| o.dest) == Some(sender) {
                return Err(SyncError::BadOwner(format!(
                    "{sender} forwarded {obj} which we think they own"
                )));
            }
            Ok(())
        }
        Operation::Delete => {
            if obj.owner.is_ephemeral() {
                return Err(SyncError::BadOwner(format!("{obj} is ephemeral and cannot be deleted")));
            }
            Ok(())
        }
        Operation::Create => {
            if keys_in_message && (class.hooks.should_listen_primary_keys)(obj, info) != Some(true) {
                return Err(SyncError::Unauthorized(format!(
                    "create of {} set primary keys",
                    class.sync_type()
                )));
            }
            let context = info
                .owner
                .as_ref()
                .ok_or_else(|| SyncError::BadEncoding("create requires _sync_owner".into()))?;
            if context.dest == Some(sender) {
                return Err(SyncError::WrongDestination("create loop detected".into()));
            }
            Ok(())
        }
        Operation::Transition => {
            if !class.supports_transitions() {
                return Err(SyncError::BadOperation(format!(
                    "{} does not support transitions",
                    class.sync_type()
                )));
            }
            Ok(())
        }
        Operation::Error => Ok(()),
    }
}

/// Which destinations a flood step addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Targets {
    /// Every connected destination.
    Everyone,
    /// One destination, connected or not.
    Only(DestHash),
}

/// Which attributes a flood step transmits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FloodAttributes {
    /// Every attribute.
    All,
    /// The attributes present in the received message.
    Received,
    /// Primary keys only.
    Keys,
    /// Primary keys and `sync_serial`.
    KeysAndSerial,
}

/// One `synchronize` call made on behalf of a received object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FloodStep {
    pub targets: Targets,
    pub exclude: Vec<DestHash>,
    pub operation: Operation,
    pub attributes: FloodAttributes,
    /// Carry the incoming response context.
    pub keep_response: bool,
}

impl FloodStep {
    fn new(targets: Targets, operation: Operation) -> Self {
        Self {
            targets,
            exclude: Vec::new(),
            operation,
            attributes: FloodAttributes::All,
            keep_response: true,
        }
    }

    fn excluding(mut self, dests: &[DestHash]) -> Self {
        self.exclude.extend_from_slice(dests);
        self
    }

    fn with_attributes(mut self, attributes: FloodAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    fn without_response(mut self) -> Self {
        self.keep_response = false;
        self
    }
}

/// Where a received object travels next.
///
/// `owner` is the record of the object's owner as it was before the
/// object was applied; `response_dests` are the peers waiting on the
/// message's response context.
pub(crate) fn flood_plan(
    operation: Operation,
    obj: &SyncObject,
    owner: Option<&OwnerRecord>,
    sender: DestHash,
    response_dests: &[DestHash],
) -> Vec<FloodStep> {
    let local = is_local(obj, owner);
    let owner_dest = owner.and_then(|o| o.dest);
    match operation {
        Operation::Sync => {
            if obj.owner.is_ephemeral() {
                return Vec::new();
            }
            vec![FloodStep::new(Targets::Everyone, Operation::Sync).excluding(&[sender])]
        }
        Operation::Forward => match (local, owner_dest) {
            (true, _) => vec![FloodStep::new(Targets::Everyone, Operation::Sync)],
            (false, Some(dest)) => vec![FloodStep::new(Targets::Only(dest), Operation::Forward)
                .with_attributes(FloodAttributes::Received)],
            (false, None) => Vec::new(),
        },
        Operation::Delete => match (local, owner_dest) {
            (true, _) => vec![FloodStep::new(Targets::Everyone, Operation::Delete)
                .with_attributes(FloodAttributes::KeysAndSerial)],
            (false, Some(dest)) if dest == sender => {
                vec![FloodStep::new(Targets::Everyone, Operation::Delete)
                    .excluding(&[sender])
                    .with_attributes(FloodAttributes::KeysAndSerial)]
            }
            (false, Some(dest)) => vec![FloodStep::new(Targets::Only(dest), Operation::Delete)
                .with_attributes(FloodAttributes::Keys)],
            (false, None) => Vec::new(),
        },
        Operation::Create => match (local, owner_dest) {
            (true, _) => vec![FloodStep::new(Targets::Everyone, Operation::Sync)],
            (false, Some(dest)) => vec![FloodStep::new(Targets::Only(dest), Operation::Create)
                .with_attributes(FloodAttributes::Received)],
            (false, None) => Vec::new(),
        },
        Operation::Transition => {
            let mut steps = Vec::new();
            let mut exclude = vec![sender];
            if let (false, Some(dest)) = (local, owner_dest) {
                steps.push(
                    FloodStep::new(Targets::Only(dest), Operation::Transition)
                        .excluding(&exclude)
                        .with_attributes(FloodAttributes::Received),
                );
                exclude.push(dest);
            }
            steps.push(
                FloodStep::new(Targets::Everyone, Operation::Transition)
                    .excluding(&exclude)
                    .with_attributes(FloodAttributes::Received)
                    .without_response(),
            );
            steps
        }
        Operation::Error => response_dests
            .iter()
            .map(|dest| FloodStep::new(Targets::Only(*dest), Operation::Error))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::PrimaryKey;
    use crate::owner::Epoch;
    use crate::registry::{ClassKind, PrimaryKeys};
    use serde_json::Map;
    use uuid::Uuid;

    fn peer(name: &str) -> DestHash {
        DestHash::from_string(name)
    }

    fn owned(record: &OwnerRecord) -> SyncObject {
        let mut obj = SyncObject::new("Widget", PrimaryKey::Values("[1]".into()), Map::new());
        obj.owner = OwnerRef::Owner(record.id);
        obj
    }

    fn info(operation: Operation, sender: DestHash, owner: Option<OwnerRecord>) -> ReceiveInfo {
        ReceiveInfo {
            sender,
            operation,
            registry: "app".into(),
            owner,
            response_for: None,
        }
    }

    fn widget_class(transitions: bool) -> ClassDescriptor {
        let mut class = ClassDescriptor::internal(
            "Widget",
            ClassKind::Stored,
            PrimaryKeys::Fields(&["id"]),
            &["id", "name"],
            100,
        );
        class.set_transitions(transitions);
        class
    }

    fn remote(dest: &str) -> OwnerRecord {
        OwnerRecord::remote(Uuid::new_v4(), peer(dest), Some(Epoch::now()))
    }

    #[test]
    fn names_parse_back() {
        for op in Operation::ALL {
            assert_eq!(Operation::from_name(op.name()), Some(op));
            assert_eq!(op.name().parse::<Operation>().unwrap(), op);
        }
        assert!(Operation::from_name("merge").is_none());
        assert!(!Operation::Create.primary_keys_required());
        assert!(Operation::Delete.primary_keys_required());
    }

    #[test]
    fn sync_requires_owner_at_sender() {
        let class = widget_class(false);
        let owner = remote("x");
        let obj = owned(&owner);

        let from_owner = info(Operation::Sync, peer("x"), Some(owner.clone()));
        assert!(authorize(&class, &obj, Some(&owner), true, &from_owner).is_ok());

        let from_other = info(Operation::Sync, peer("y"), Some(owner.clone()));
        assert!(matches!(
            authorize(&class, &obj, Some(&owner), true, &from_other),
            Err(SyncError::BadOwner(_))
        ));

        let local = OwnerRecord::local();
        let ours = owned(&local);
        let echo = info(Operation::Sync, peer("x"), Some(local.clone()));
        assert!(matches!(
            authorize(&class, &ours, Some(&local), true, &echo),
            Err(SyncError::BadOwner(_))
        ));
    }

    #[test]
    fn ephemeral_sync_passes_but_cannot_forward() {
        let class = widget_class(false);
        let mut obj = SyncObject::new("Widget", PrimaryKey::unique(), Map::new());
        obj.owner = OwnerRef::Ephemeral(None);
        assert!(authorize(&class, &obj, None, true, &info(Operation::Sync, peer("x"), None)).is_ok());
        assert!(authorize(&class, &obj, None, true, &info(Operation::Forward, peer("x"), None)).is_err());
        assert!(authorize(&class, &obj, None, true, &info(Operation::Delete, peer("x"), None)).is_err());
        assert!(flood_plan(Operation::Sync, &obj, None, peer("x"), &[]).is_empty());
    }

    #[test]
    fn forward_must_travel_toward_owner() {
        let class = widget_class(false);
        let owner = remote("x");
        let obj = owned(&owner);
        let backwards = info(Operation::Forward, peer("x"), Some(owner.clone()));
        assert!(authorize(&class, &obj, Some(&owner), true, &backwards).is_err());

        let onward = info(Operation::Forward, peer("y"), Some(owner.clone()));
        assert!(authorize(&class, &obj, Some(&owner), true, &onward).is_ok());

        let plan = flood_plan(Operation::Forward, &obj, Some(&owner), peer("y"), &[]);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].targets, Targets::Only(peer("x")));
        assert_eq!(plan[0].operation, Operation::Forward);
        assert_eq!(plan[0].attributes, FloodAttributes::Received);
    }

    #[test]
    fn forward_at_owner_becomes_sync() {
        let owner = OwnerRecord::local();
        let obj = owned(&owner);
        let plan = flood_plan(Operation::Forward, &obj, Some(&owner), peer("y"), &[]);
        assert_eq!(plan[0].targets, Targets::Everyone);
        assert_eq!(plan[0].operation, Operation::Sync);
        assert!(plan[0].exclude.is_empty());
    }

    #[test]
    fn create_rules() {
        let class = widget_class(false);
        let owner = remote("x");
        let obj = owned(&owner);

        let loop_back = info(Operation::Create, peer("x"), Some(owner.clone()));
        assert!(matches!(
            authorize(&class, &obj, Some(&owner), false, &loop_back),
            Err(SyncError::WrongDestination(_))
        ));

        let no_owner = info(Operation::Create, peer("y"), None);
        assert!(matches!(
            authorize(&class, &obj, Some(&owner), false, &no_owner),
            Err(SyncError::BadEncoding(_))
        ));

        // Keys chosen by the sender need the class to opt in
        let with_keys = info(Operation::Create, peer("y"), Some(owner.clone()));
        assert!(matches!(
            authorize(&class, &obj, Some(&owner), true, &with_keys),
            Err(SyncError::Unauthorized(_))
        ));
        assert!(authorize(&class, &obj, Some(&owner), false, &with_keys).is_ok());
    }

    #[test]
    fn delete_flood_depends_on_direction() {
        let owner = remote("x");
        let obj = owned(&owner);

        let from_owner = flood_plan(Operation::Delete, &obj, Some(&owner), peer("x"), &[]);
        assert_eq!(from_owner[0].targets, Targets::Everyone);
        assert_eq!(from_owner[0].exclude, vec![peer("x")]);
        assert_eq!(from_owner[0].attributes, FloodAttributes::KeysAndSerial);

        let toward_owner = flood_plan(Operation::Delete, &obj, Some(&owner), peer("y"), &[]);
        assert_eq!(toward_owner[0].targets, Targets::Only(peer("x")));
        assert_eq!(toward_owner[0].attributes, FloodAttributes::Keys);
    }

    #[test]
    fn transition_needs_capability() {
        let owner = remote("x");
        let obj = owned(&owner);
        let incoming = info(Operation::Transition, peer("y"), Some(owner.clone()));
        assert!(matches!(
            authorize(&widget_class(false), &obj, Some(&owner), true, &incoming),
            Err(SyncError::BadOperation(_))
        ));
        assert!(authorize(&widget_class(true), &obj, Some(&owner), true, &incoming).is_ok());
    }

    #[test]
    fn transition_keeps_response_only_toward_owner() {
        let owner = remote("x");
        let obj = owned(&owner);
        let plan = flood_plan(Operation::Transition, &obj, Some(&owner), peer("y"), &[]);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].targets, Targets::Only(peer("x")));
        assert!(plan[0].keep_response);
        assert_eq!(plan[1].targets, Targets::Everyone);
        assert_eq!(plan[1].exclude, vec![peer("y"), peer("x")]);
        assert!(!plan[1].keep_response);
    }

    #[test]
    fn errors_flow_back_to_waiting_peers() {
        let mut obj = SyncObject::new("BadOwner", PrimaryKey::unique(), Map::new());
        obj.owner = OwnerRef::Ephemeral(None);
        let plan = flood_plan(Operation::Error, &obj, None, peer("x"), &[peer("a"), peer("b")]);
        let targets: Vec<_> = plan.iter().map(|s| s.targets.clone()).collect();
        assert_eq!(targets, vec![Targets::Only(peer("a")), Targets::Only(peer("b"))]);
    }
}
