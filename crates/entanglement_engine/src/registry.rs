//! Registries of synchronized classes.
//!
//! Application types implement [`Syncable`] and are collected into a
//! [`Registry`]. Each registered type becomes a [`ClassDescriptor`] holding
//! its attribute list and plain function pointers to its hooks, so the
//! engine can work with type-erased [`SyncObject`]s.

use crate::destination::Destination;
use crate::error::{SyncError, SyncResult};
use crate::object::{SyncObject, SERIAL_ATTRIBUTE, TRANSITION_ATTRIBUTE};
use crate::operations::Operation;
use crate::owner::OwnerRecord;
use crate::response::ResponseContext;
use entanglement_protocol::{DestHash, SyncMessage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Send priority of application classes unless they override it.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Send priority of error responses.
pub const ERROR_PRIORITY: i32 = 1;

/// Send priority of owners, which must arrive before their objects.
pub const OWNER_PRIORITY: i32 = 2;

/// Send priority of catch-up messages.
pub const META_PRIORITY: i32 = 50;

/// How instances of a class are identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryKeys {
    /// These attributes identify the object.
    Fields(&'static [&'static str]),
    /// Every instance is distinct and never coalesces.
    Unique,
}

impl PrimaryKeys {
    /// The key attribute names; empty for `Unique`.
    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            Self::Fields(fields) => fields,
            Self::Unique => &[],
        }
    }
}

/// What the engine receives about one incoming message.
#[derive(Debug, Clone)]
pub struct ReceiveInfo {
    /// Peer the message came from.
    pub sender: DestHash,
    /// Operation requested.
    pub operation: Operation,
    /// Name of the registry the class was found in.
    pub registry: String,
    /// Owner named by `_sync_owner`, if known.
    pub owner: Option<OwnerRecord>,
    /// Response context of the message.
    pub response_for: Option<ResponseContext>,
}

/// A replicated application type.
///
/// The synchronized attributes are the fields of `Self::default()` as
/// serialized by serde. Hooks run on the receiving endpoint and default to
/// accepting everything.
///
/// ```ignore
/// #[derive(Serialize, Deserialize, Default, Clone)]
/// struct Widget { id: u32, name: String }
///
/// impl Syncable for Widget {
///     const SYNC_TYPE: &'static str = "Widget";
///     const PRIMARY_KEYS: PrimaryKeys = PrimaryKeys::Fields(&["id"]);
/// }
/// ```
pub trait Syncable: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static {
    /// Registered type name, carried as `_sync_type`.
    const SYNC_TYPE: &'static str;

    /// Identifying attributes.
    const PRIMARY_KEYS: PrimaryKeys;

    /// Send order; lower goes first.
    const PRIORITY: i32 = DEFAULT_PRIORITY;

    /// Share the store bucket of another type name.
    const STORE_WITH: Option<&'static str> = None;

    /// Whether instances may be sent with the `transition` operation.
    const TRANSITIONS: bool = false;

    /// Whether received instances are kept in the object store.
    const STORED: bool = true;

    /// Vets a raw message before anything is constructed.
    fn should_listen(_msg: &SyncMessage, _info: &ReceiveInfo) -> SyncResult<()> {
        Ok(())
    }

    /// Vets the constructed object before it is applied.
    fn should_listen_constructed(_obj: &SyncObject, _info: &ReceiveInfo) -> SyncResult<()> {
        Ok(())
    }

    /// Decides whether an object goes to a destination.
    fn should_send(_obj: &SyncObject, _dest: &Destination) -> bool {
        true
    }

    /// Decides whether a `create` may choose its own primary keys.
    ///
    /// `None` means the class never accepts sender-chosen keys.
    fn should_listen_primary_keys(_obj: &SyncObject, _info: &ReceiveInfo) -> Option<bool> {
        None
    }

    /// Chooses primary keys for an object created at the owner.
    fn assign_primary_keys(_attributes: &mut Map<String, Value>) {}

    /// Attributes sent by `perform_transition`; `None` sends all of them.
    fn transition_modified_attrs(_obj: &SyncObject) -> Option<Vec<String>> {
        None
    }

    /// Called after the object has been applied locally.
    fn incoming(_obj: &SyncObject, _info: &ReceiveInfo) {}
}

/// Raw-message check.
pub type ListenHook = fn(&SyncMessage, &ReceiveInfo) -> SyncResult<()>;
/// Constructed-object check.
pub type ConstructedHook = fn(&SyncObject, &ReceiveInfo) -> SyncResult<()>;
/// Per-destination send filter.
pub type SendHook = fn(&SyncObject, &Destination) -> bool;
/// Sender-chosen primary key check.
pub type PrimaryKeysHook = fn(&SyncObject, &ReceiveInfo) -> Option<bool>;
/// Owner-side key assignment.
pub type AssignKeysHook = fn(&mut Map<String, Value>);
/// Transition attribute selection.
pub type ModifiedAttrsHook = fn(&SyncObject) -> Option<Vec<String>>;
/// Post-apply notification.
pub type IncomingHook = fn(&SyncObject, &ReceiveInfo);
/// Full decode check.
pub type ValidateHook = fn(&Map<String, Value>) -> SyncResult<()>;

#[derive(Clone, Copy)]
pub(crate) struct ClassHooks {
    pub should_listen: ListenHook,
    pub should_listen_constructed: ConstructedHook,
    pub should_send: SendHook,
    pub should_listen_primary_keys: PrimaryKeysHook,
    pub assign_primary_keys: AssignKeysHook,
    pub transition_modified_attrs: ModifiedAttrsHook,
    pub incoming: IncomingHook,
    pub validate: ValidateHook,
}

impl ClassHooks {
    fn of<T: Syncable>() -> Self {
        Self {
            should_listen: T::should_listen,
            should_listen_constructed: T::should_listen_constructed,
            should_send: T::should_send,
            should_listen_primary_keys: T::should_listen_primary_keys,
            assign_primary_keys: T::assign_primary_keys,
            transition_modified_attrs: T::transition_modified_attrs,
            incoming: T::incoming,
            validate: validate_as::<T>,
        }
    }

    fn permissive() -> Self {
        Self {
            should_listen: accept_message,
            should_listen_constructed: accept_object,
            should_send: send_anywhere,
            should_listen_primary_keys: no_primary_keys,
            assign_primary_keys: keep_keys,
            transition_modified_attrs: all_attrs,
            incoming: ignore_incoming,
            validate: accept_attributes,
        }
    }
}

fn accept_message(_: &SyncMessage, _: &ReceiveInfo) -> SyncResult<()> {
    Ok(())
}

fn accept_object(_: &SyncObject, _: &ReceiveInfo) -> SyncResult<()> {
    Ok(())
}

fn send_anywhere(_: &SyncObject, _: &Destination) -> bool {
    true
}

fn no_primary_keys(_: &SyncObject, _: &ReceiveInfo) -> Option<bool> {
    None
}

fn keep_keys(_: &mut Map<String, Value>) {}

fn all_attrs(_: &SyncObject) -> Option<Vec<String>> {
    None
}

fn ignore_incoming(_: &SyncObject, _: &ReceiveInfo) {}

fn accept_attributes(_: &Map<String, Value>) -> SyncResult<()> {
    Ok(())
}

fn validate_as<T: Syncable>(attributes: &Map<String, Value>) -> SyncResult<()> {
    serde_json::from_value::<T>(Value::Object(attributes.clone()))
        .map(drop)
        .map_err(|e| SyncError::BadEncoding(format!("{}: {e}", T::SYNC_TYPE)))
}

/// Role of a class inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    /// Owned objects kept in the store.
    Stored,
    /// Objects delivered to hooks but never stored.
    Message,
    /// The owner records themselves.
    Owner,
    /// Catch-up handshake messages.
    Meta,
    /// Error responses.
    Error,
}

/// Everything the engine knows about one registered type.
pub struct ClassDescriptor {
    sync_type: &'static str,
    primary_keys: PrimaryKeys,
    attributes: BTreeSet<String>,
    defaults: Map<String, Value>,
    priority: i32,
    bucket: &'static str,
    kind: ClassKind,
    transitions: bool,
    pub(crate) hooks: ClassHooks,
}

impl ClassDescriptor {
    /// Derives the descriptor of an application type.
    ///
    /// Fails if the type does not serialize to a JSON object or if a
    /// primary key is not one of its fields.
    pub fn of<T: Syncable>() -> SyncResult<Self> {
        let defaults = match serde_json::to_value(T::default()) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(SyncError::BadEncoding(format!(
                    "{} must serialize to an object, not {other}",
                    T::SYNC_TYPE
                )))
            }
            Err(e) => return Err(SyncError::BadEncoding(format!("{}: {e}", T::SYNC_TYPE))),
        };
        for key in T::PRIMARY_KEYS.fields() {
            if !defaults.contains_key(*key) {
                return Err(SyncError::BadEncoding(format!(
                    "{} primary key {key} is not an attribute",
                    T::SYNC_TYPE
                )));
            }
        }
        Ok(Self {
            sync_type: T::SYNC_TYPE,
            primary_keys: T::PRIMARY_KEYS,
            attributes: defaults.keys().cloned().collect(),
            defaults,
            priority: T::PRIORITY,
            bucket: T::STORE_WITH.unwrap_or(T::SYNC_TYPE),
            kind: if T::STORED {
                ClassKind::Stored
            } else {
                ClassKind::Message
            },
            transitions: T::TRANSITIONS,
            hooks: ClassHooks::of::<T>(),
        })
    }

    /// Descriptor for an engine-internal class.
    pub(crate) fn internal(
        sync_type: &'static str,
        kind: ClassKind,
        primary_keys: PrimaryKeys,
        attributes: &[&str],
        priority: i32,
    ) -> Self {
        Self {
            sync_type,
            primary_keys,
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
            defaults: Map::new(),
            priority,
            bucket: sync_type,
            kind,
            transitions: false,
            hooks: ClassHooks::permissive(),
        }
    }

    pub(crate) fn with_should_send(mut self, hook: SendHook) -> Self {
        self.hooks.should_send = hook;
        self
    }

    #[cfg(test)]
    pub(crate) fn set_transitions(&mut self, transitions: bool) {
        self.transitions = transitions;
    }

    /// Registered type name.
    pub fn sync_type(&self) -> &'static str {
        self.sync_type
    }

    /// Identifying attributes.
    pub fn primary_keys(&self) -> PrimaryKeys {
        self.primary_keys
    }

    /// Synchronized attributes, excluding envelope attributes.
    pub fn attributes(&self) -> &BTreeSet<String> {
        &self.attributes
    }

    /// Attribute values of a freshly constructed instance.
    pub fn defaults(&self) -> &Map<String, Value> {
        &self.defaults
    }

    /// Send priority.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Store bucket shared with other classes declaring the same base.
    pub fn bucket(&self) -> &'static str {
        self.bucket
    }

    /// Engine role.
    pub fn kind(&self) -> ClassKind {
        self.kind
    }

    /// True if `transition` is accepted.
    pub fn supports_transitions(&self) -> bool {
        self.transitions
    }

    /// True if instances carry `sync_serial`.
    pub fn is_stored(&self) -> bool {
        self.kind == ClassKind::Stored
    }

    /// Returns true if the name may appear in an incoming message.
    pub fn accepts_attribute(&self, name: &str) -> bool {
        self.attributes.contains(name)
            || (self.is_stored() && name == SERIAL_ATTRIBUTE)
            || (self.transitions && name == TRANSITION_ATTRIBUTE)
    }
}

impl fmt::Debug for ClassDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDescriptor")
            .field("sync_type", &self.sync_type)
            .field("primary_keys", &self.primary_keys)
            .field("kind", &self.kind)
            .field("bucket", &self.bucket)
            .finish()
    }
}

/// Registry-wide hooks. Every method defaults to accepting.
pub trait RegistryHooks: Send + Sync {
    /// Vets a raw message for any class of the registry.
    fn should_listen(&self, _msg: &SyncMessage, _info: &ReceiveInfo) -> SyncResult<()> {
        Ok(())
    }

    /// Vets a constructed object.
    fn should_listen_constructed(&self, _obj: &SyncObject, _info: &ReceiveInfo) -> SyncResult<()> {
        Ok(())
    }

    /// Decides whether an object goes to a destination.
    fn should_send(&self, _obj: &SyncObject, _dest: &Destination) -> bool {
        true
    }

    /// Runs after the object has been applied and before it is flooded.
    fn incoming(&self, _obj: &SyncObject, _info: &ReceiveInfo) -> SyncResult<()> {
        Ok(())
    }

    /// Runs after the flood rule.
    fn after_flood(&self, _obj: &SyncObject, _info: &ReceiveInfo) -> SyncResult<()> {
        Ok(())
    }
}

struct AcceptAll;

impl RegistryHooks for AcceptAll {}

/// A named set of classes and the operations they accept.
pub struct Registry {
    name: String,
    classes: HashMap<&'static str, Arc<ClassDescriptor>>,
    operations: BTreeSet<Operation>,
    hooks: Arc<dyn RegistryHooks>,
}

impl Registry {
    /// Creates an empty registry accepting every built-in operation.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            classes: HashMap::new(),
            operations: Operation::ALL.into_iter().collect(),
            hooks: Arc::new(AcceptAll),
        }
    }

    /// Restricts the accepted operations. `error` is always accepted.
    pub fn with_operations(mut self, operations: &[Operation]) -> Self {
        self.operations = operations.iter().copied().collect();
        self.operations.insert(Operation::Error);
        self
    }

    /// Installs registry-wide hooks.
    pub fn with_hooks(mut self, hooks: impl RegistryHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Registers an application type.
    pub fn register<T: Syncable>(&mut self) -> SyncResult<()> {
        self.insert(ClassDescriptor::of::<T>()?);
        Ok(())
    }

    /// Builder form of [`Registry::register`].
    pub fn with_class<T: Syncable>(mut self) -> SyncResult<Self> {
        self.register::<T>()?;
        Ok(self)
    }

    pub(crate) fn insert(&mut self, descriptor: ClassDescriptor) {
        self.classes
            .insert(descriptor.sync_type, Arc::new(descriptor));
    }

    /// Registry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up a class by type name.
    pub fn class(&self, sync_type: &str) -> Option<&Arc<ClassDescriptor>> {
        self.classes.get(sync_type)
    }

    /// Iterates over the registered classes.
    pub fn classes(&self) -> impl Iterator<Item = &Arc<ClassDescriptor>> {
        self.classes.values()
    }

    /// Returns true if the operation is accepted.
    pub fn supports(&self, operation: Operation) -> bool {
        self.operations.contains(&operation)
    }

    pub(crate) fn hooks(&self) -> &dyn RegistryHooks {
        self.hooks.as_ref()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut classes: Vec<_> = self.classes.keys().collect();
        classes.sort();
        f.debug_struct("Registry")
            .field("name", &self.name)
            .field("classes", &classes)
            .field("operations", &self.operations)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Gadget {
        id: u32,
        label: String,
    }

    impl Syncable for Gadget {
        const SYNC_TYPE: &'static str = "Gadget";
        const PRIMARY_KEYS: PrimaryKeys = PrimaryKeys::Fields(&["id"]);
        const TRANSITIONS: bool = true;
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct SpecialGadget {
        id: u32,
        label: String,
        extra: bool,
    }

    impl Syncable for SpecialGadget {
        const SYNC_TYPE: &'static str = "SpecialGadget";
        const PRIMARY_KEYS: PrimaryKeys = PrimaryKeys::Fields(&["id"]);
        const STORE_WITH: Option<&'static str> = Some("Gadget");
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Broken {
        name: String,
    }

    impl Syncable for Broken {
        const SYNC_TYPE: &'static str = "Broken";
        const PRIMARY_KEYS: PrimaryKeys = PrimaryKeys::Fields(&["id"]);
    }

    #[test]
    fn descriptor_collects_fields() {
        let desc = ClassDescriptor::of::<Gadget>().unwrap();
        assert_eq!(desc.sync_type(), "Gadget");
        assert_eq!(desc.priority(), DEFAULT_PRIORITY);
        assert_eq!(desc.bucket(), "Gadget");
        assert!(desc.is_stored());
        assert!(desc.accepts_attribute("label"));
        assert!(desc.accepts_attribute("sync_serial"));
        assert!(desc.accepts_attribute("transition_id"));
        assert!(!desc.accepts_attribute("colour"));
        assert_eq!(desc.defaults()["label"], json!(""));
    }

    #[test]
    fn store_with_shares_bucket() {
        let desc = ClassDescriptor::of::<SpecialGadget>().unwrap();
        assert_eq!(desc.bucket(), "Gadget");
        assert!(!desc.accepts_attribute("transition_id"));
    }

    #[test]
    fn primary_key_must_be_a_field() {
        assert!(matches!(
            ClassDescriptor::of::<Broken>(),
            Err(SyncError::BadEncoding(_))
        ));
    }

    #[test]
    fn validate_rejects_wrong_types() {
        let desc = ClassDescriptor::of::<Gadget>().unwrap();
        let good = json!({"id": 1, "label": "a"}).as_object().cloned().unwrap();
        let bad = json!({"id": "one", "label": "a"}).as_object().cloned().unwrap();
        assert!((desc.hooks.validate)(&good).is_ok());
        assert!((desc.hooks.validate)(&bad).is_err());
    }

    #[test]
    fn registry_operations() {
        let registry = Registry::new("app")
            .with_operations(&[Operation::Sync])
            .with_class::<Gadget>()
            .unwrap();
        assert!(registry.supports(Operation::Sync));
        assert!(registry.supports(Operation::Error));
        assert!(!registry.supports(Operation::Forward));
        assert!(registry.class("Gadget").is_some());
        assert!(registry.class("Widget").is_none());
    }
}
