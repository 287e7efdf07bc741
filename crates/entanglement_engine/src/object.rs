//! Type-erased synchronized objects.
//!
//! The store, dirty queues and transition table hold [`SyncObject`]
//! envelopes. Application code works with typed values through
//! [`SyncObject::decode`] and the manager's typed accessors.

use crate::error::{SyncError, SyncResult};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Attribute carrying the owner serial of stored objects.
pub const SERIAL_ATTRIBUTE: &str = "sync_serial";

/// Attribute carrying the transition id of transition-capable objects.
pub const TRANSITION_ATTRIBUTE: &str = "transition_id";

/// Identity of an object within its bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PrimaryKey {
    /// Canonical JSON array of the primary key values.
    Values(String),
    /// Objects of `Unique` classes never coalesce with each other.
    Unique(Uuid),
}

impl PrimaryKey {
    /// Builds the canonical key from the named attributes.
    ///
    /// Fails with `BadEncoding` if any key attribute is missing or null.
    pub fn from_attributes(fields: &[&str], attributes: &Map<String, Value>) -> SyncResult<Self> {
        let mut values = Vec::with_capacity(fields.len());
        for field in fields {
            match attributes.get(*field) {
                None | Some(Value::Null) => {
                    return Err(SyncError::BadEncoding(format!(
                        "primary key {field} is required"
                    )))
                }
                Some(value) => values.push(value.clone()),
            }
        }
        Ok(Self::Values(Value::Array(values).to_string()))
    }

    /// Builds the canonical key from values given in primary key order.
    pub fn from_values(values: &[Value]) -> Self {
        Self::Values(Value::Array(values.to_vec()).to_string())
    }

    /// A fresh identity for a `Unique` object.
    pub fn unique() -> Self {
        Self::Unique(Uuid::new_v4())
    }

    /// Decodes the key values back into a JSON array, if keyed by value.
    pub fn values(&self) -> Option<Vec<Value>> {
        match self {
            Self::Values(text) => match serde_json::from_str(text) {
                Ok(Value::Array(values)) => Some(values),
                _ => None,
            },
            Self::Unique(_) => None,
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Values(text) => f.write_str(text),
            Self::Unique(id) => write!(f, "unique:{id}"),
        }
    }
}

/// Who is authoritative for an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnerRef {
    /// No owner; the object belongs to the local endpoint's first owner for catch-up.
    Unowned,
    /// Owned by the owner with this id.
    Owner(Uuid),
    /// Never reflooded. Meta messages may still name an owner they are about.
    Ephemeral(Option<Uuid>),
}

impl OwnerRef {
    /// The owner id carried on the wire, if any.
    pub fn id(&self) -> Option<Uuid> {
        match self {
            Self::Unowned | Self::Ephemeral(None) => None,
            Self::Owner(id) | Self::Ephemeral(Some(id)) => Some(*id),
        }
    }

    /// Returns true for ephemeral objects.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Ephemeral(_))
    }
}

/// A restriction on which attributes are sent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AttributeSet {
    /// Every synchronized attribute.
    #[default]
    All,
    /// Only the named attributes.
    Only(BTreeSet<String>),
}

impl AttributeSet {
    /// Restricts to the given names.
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(names.into_iter().map(Into::into).collect())
    }

    /// Union that never narrows: `All` absorbs everything.
    pub fn union(&self, other: &AttributeSet) -> AttributeSet {
        match (self, other) {
            (Self::Only(a), Self::Only(b)) => Self::Only(a.union(b).cloned().collect()),
            _ => Self::All,
        }
    }

    /// Returns true if the attribute is included.
    pub fn contains(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(names) => names.contains(name),
        }
    }
}

/// A replicated object as the engine sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncObject {
    pub(crate) sync_type: String,
    pub(crate) key: PrimaryKey,
    pub(crate) attributes: Map<String, Value>,
    pub(crate) owner: OwnerRef,
    pub(crate) transition_id: Option<Uuid>,
    pub(crate) sync_serial: u64,
    pub(crate) generated_locally: bool,
}

impl SyncObject {
    pub(crate) fn new(sync_type: impl Into<String>, key: PrimaryKey, attributes: Map<String, Value>) -> Self {
        Self {
            sync_type: sync_type.into(),
            key,
            attributes,
            owner: OwnerRef::Unowned,
            transition_id: None,
            sync_serial: 0,
            generated_locally: false,
        }
    }

    /// Registered type name.
    pub fn sync_type(&self) -> &str {
        &self.sync_type
    }

    /// Primary key within the object's bucket.
    pub fn primary_key(&self) -> &PrimaryKey {
        &self.key
    }

    /// Synchronized attributes, excluding envelope attributes.
    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    /// Looks up one attribute.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// The owner reference.
    pub fn owner(&self) -> OwnerRef {
        self.owner
    }

    /// Current transition id, if the object is in transition.
    pub fn transition_id(&self) -> Option<Uuid> {
        self.transition_id
    }

    /// Serial assigned by the owner when the object was last committed.
    pub fn sync_serial(&self) -> u64 {
        self.sync_serial
    }

    /// True if this endpoint produced the object rather than receiving it.
    pub fn generated_locally(&self) -> bool {
        self.generated_locally
    }

    /// Deserializes the attributes into the application type.
    pub fn decode<T: DeserializeOwned>(&self) -> SyncResult<T> {
        serde_json::from_value(Value::Object(self.attributes.clone()))
            .map_err(|e| SyncError::BadEncoding(format!("{}: {e}", self.sync_type)))
    }

    /// Attributes as sent on the wire, restricted by `only`.
    ///
    /// Envelope attributes are appended when `with_serial` or a transition id applies.
    pub(crate) fn wire_attributes(&self, only: &AttributeSet, with_serial: bool) -> Map<String, Value> {
        let mut out: Map<String, Value> = self
            .attributes
            .iter()
            .filter(|(k, _)| only.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if with_serial && only.contains(SERIAL_ATTRIBUTE) {
            out.insert(SERIAL_ATTRIBUTE.into(), Value::from(self.sync_serial));
        }
        if let Some(id) = self.transition_id {
            if only.contains(TRANSITION_ATTRIBUTE) {
                out.insert(TRANSITION_ATTRIBUTE.into(), Value::String(id.to_string()));
            }
        }
        out
    }
}

impl fmt::Display for SyncObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {}>", self.sync_type, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn primary_key_is_canonical_array() {
        let a = attrs(json!({"id": 3, "zone": "east", "name": "x"}));
        let key = PrimaryKey::from_attributes(&["zone", "id"], &a).unwrap();
        assert_eq!(key, PrimaryKey::Values(r#"["east",3]"#.into()));
        assert_eq!(key.values().unwrap(), vec![json!("east"), json!(3)]);
        assert_eq!(PrimaryKey::from_values(&[json!("east"), json!(3)]), key);
    }

    #[test]
    fn missing_primary_key_is_bad_encoding() {
        let a = attrs(json!({"id": null}));
        assert!(matches!(
            PrimaryKey::from_attributes(&["id"], &a),
            Err(SyncError::BadEncoding(_))
        ));
    }

    #[test]
    fn unique_keys_never_collide() {
        assert_ne!(PrimaryKey::unique(), PrimaryKey::unique());
    }

    #[test]
    fn attribute_union_never_narrows() {
        let a = AttributeSet::only(["x"]);
        let b = AttributeSet::only(["y"]);
        assert_eq!(a.union(&b), AttributeSet::only(["x", "y"]));
        assert_eq!(a.union(&AttributeSet::All), AttributeSet::All);
        assert_eq!(AttributeSet::All.union(&b), AttributeSet::All);
    }

    #[test]
    fn wire_attributes_respect_restriction() {
        let mut obj = SyncObject::new(
            "Widget",
            PrimaryKey::Values("[1]".into()),
            attrs(json!({"id": 1, "name": "a", "size": 2})),
        );
        obj.sync_serial = 7;
        obj.transition_id = Some(Uuid::nil());

        let all = obj.wire_attributes(&AttributeSet::All, true);
        assert_eq!(all["sync_serial"], json!(7));
        assert_eq!(all["transition_id"], json!(Uuid::nil().to_string()));

        let some = obj.wire_attributes(&AttributeSet::only(["id", "size"]), true);
        assert_eq!(some.len(), 2);
        assert!(some.contains_key("size"));
    }

    #[test]
    fn owner_ids() {
        let id = Uuid::new_v4();
        assert_eq!(OwnerRef::Owner(id).id(), Some(id));
        assert_eq!(OwnerRef::Ephemeral(Some(id)).id(), Some(id));
        assert_eq!(OwnerRef::Unowned.id(), None);
        assert!(OwnerRef::Ephemeral(None).is_ephemeral());
    }
}
