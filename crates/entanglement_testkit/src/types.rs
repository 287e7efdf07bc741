//! Sample application types.
//!
//! Each type exercises a different corner of the engine: plain stored
//! objects, owner-assigned keys, transitions and unstored messages.

use entanglement_engine::{PrimaryKeys, ReceiveInfo, Registry, SyncObject, Syncable};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Name of the registry returned by [`sample_registry`].
pub const SAMPLE_REGISTRY: &str = "sample";

/// A stored object keyed by `id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Widget {
    /// Primary key.
    pub id: u32,
    /// Display name.
    pub name: String,
    /// Arbitrary payload.
    pub size: u32,
}

impl Widget {
    /// A widget of size zero.
    pub fn new(id: u32, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            size: 0,
        }
    }

    /// The same widget with another size.
    pub fn sized(mut self, size: u32) -> Self {
        self.size = size;
        self
    }
}

impl Syncable for Widget {
    const SYNC_TYPE: &'static str = "Widget";
    const PRIMARY_KEYS: PrimaryKeys = PrimaryKeys::Fields(&["id"]);
}

/// A stored object whose key is chosen by its owner on create.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    /// Primary key, assigned by the owner.
    pub id: String,
    /// Summary line.
    pub title: String,
}

impl Ticket {
    /// A ticket without an id.
    pub fn titled(title: &str) -> Self {
        Self {
            id: String::new(),
            title: title.to_string(),
        }
    }
}

impl Syncable for Ticket {
    const SYNC_TYPE: &'static str = "Ticket";
    const PRIMARY_KEYS: PrimaryKeys = PrimaryKeys::Fields(&["id"]);

    fn assign_primary_keys(attributes: &mut Map<String, Value>) {
        let unset = attributes.get("id").and_then(Value::as_str).map_or(true, str::is_empty);
        if unset {
            attributes.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
        }
    }

    fn should_listen_primary_keys(obj: &SyncObject, _info: &ReceiveInfo) -> Option<bool> {
        Some(obj.get("id").and_then(Value::as_str).map_or(false, |id| id.starts_with("client-")))
    }
}

/// A transition-capable object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dial {
    /// Primary key.
    pub id: u32,
    /// Current position.
    pub position: i32,
    /// Free-form label, never part of transitions.
    pub label: String,
}

impl Dial {
    /// A dial at `position`.
    pub fn at(id: u32, position: i32) -> Self {
        Self {
            id,
            position,
            label: String::new(),
        }
    }
}

impl Syncable for Dial {
    const SYNC_TYPE: &'static str = "Dial";
    const PRIMARY_KEYS: PrimaryKeys = PrimaryKeys::Fields(&["id"]);
    const TRANSITIONS: bool = true;

    fn transition_modified_attrs(_obj: &SyncObject) -> Option<Vec<String>> {
        Some(vec!["position".to_string()])
    }
}

/// An unstored message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    /// Message text.
    pub text: String,
}

impl Syncable for Chat {
    const SYNC_TYPE: &'static str = "Chat";
    const PRIMARY_KEYS: PrimaryKeys = PrimaryKeys::Unique;
    const STORED: bool = false;
}

/// Registry with every sample type.
pub fn sample_registry() -> Registry {
    let mut registry = Registry::new(SAMPLE_REGISTRY);
    for result in [
        registry.register::<Widget>(),
        registry.register::<Ticket>(),
        registry.register::<Dial>(),
        registry.register::<Chat>(),
    ] {
        if let Err(e) = result {
            panic!("sample type failed to register: {e}");
        }
    }
    registry
}
