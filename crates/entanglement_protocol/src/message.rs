//! The JSON object carried by each frame.

use crate::error::{ProtocolError, ProtocolResult};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Operation assumed when `_sync_operation` is absent.
pub const DEFAULT_OPERATION: &str = "sync";

/// Reserved meta keys. Every key starting with `_` must be one of these.
pub mod meta {
    /// Registered type name; absent only in pure-meta frames.
    pub const SYNC_TYPE: &str = "_sync_type";
    /// Operation name; absent means `sync`.
    pub const OPERATION: &str = "_sync_operation";
    /// Owner id as a UUID string.
    pub const OWNER: &str = "_sync_owner";
    /// Receiver-side authorization marker; never valid on the wire.
    pub const AUTHORIZED: &str = "_sync_authorized";
    /// True for error responses.
    pub const IS_ERROR: &str = "_sync_is_error";
    /// Incoming counters this frame responds to.
    pub const RESP_FOR: &str = "_resp_for";
    /// Outgoing counters for which no response will come.
    pub const NO_RESP_FOR: &str = "_no_resp_for";

    /// Meta keys allowed on the wire.
    pub const WIRE_KEYS: [&str; 6] = [SYNC_TYPE, OPERATION, OWNER, IS_ERROR, RESP_FOR, NO_RESP_FOR];
}

/// A sync message: a flat JSON object of attributes plus meta keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncMessage {
    body: Map<String, Value>,
}

impl SyncMessage {
    /// Creates an empty (meta-only) message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a message for the given registered type.
    pub fn for_type(sync_type: &str) -> Self {
        let mut msg = Self::new();
        msg.set_sync_type(sync_type);
        msg
    }

    /// Wraps an existing JSON object.
    pub fn from_map(body: Map<String, Value>) -> Self {
        Self { body }
    }

    /// Parses a frame payload.
    pub fn from_slice(bytes: &[u8]) -> ProtocolResult<Self> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        match value {
            Value::Object(body) => Ok(Self { body }),
            Value::Array(_) => Err(ProtocolError::NotAnObject("array")),
            Value::String(_) => Err(ProtocolError::NotAnObject("string")),
            Value::Number(_) => Err(ProtocolError::NotAnObject("number")),
            Value::Bool(_) => Err(ProtocolError::NotAnObject("boolean")),
            Value::Null => Err(ProtocolError::NotAnObject("null")),
        }
    }

    /// Serializes the message as a frame payload.
    pub fn to_vec(&self) -> ProtocolResult<Vec<u8>> {
        serde_json::to_vec(&self.body).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }

    /// Rejects unknown meta keys and the receiver-only authorization marker.
    pub fn validate(&self) -> ProtocolResult<()> {
        for key in self.body.keys() {
            if key.starts_with('_') && !meta::WIRE_KEYS.contains(&key.as_str()) {
                return Err(ProtocolError::UnknownMetaKey(key.clone()));
            }
        }
        Ok(())
    }

    /// Returns the registered type name, if any.
    pub fn sync_type(&self) -> Option<&str> {
        self.body.get(meta::SYNC_TYPE).and_then(Value::as_str)
    }

    /// Sets the registered type name.
    pub fn set_sync_type(&mut self, sync_type: &str) {
        self.body
            .insert(meta::SYNC_TYPE.into(), Value::String(sync_type.into()));
    }

    /// Returns true if the message carries no object.
    pub fn is_meta_only(&self) -> bool {
        !self.body.contains_key(meta::SYNC_TYPE)
    }

    /// Returns the operation name, defaulting to `sync`.
    pub fn operation(&self) -> ProtocolResult<&str> {
        match self.body.get(meta::OPERATION) {
            None => Ok(DEFAULT_OPERATION),
            Some(Value::String(op)) => Ok(op),
            Some(other) => Err(ProtocolError::bad_meta(
                meta::OPERATION,
                format!("expected a string, got {other}"),
            )),
        }
    }

    /// Sets the operation; the default is left implicit.
    pub fn set_operation(&mut self, operation: &str) {
        if operation == DEFAULT_OPERATION {
            self.body.remove(meta::OPERATION);
        } else {
            self.body
                .insert(meta::OPERATION.into(), Value::String(operation.into()));
        }
    }

    /// Returns the owner id, if present.
    pub fn owner(&self) -> ProtocolResult<Option<Uuid>> {
        match self.body.get(meta::OWNER) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Uuid::parse_str(s)
                .map(Some)
                .map_err(|e| ProtocolError::bad_meta(meta::OWNER, e.to_string())),
            Some(other) => Err(ProtocolError::bad_meta(
                meta::OWNER,
                format!("expected a UUID string, got {other}"),
            )),
        }
    }

    /// Sets the owner id.
    pub fn set_owner(&mut self, owner: Uuid) {
        self.body
            .insert(meta::OWNER.into(), Value::String(owner.to_string()));
    }

    /// Returns true if this message is an error response.
    pub fn is_error(&self) -> bool {
        self.body
            .get(meta::IS_ERROR)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Marks the message as an error response.
    pub fn set_is_error(&mut self) {
        self.body.insert(meta::IS_ERROR.into(), Value::Bool(true));
    }

    /// Removes and returns `_resp_for`.
    pub fn take_resp_for(&mut self) -> ProtocolResult<Option<Vec<u32>>> {
        take_counters(&mut self.body, meta::RESP_FOR)
    }

    /// Sets `_resp_for`.
    pub fn set_resp_for(&mut self, counters: Vec<u32>) {
        self.body.insert(meta::RESP_FOR.into(), counters_value(counters));
    }

    /// Removes and returns `_no_resp_for`.
    pub fn take_no_resp_for(&mut self) -> ProtocolResult<Option<Vec<u32>>> {
        take_counters(&mut self.body, meta::NO_RESP_FOR)
    }

    /// Sets `_no_resp_for`.
    pub fn set_no_resp_for(&mut self, counters: Vec<u32>) {
        self.body
            .insert(meta::NO_RESP_FOR.into(), counters_value(counters));
    }

    /// Iterates over the non-meta attributes.
    pub fn attributes(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.body.iter().filter(|(k, _)| !k.starts_with('_'))
    }

    /// Names of the non-meta attributes.
    pub fn attribute_names(&self) -> BTreeSet<String> {
        self.attributes().map(|(k, _)| k.clone()).collect()
    }

    /// Looks up a key, meta or not.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// Returns true if the key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.body.contains_key(key)
    }

    /// Inserts a key.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.body.insert(key.into(), value);
    }

    /// Removes a key.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.body.remove(key)
    }

    /// Returns true if the message has no keys at all.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Borrows the underlying object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.body
    }

    /// Consumes the message, returning the underlying object.
    pub fn into_map(self) -> Map<String, Value> {
        self.body
    }
}

fn counters_value(counters: Vec<u32>) -> Value {
    Value::Array(counters.into_iter().map(Value::from).collect())
}

fn take_counters(body: &mut Map<String, Value>, key: &'static str) -> ProtocolResult<Option<Vec<u32>>> {
    let Some(value) = body.remove(key) else {
        return Ok(None);
    };
    let Value::Array(items) = value else {
        return Err(ProtocolError::bad_meta(key, "expected an array"));
    };
    items
        .iter()
        .map(|item| {
            item.as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| ProtocolError::bad_meta(key, format!("{item} is not a counter")))
        })
        .collect::<ProtocolResult<Vec<u32>>>()
        .map(Some)
}
