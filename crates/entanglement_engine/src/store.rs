//! In-memory object store and tombstones.

use crate::object::{OwnerRef, PrimaryKey, SyncObject};
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// A deleted object remembered for catch-up.
///
/// Keeps only the primary key attributes, the owner and the serial of
/// the delete.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Tombstone {
    pub bucket: String,
    pub object: SyncObject,
}

/// Objects keyed by bucket and primary key.
#[derive(Debug, Default)]
pub(crate) struct ObjectStore {
    buckets: HashMap<String, HashMap<PrimaryKey, SyncObject>>,
    tombstones: HashMap<(String, PrimaryKey), Tombstone>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an object. A live object supersedes its tombstone.
    pub fn add(&mut self, bucket: &str, object: SyncObject) {
        self.tombstones
            .remove(&(bucket.to_string(), object.key.clone()));
        self.buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(object.key.clone(), object);
    }

    pub fn remove(&mut self, bucket: &str, key: &PrimaryKey) -> Option<SyncObject> {
        let objects = self.buckets.get_mut(bucket)?;
        let removed = objects.remove(key);
        if objects.is_empty() {
            self.buckets.remove(bucket);
        }
        removed
    }

    pub fn get(&self, bucket: &str, key: &PrimaryKey) -> Option<&SyncObject> {
        self.buckets.get(bucket)?.get(key)
    }

    pub fn contains(&self, bucket: &str, key: &PrimaryKey) -> bool {
        self.get(bucket, key).is_some()
    }

    /// The stored object, or a fresh one built from `defaults`.
    pub fn get_or_create(
        &self,
        bucket: &str,
        sync_type: &str,
        key: &PrimaryKey,
        defaults: &Map<String, Value>,
    ) -> SyncObject {
        match self.get(bucket, key) {
            Some(existing) => existing.clone(),
            None => SyncObject::new(sync_type, key.clone(), defaults.clone()),
        }
    }

    /// Objects of one type, in no particular order.
    pub fn objects_of_type<'a>(&'a self, bucket: &str, sync_type: &'a str) -> impl Iterator<Item = &'a SyncObject> {
        self.buckets
            .get(bucket)
            .into_iter()
            .flat_map(|objects| objects.values())
            .filter(move |obj| obj.sync_type == sync_type)
    }

    /// Every object with its bucket.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SyncObject)> {
        self.buckets
            .iter()
            .flat_map(|(bucket, objects)| objects.values().map(move |obj| (bucket.as_str(), obj)))
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(HashMap::len).sum()
    }

    /// Remembers a delete.
    pub fn add_tombstone(&mut self, bucket: &str, object: &SyncObject, key_fields: &[&str], serial: u64) {
        let attributes = object
            .attributes
            .iter()
            .filter(|(name, _)| key_fields.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let mut stripped = SyncObject::new(object.sync_type.clone(), object.key.clone(), attributes);
        stripped.owner = object.owner;
        stripped.sync_serial = serial;
        self.tombstones.insert(
            (bucket.to_string(), object.key.clone()),
            Tombstone {
                bucket: bucket.to_string(),
                object: stripped,
            },
        );
    }

    /// Removes every object and tombstone owned by `owner`.
    ///
    /// Returns the removed live objects with their buckets.
    pub fn clear_owner(&mut self, owner: Uuid) -> Vec<(String, SyncObject)> {
        let mut removed = Vec::new();
        for (bucket, objects) in self.buckets.iter_mut() {
            let keys: Vec<PrimaryKey> = objects
                .values()
                .filter(|obj| obj.owner == OwnerRef::Owner(owner))
                .map(|obj| obj.key.clone())
                .collect();
            for key in keys {
                if let Some(obj) = objects.remove(&key) {
                    removed.push((bucket.clone(), obj));
                }
            }
        }
        self.buckets.retain(|_, objects| !objects.is_empty());
        self.tombstones
            .retain(|_, stone| stone.object.owner != OwnerRef::Owner(owner));
        removed
    }

    /// Catch-up selection: tombstones and live objects newer than `serial`.
    ///
    /// `include_unowned` adds objects without an owner, which belong to
    /// the first local owner announced to a peer.
    pub fn changes_since(
        &self,
        owner: Uuid,
        include_unowned: bool,
        serial: u64,
    ) -> (Vec<Tombstone>, Vec<(String, SyncObject)>) {
        let matches = |obj: &SyncObject| match obj.owner {
            OwnerRef::Owner(id) => id == owner,
            OwnerRef::Unowned => include_unowned,
            OwnerRef::Ephemeral(_) => false,
        };
        let mut tombstones: Vec<Tombstone> = self
            .tombstones
            .values()
            .filter(|stone| stone.object.sync_serial > serial && matches(&stone.object))
            .cloned()
            .collect();
        tombstones.sort_by_key(|stone| stone.object.sync_serial);
        let mut live: Vec<(String, SyncObject)> = self
            .iter()
            .filter(|(_, obj)| obj.sync_serial > serial && matches(obj))
            .map(|(bucket, obj)| (bucket.to_string(), obj.clone()))
            .collect();
        live.sort_by_key(|(_, obj)| obj.sync_serial);
        (tombstones, live)
    }

    #[cfg(test)]
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }
}
