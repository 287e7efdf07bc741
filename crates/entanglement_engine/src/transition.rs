//! Transient transitions.
//!
//! At most one transition is tracked per object. A record remembers who
//! started it and the response context of its first message, so that
//! whoever breaks the transition can report `BrokenTransition` back along
//! the same path.

use crate::error::SyncError;
use crate::object::{PrimaryKey, SyncObject};
use crate::response::{Completion, ResponseContext};
use entanglement_protocol::DestHash;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// One object in transition.
#[derive(Debug)]
pub(crate) struct TransitionRecord {
    /// The object with its transitioned attribute values.
    pub object: SyncObject,
    pub transition_id: Uuid,
    /// Peer the transition arrived from; `None` if started here.
    pub destination: Option<DestHash>,
    /// Context of the first transition message from `destination`.
    pub response_for: Option<ResponseContext>,
    /// Transition messages seen for this record.
    pub count: u32,
    /// Resolves the future returned to a local initiator.
    pub completion: Option<Completion>,
}

impl TransitionRecord {
    fn is_same(&self, transition_id: Option<Uuid>, sender: DestHash) -> bool {
        transition_id == Some(self.transition_id) && self.destination == Some(sender)
    }

    fn broken_error(&self) -> SyncError {
        SyncError::BrokenTransition {
            transition_id: self.transition_id,
            sync_type: self.object.sync_type().to_string(),
            primary_key: self.object.primary_key().to_string(),
        }
    }

    /// True if a message from elsewhere ends the transition without
    /// anyone left to tell.
    ///
    /// A locally started transition ends quietly when the message answers
    /// its own request. One started by a peer ends quietly when the message
    /// is the response to it or when its response context was already
    /// consumed by an earlier response.
    fn ends_quietly(&self, response_for: Option<&ResponseContext>) -> bool {
        match (self.destination, response_for) {
            (None, Some(ctx)) => self.completion.as_ref().map_or(false, |c| ctx.holds(c)),
            (None, None) => false,
            (Some(_), incoming) => match &self.response_for {
                Some(held) => incoming.map_or(false, |ctx| ctx.ptr_eq(held)) || !held.has_forwards(),
                None => true,
            },
        }
    }

    /// Fails the local initiator and hands back what the peer must be told.
    fn into_broken(self) -> BrokenRecord {
        let error = self.broken_error();
        debug!(object = %self.object, transition_id = %self.transition_id, "transition broken");
        if let Some(completion) = &self.completion {
            completion.complete(Err(error.clone()));
        }
        if let Some(ctx) = &self.response_for {
            ctx.resolve(Err(error.clone()));
        }
        BrokenRecord {
            error,
            destination: self.destination,
            response_for: self.response_for,
        }
    }
}

/// A broken transition whose initiator should receive an `error`.
#[derive(Debug)]
pub(crate) struct BrokenRecord {
    pub error: SyncError,
    pub destination: Option<DestHash>,
    pub response_for: Option<ResponseContext>,
}

/// What an incoming message did to the transition of its object.
#[derive(Debug)]
pub(crate) enum TransitionLookup {
    /// The object is not in transition.
    Absent,
    /// Another message of the same transition; carries the transitioned object.
    Continued(SyncObject),
    /// The transition ended without breaking. `same` is true when its
    /// initiator ended it.
    Ended { same: bool },
    /// The transition was broken.
    Broken(BrokenRecord),
}

/// Every object in transition, keyed by bucket and primary key.
#[derive(Debug, Default)]
pub(crate) struct TransitionTable {
    records: HashMap<(String, PrimaryKey), TransitionRecord>,
}

impl TransitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &str, key: &PrimaryKey) -> Option<&TransitionRecord> {
        self.records.get(&(bucket.to_string(), key.clone()))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn remove(&mut self, bucket: &str, key: &PrimaryKey) -> Option<TransitionRecord> {
        self.records.remove(&(bucket.to_string(), key.clone()))
    }

    /// Removes the record only if it still tracks `transition_id`.
    pub fn remove_matching(&mut self, bucket: &str, key: &PrimaryKey, transition_id: Uuid) -> Option<TransitionRecord> {
        let slot = (bucket.to_string(), key.clone());
        match self.records.get(&slot) {
            Some(record) if record.transition_id == transition_id => self.records.remove(&slot),
            _ => None,
        }
    }

    /// Applies an incoming message for `key` to its transition, if any.
    #[allow(clippy::too_many_arguments)]
    pub fn incoming(
        &mut self,
        bucket: &str,
        key: &PrimaryKey,
        transition_id: Option<Uuid>,
        is_transition: bool,
        sender: DestHash,
        response_for: Option<&ResponseContext>,
        attributes: &Map<String, Value>,
    ) -> TransitionLookup {
        let slot = (bucket.to_string(), key.clone());
        let Some(record) = self.records.get_mut(&slot) else {
            return TransitionLookup::Absent;
        };
        let same = record.is_same(transition_id, sender);
        if is_transition && same {
            match (&record.response_for, response_for) {
                (Some(held), Some(incoming)) => held.merge(incoming),
                (None, Some(incoming)) => record.response_for = Some(incoming.clone()),
                _ => {}
            }
            for (name, value) in attributes {
                record.object.attributes.insert(name.clone(), value.clone());
            }
            return TransitionLookup::Continued(record.object.clone());
        }

        let Some(record) = self.records.remove(&slot) else {
            return TransitionLookup::Absent;
        };
        if same {
            if let (Some(incoming), Some(held)) = (response_for, &record.response_for) {
                incoming.merge(held);
            }
            return TransitionLookup::Ended { same: true };
        }
        if record.ends_quietly(response_for) {
            return TransitionLookup::Ended { same: false };
        }
        TransitionLookup::Broken(record.into_broken())
    }

    /// Records `object` as being in transition.
    ///
    /// A record for a different transition of the same object is broken
    /// and returned. Returns true as the second element for a new record.
    pub fn store(
        &mut self,
        bucket: &str,
        object: SyncObject,
        transition_id: Uuid,
        destination: Option<DestHash>,
        response_for: Option<ResponseContext>,
        completion: Option<Completion>,
    ) -> (Option<BrokenRecord>, bool) {
        let slot = (bucket.to_string(), object.primary_key().clone());
        let mut broken = None;
        if let Some(existing) = self.records.get_mut(&slot) {
            if existing.transition_id == transition_id {
                existing.object = object;
                existing.count += 1;
                if existing.completion.is_none() {
                    existing.completion = completion;
                }
                return (None, false);
            }
            if let Some(old) = self.records.remove(&slot) {
                broken = Some(old.into_broken());
            }
        }
        debug!(object = %object, %transition_id, "starting transition");
        self.records.insert(
            slot,
            TransitionRecord {
                object,
                transition_id,
                destination,
                response_for,
                count: 1,
                completion,
            },
        );
        (broken, true)
    }

    /// Ends the transition of a locally committed object.
    ///
    /// A commit carrying the record's own transition id completes the
    /// initiator with the committed object and hands back the context of
    /// the peer that started it, so the commit can answer that peer. Any
    /// other commit breaks the transition.
    pub fn commit_local(
        &mut self,
        bucket: &str,
        committed: &SyncObject,
        transition_id: Option<Uuid>,
    ) -> LocalCommit {
        let Some(record) = self.remove(bucket, committed.primary_key()) else {
            return LocalCommit::NotInTransition;
        };
        if transition_id == Some(record.transition_id) {
            if let Some(completion) = &record.completion {
                completion.complete(Ok(Some(committed.clone())));
            }
            return LocalCommit::Completed(record.response_for);
        }
        LocalCommit::Broken(record.into_broken())
    }
}

/// Result of [`TransitionTable::commit_local`].
#[derive(Debug)]
pub(crate) enum LocalCommit {
    NotInTransition,
    /// The commit finished the transition.
    Completed(Option<ResponseContext>),
    Broken(BrokenRecord),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(x: i64) -> SyncObject {
        let attrs = json!({"id": 1, "x": x}).as_object().cloned().unwrap();
        let key = PrimaryKey::from_attributes(&["id"], &attrs).unwrap();
        SyncObject::new("Marker", key, attrs)
    }

    fn peer(name: &str) -> DestHash {
        DestHash::from_string(name)
    }

    struct Gone;

    impl crate::response::NoResponseSink for Gone {
        fn connection_id(&self) -> u64 {
            0
        }
        fn dest_hash(&self) -> DestHash {
            peer("gone")
        }
        fn no_response(&self, _counters: Vec<u32>) {}
    }

    /// A context some peer is still waiting on.
    fn awaited() -> ResponseContext {
        let sink: std::sync::Weak<dyn crate::response::NoResponseSink> = std::sync::Weak::<Gone>::new();
        ResponseContext::for_incoming(sink, 1, 0)
    }

    #[test]
    fn absent_object_is_not_in_transition() {
        let mut table = TransitionTable::new();
        let obj = object(0);
        let lookup = table.incoming("Marker", obj.primary_key(), None, true, peer("a"), None, &Map::new());
        assert!(matches!(lookup, TransitionLookup::Absent));
    }

    #[test]
    fn same_transition_continues() {
        let mut table = TransitionTable::new();
        let tid = Uuid::new_v4();
        let obj = object(0);
        let key = obj.primary_key().clone();
        table.store("Marker", obj, tid, Some(peer("a")), None, None);

        let update = json!({"x": 5}).as_object().cloned().unwrap();
        match table.incoming("Marker", &key, Some(tid), true, peer("a"), None, &update) {
            TransitionLookup::Continued(obj) => assert_eq!(obj.get("x"), Some(&json!(5))),
            other => panic!("expected continuation, got {other:?}"),
        }
        let (broken, new) = table.store("Marker", object(5), tid, Some(peer("a")), None, None);
        assert!(broken.is_none());
        assert!(!new);
        assert_eq!(table.get("Marker", &key).unwrap().count, 2);
    }

    #[test]
    fn same_id_from_other_sender_breaks() {
        let mut table = TransitionTable::new();
        let tid = Uuid::new_v4();
        let obj = object(0);
        let key = obj.primary_key().clone();
        table.store("Marker", obj, tid, Some(peer("a")), Some(awaited()), None);

        match table.incoming("Marker", &key, Some(tid), true, peer("b"), None, &Map::new()) {
            TransitionLookup::Broken(broken) => {
                assert_eq!(broken.destination, Some(peer("a")));
                assert!(matches!(broken.error, SyncError::BrokenTransition { transition_id, .. } if transition_id == tid));
            }
            other => panic!("expected broken, got {other:?}"),
        }
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn sync_from_initiator_ends_and_merges() {
        let mut table = TransitionTable::new();
        let tid = Uuid::new_v4();
        let obj = object(0);
        let key = obj.primary_key().clone();
        let held = ResponseContext::new();
        let mut waiting = held.add_future();
        table.store("Marker", obj, tid, Some(peer("a")), Some(held), None);

        let incoming = ResponseContext::new();
        let lookup = table.incoming("Marker", &key, Some(tid), false, peer("a"), Some(&incoming), &Map::new());
        assert!(matches!(lookup, TransitionLookup::Ended { same: true }));

        incoming.mark_responded();
        incoming.resolve(Ok(None));
        assert_eq!(waiting.try_outcome(), Some(Ok(None)));
    }

    #[test]
    fn local_initiator_rejected_by_plain_commit() {
        let mut table = TransitionTable::new();
        let tid = Uuid::new_v4();
        let (completion, mut fut) = Completion::new();
        table.store("Marker", object(3), tid, None, None, Some(completion));

        let LocalCommit::Broken(broken) = table.commit_local("Marker", &object(4), None) else {
            panic!("plain commit must break the transition");
        };
        assert!(broken.destination.is_none());
        assert!(matches!(fut.try_outcome(), Some(Err(SyncError::BrokenTransition { .. }))));
    }

    #[test]
    fn local_commit_with_same_id_completes() {
        let mut table = TransitionTable::new();
        let tid = Uuid::new_v4();
        let (completion, mut fut) = Completion::new();
        table.store("Marker", object(3), tid, None, None, Some(completion));

        assert!(matches!(
            table.commit_local("Marker", &object(4), Some(tid)),
            LocalCommit::Completed(None)
        ));
        assert!(matches!(
            table.commit_local("Marker", &object(4), Some(tid)),
            LocalCommit::NotInTransition
        ));
        assert_eq!(fut.try_outcome(), Some(Ok(Some(object(4)))));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn reply_to_own_transition_is_not_a_break() {
        let mut table = TransitionTable::new();
        let tid = Uuid::new_v4();
        let obj = object(3);
        let key = obj.primary_key().clone();
        let (completion, mut fut) = Completion::new();
        let ctx = ResponseContext::new();
        ctx.add_completion(completion.clone());
        table.store("Marker", obj, tid, None, None, Some(completion));

        let lookup = table.incoming("Marker", &key, None, false, peer("owner"), Some(&ctx), &Map::new());
        assert!(matches!(lookup, TransitionLookup::Ended { same: false }));
        assert!(fut.try_outcome().is_none());
    }

    #[test]
    fn consumed_context_ends_quietly() {
        let mut table = TransitionTable::new();
        let tid = Uuid::new_v4();
        let obj = object(0);
        let key = obj.primary_key().clone();
        let held = awaited();
        table.store("Marker", obj, tid, Some(peer("a")), Some(held.clone()), None);

        // The owner's reply already carried the initiator's counters
        let reply = ResponseContext::new();
        reply.merge(&held);
        let lookup = table.incoming("Marker", &key, None, false, peer("owner"), Some(&reply), &Map::new());
        assert!(matches!(lookup, TransitionLookup::Ended { same: false }));
    }

    #[test]
    fn new_transition_replaces_old() {
        let mut table = TransitionTable::new();
        let (completion, mut fut) = Completion::new();
        table.store("Marker", object(1), Uuid::new_v4(), None, None, Some(completion));

        let (broken, new) = table.store("Marker", object(2), Uuid::new_v4(), Some(peer("a")), None, None);
        assert!(new);
        assert!(broken.is_some());
        assert!(matches!(fut.try_outcome(), Some(Err(_))));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_matching_checks_id() {
        let mut table = TransitionTable::new();
        let tid = Uuid::new_v4();
        let obj = object(1);
        let key = obj.primary_key().clone();
        table.store("Marker", obj, tid, None, None, None);
        assert!(table.remove_matching("Marker", &key, Uuid::new_v4()).is_none());
        assert!(table.remove_matching("Marker", &key, tid).is_some());
    }
}
