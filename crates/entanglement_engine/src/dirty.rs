//! Outgoing dirty queue.
//!
//! A binary heap ordered by `(priority, sequence)` with a side index from
//! object identity to heap slot, so re-synchronizing a queued object merges
//! into its slot instead of queueing a second copy.

use crate::object::{AttributeSet, PrimaryKey, SyncObject};
use crate::operations::Operation;
use crate::response::ResponseContext;
use std::collections::HashMap;

/// Identity of a queued object: its store bucket and primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct DirtyKey {
    pub bucket: String,
    pub key: PrimaryKey,
}

/// One object waiting to be sent on a connection.
#[derive(Debug, Clone)]
pub(crate) struct DirtyItem {
    pub object: SyncObject,
    pub bucket: String,
    pub operation: Operation,
    pub attributes: AttributeSet,
    pub response_for: Option<ResponseContext>,
    pub priority: i32,
    /// Stored classes carry `sync_serial` on the wire.
    pub with_serial: bool,
    /// Sent with `_sync_is_error`.
    pub is_error: bool,
}

impl DirtyItem {
    pub fn key(&self) -> DirtyKey {
        DirtyKey {
            bucket: self.bucket.clone(),
            key: self.object.key.clone(),
        }
    }

    /// Folds a newer item for the same object into this one.
    ///
    /// Returns true if the priority moved earlier.
    pub fn merge(&mut self, newer: DirtyItem) -> bool {
        self.attributes = self.attributes.union(&newer.attributes);
        self.object = newer.object;
        self.operation = newer.operation;
        self.with_serial = newer.with_serial;
        self.is_error = newer.is_error;
        if let Some(incoming) = newer.response_for {
            match &self.response_for {
                Some(existing) => existing.merge(&incoming),
                None => self.response_for = Some(incoming),
            }
        }
        if newer.priority < self.priority {
            self.priority = newer.priority;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
struct Slot {
    seq: u64,
    item: DirtyItem,
}

impl Slot {
    fn before(&self, other: &Slot) -> bool {
        (self.item.priority, self.seq) < (other.item.priority, other.seq)
    }
}

/// Priority queue of dirty items keyed by object identity.
///
/// Lower priority values are sent first; equal priorities go out in
/// insertion order.
#[derive(Debug, Default)]
pub(crate) struct DirtyQueue {
    heap: Vec<Slot>,
    index: HashMap<DirtyKey, usize>,
    next_seq: u64,
}

impl DirtyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an item, merging into an existing slot for the same object.
    pub fn add_or_replace(&mut self, item: DirtyItem) {
        let key = item.key();
        if let Some(&pos) = self.index.get(&key) {
            if self.heap[pos].item.merge(item) {
                self.sift_up(pos);
            }
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Slot { seq, item });
        let pos = self.heap.len() - 1;
        self.index.insert(key, pos);
        self.sift_up(pos);
    }

    /// Removes the earliest item.
    pub fn pop(&mut self) -> Option<DirtyItem> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.swap(0, last);
        let slot = self.heap.pop()?;
        self.index.remove(&slot.item.key());
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        Some(slot.item)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, key: &DirtyKey) -> bool {
        self.index.contains_key(key)
    }

    /// Items in heap order, not send order.
    pub fn iter(&self) -> impl Iterator<Item = &DirtyItem> {
        self.heap.iter().map(|slot| &slot.item)
    }

    /// Moves every item of `other` into this queue.
    pub fn absorb(&mut self, other: &mut DirtyQueue) {
        let mut slots = std::mem::take(&mut other.heap);
        other.index.clear();
        slots.sort_by_key(|slot| slot.seq);
        for slot in slots {
            self.add_or_replace(slot.item);
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].item.key(), a);
        self.index.insert(self.heap[b].item.key(), b);
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.heap[pos].before(&self.heap[parent]) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut first = pos;
            if left < len && self.heap[left].before(&self.heap[first]) {
                first = left;
            }
            if right < len && self.heap[right].before(&self.heap[first]) {
                first = right;
            }
            if first == pos {
                break;
            }
            self.swap(pos, first);
            pos = first;
        }
    }

    #[cfg(test)]
    fn index_consistent(&self) -> bool {
        self.index.len() == self.heap.len()
            && self
                .heap
                .iter()
                .enumerate()
                .all(|(pos, slot)| self.index.get(&slot.item.key()) == Some(&pos))
    }
}
