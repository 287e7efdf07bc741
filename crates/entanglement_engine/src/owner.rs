//! Owners, epochs and serial numbers.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Timelike, Utc};
use entanglement_protocol::DestHash;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// A restart marker for an owner's serial sequence.
///
/// Encoded as RFC 3339 with microsecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(DateTime<Utc>);

impl Epoch {
    /// The current time, truncated to what the wire can carry.
    pub fn now() -> Self {
        let now = Utc::now();
        let truncated = now.with_nanosecond(now.nanosecond() / 1000 * 1000);
        Self(truncated.unwrap_or(now))
    }

    /// A fresh epoch guaranteed to differ from `previous`.
    pub fn after(previous: Epoch) -> Self {
        let next = Self::now();
        if next.0 > previous.0 {
            next
        } else {
            Self(previous.0 + ChronoDuration::microseconds(1))
        }
    }

    /// Wire form.
    pub fn to_wire(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Parses the wire form.
    pub fn from_wire(text: &str) -> SyncResult<Self> {
        DateTime::parse_from_rfc3339(text)
            .map(|dt| Self(dt.with_timezone(&Utc)))
            .map_err(|e| SyncError::BadEncoding(format!("bad epoch {text}: {e}")))
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// An authoritative source of objects.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnerRecord {
    /// Owner id.
    pub id: Uuid,
    /// Peer the owner lives behind; `None` for local owners.
    pub dest: Option<DestHash>,
    /// Highest serial received from upstream.
    pub incoming_serial: u64,
    /// Highest serial advertised downstream.
    pub outgoing_serial: u64,
    /// Epoch expected from upstream.
    pub incoming_epoch: Option<Epoch>,
    /// Epoch advertised for local owners.
    pub outgoing_epoch: Epoch,
}

impl OwnerRecord {
    pub(crate) fn local() -> Self {
        Self {
            id: Uuid::new_v4(),
            dest: None,
            incoming_serial: 0,
            outgoing_serial: 0,
            incoming_epoch: None,
            outgoing_epoch: Epoch::now(),
        }
    }

    pub(crate) fn remote(id: Uuid, dest: DestHash, epoch: Option<Epoch>) -> Self {
        Self {
            id,
            dest: Some(dest),
            incoming_serial: 0,
            outgoing_serial: 0,
            incoming_epoch: epoch,
            outgoing_epoch: epoch.unwrap_or_else(Epoch::now),
        }
    }

    /// True if this endpoint is the owner.
    pub fn is_local(&self) -> bool {
        self.dest.is_none()
    }

    /// Epoch sent to peers: our own for local owners, upstream's otherwise.
    pub fn advertised_epoch(&self) -> Epoch {
        match (self.dest, self.incoming_epoch) {
            (Some(_), Some(epoch)) => epoch,
            _ => self.outgoing_epoch,
        }
    }
}

/// Every owner this endpoint knows, plus the local serial counter.
#[derive(Debug, Default)]
pub(crate) struct OwnerTable {
    owners: HashMap<Uuid, OwnerRecord>,
    order: Vec<Uuid>,
    serial: u64,
}

impl OwnerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &Uuid) -> Option<&OwnerRecord> {
        self.owners.get(id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut OwnerRecord> {
        self.owners.get_mut(id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.owners.contains_key(id)
    }

    pub fn insert(&mut self, record: OwnerRecord) {
        if self.owners.insert(record.id, record.clone()).is_none() {
            self.order.push(record.id);
        }
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<OwnerRecord> {
        let removed = self.owners.remove(id)?;
        self.order.retain(|known| known != id);
        Some(removed)
    }

    /// Owners in the order they became known.
    pub fn iter(&self) -> impl Iterator<Item = &OwnerRecord> {
        self.order.iter().filter_map(|id| self.owners.get(id))
    }

    pub fn local_ids(&self) -> Vec<Uuid> {
        self.iter().filter(|o| o.is_local()).map(|o| o.id).collect()
    }

    /// Owners living behind `dest`.
    pub fn owned_by(&self, dest: &DestHash) -> Vec<Uuid> {
        self.iter()
            .filter(|o| o.dest.as_ref() == Some(dest))
            .map(|o| o.id)
            .collect()
    }

    /// Returns the first local owner, creating one if none exists.
    pub fn ensure_local(&mut self) -> Uuid {
        if let Some(id) = self.iter().find(|o| o.is_local()).map(|o| o.id) {
            return id;
        }
        let record = OwnerRecord::local();
        let id = record.id;
        self.insert(record);
        id
    }

    /// Allocates the next local serial.
    pub fn next_serial(&mut self) -> u64 {
        self.serial += 1;
        self.serial
    }

    #[cfg(test)]
    pub fn current_serial(&self) -> u64 {
        self.serial
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_wire_form_has_micros() {
        let epoch = Epoch::from_wire("2024-03-01T12:00:00.123456Z").unwrap();
        assert_eq!(epoch.to_wire(), "2024-03-01T12:00:00.123456Z");
        assert_eq!(Epoch::from_wire(&epoch.to_wire()).unwrap(), epoch);
        assert!(Epoch::from_wire("yesterday").is_err());
    }

    #[test]
    fn epoch_after_always_advances() {
        let first = Epoch::now();
        let second = Epoch::after(first);
        let third = Epoch::after(second);
        assert!(second > first);
        assert!(third > second);
    }

    #[test]
    fn remote_owner_advertises_upstream_epoch() {
        let upstream = Epoch::from_wire("2020-01-01T00:00:00.000001Z").unwrap();
        let owner = OwnerRecord::remote(Uuid::new_v4(), DestHash::from_string("a"), Some(upstream));
        assert!(!owner.is_local());
        assert_eq!(owner.advertised_epoch(), upstream);

        let local = OwnerRecord::local();
        assert!(local.is_local());
        assert_eq!(local.advertised_epoch(), local.outgoing_epoch);
    }

    #[test]
    fn ensure_local_is_idempotent() {
        let mut table = OwnerTable::new();
        let dest = DestHash::from_string("peer");
        table.insert(OwnerRecord::remote(Uuid::new_v4(), dest, None));

        let id = table.ensure_local();
        assert_eq!(table.ensure_local(), id);
        assert_eq!(table.local_ids(), vec![id]);
        assert_eq!(table.owned_by(&dest).len(), 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn serials_increase() {
        let mut table = OwnerTable::new();
        assert_eq!(table.current_serial(), 0);
        assert_eq!(table.next_serial(), 1);
        assert_eq!(table.next_serial(), 2);
    }

    #[test]
    fn iteration_follows_insertion_order() {
        let mut table = OwnerTable::new();
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            table.insert(OwnerRecord::remote(*id, DestHash::from_string("p"), None));
        }
        table.remove(&ids[2]);
        let seen: Vec<Uuid> = table.iter().map(|o| o.id).collect();
        assert_eq!(seen, vec![ids[0], ids[1], ids[3], ids[4]]);
    }
}
