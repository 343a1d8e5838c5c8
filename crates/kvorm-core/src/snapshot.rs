//! Out-of-band shadow state for diffing.
//!
//! One [`Snapshot`] per `(entity instance, field)` records what was last
//! persisted for that field. Planners read snapshots and produce
//! [`PendingSnapshots`]; nothing is written to the store until the caller has
//! confirmed that the whole mutation batch succeeded.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::entity::EntityKey;
use crate::value::EncodedValue;

/// Last-persisted contents of a collection record.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionSnapshot {
    /// Encoded members in the order they were persisted.
    Set(Vec<EncodedValue>),
    /// Encoded key to encoded value.
    Map(IndexMap<EncodedValue, EncodedValue>),
}

/// Shadow record for one field of one instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// `None` when the field was never stored or was removed.
    pub last_value: Option<EncodedValue>,
    /// Only present for collection fields that had contents.
    pub last_collection: Option<CollectionSnapshot>,
}

impl Snapshot {
    pub fn value(encoded: Option<EncodedValue>) -> Self {
        Snapshot {
            last_value: encoded,
            last_collection: None,
        }
    }
}

/// Side table of snapshots keyed by instance and field name.
#[derive(Debug, Clone, Default)]
pub struct SnapshotStore {
    slots: HashMap<EntityKey, HashMap<String, Snapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, key: EntityKey, field: &str) -> Option<&Snapshot> {
        self.slots.get(&key)?.get(field)
    }

    pub fn write(&mut self, key: EntityKey, field: &str, snapshot: Snapshot) {
        self.slots
            .entry(key)
            .or_default()
            .insert(field.to_string(), snapshot);
    }

    pub fn clear(&mut self, key: EntityKey, field: &str) {
        if let Some(fields) = self.slots.get_mut(&key) {
            fields.remove(field);
        }
    }

    /// Drops every snapshot of one instance.
    pub fn clear_entity(&mut self, key: EntityKey) {
        self.slots.remove(&key);
    }

    /// True when any snapshot exists for the instance.
    pub fn contains(&self, key: EntityKey) -> bool {
        self.slots.get(&key).is_some_and(|f| !f.is_empty())
    }

    pub fn apply(&mut self, pending: PendingSnapshots) {
        for key in pending.clears {
            self.clear_entity(key);
        }
        for (key, field, snapshot) in pending.writes {
            self.write(key, &field, snapshot);
        }
    }
}

/// Snapshot changes that take effect once their batch is acknowledged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingSnapshots {
    writes: Vec<(EntityKey, String, Snapshot)>,
    clears: Vec<EntityKey>,
}

impl PendingSnapshots {
    pub fn write(&mut self, key: EntityKey, field: &str, snapshot: Snapshot) {
        self.writes.push((key, field.to_string(), snapshot));
    }

    pub fn clear_entity(&mut self, key: EntityKey) {
        self.clears.push(key);
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.clears.is_empty()
    }

    pub fn writes(&self) -> &[(EntityKey, String, Snapshot)] {
        &self.writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_changes_apply_clears_before_writes() {
        let mut store = SnapshotStore::new();
        let key = EntityKey(0);
        store.write(key, "old", Snapshot::value(Some(EncodedValue::from_raw("s:x"))));

        let mut pending = PendingSnapshots::default();
        pending.clear_entity(key);
        pending.write(key, "new", Snapshot::value(Some(EncodedValue::from_raw("i:1"))));
        store.apply(pending);

        assert!(store.read(key, "old").is_none());
        assert_eq!(
            store.read(key, "new").unwrap().last_value.as_ref().unwrap().as_str(),
            "i:1"
        );
    }

    #[test]
    fn clear_removes_single_field() {
        let mut store = SnapshotStore::new();
        let key = EntityKey(3);
        store.write(key, "a", Snapshot::default());
        store.write(key, "b", Snapshot::default());
        store.clear(key, "a");
        assert!(store.read(key, "a").is_none());
        assert!(store.read(key, "b").is_some());
        store.clear_entity(key);
        assert!(!store.contains(key));
    }
}
