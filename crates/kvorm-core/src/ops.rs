//! Plan types produced by the planners.
//!
//! These are pure data. A [`PersistenceOperation`] lists the storage
//! mutations a save or delete needs; a [`LoadOperation`] lists what to fetch
//! for one entity and where its embedded references will be found. Neither
//! carries fetched data or performs I/O.

use indexmap::IndexMap;
use serde::Serialize;

use crate::id::{CollectionId, EntityId};
use crate::value::EncodedValue;

/// Field writes and removals on one hash record (entity or map).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HashUpsert {
    pub id: String,
    pub changed_fields: IndexMap<String, EncodedValue>,
    pub deleted_fields: Vec<String>,
}

impl HashUpsert {
    pub fn new(id: impl Into<String>) -> Self {
        HashUpsert {
            id: id.into(),
            changed_fields: IndexMap::new(),
            deleted_fields: Vec::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.changed_fields.is_empty() && self.deleted_fields.is_empty()
    }
}

/// Member additions and removals on one set record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetUpsert {
    pub id: String,
    pub added: Vec<EncodedValue>,
    pub removed: Vec<EncodedValue>,
}

impl SetUpsert {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// The minimal set of storage mutations for a save or delete.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PersistenceOperation {
    pub hash_upserts: Vec<HashUpsert>,
    pub hash_deletes: Vec<String>,
    pub set_upserts: Vec<SetUpsert>,
    pub set_deletes: Vec<String>,
}

impl PersistenceOperation {
    /// True when executing the operation would change nothing. Empty
    /// operations must not reach the transport.
    pub fn is_empty(&self) -> bool {
        self.hash_upserts.iter().all(HashUpsert::is_noop)
            && self.set_upserts.iter().all(SetUpsert::is_noop)
            && self.hash_deletes.is_empty()
            && self.set_deletes.is_empty()
    }

    /// Appends another operation's mutations.
    pub fn merge(&mut self, other: PersistenceOperation) {
        self.hash_upserts.extend(other.hash_upserts);
        self.hash_deletes.extend(other.hash_deletes);
        self.set_upserts.extend(other.set_upserts);
        self.set_deletes.extend(other.set_deletes);
    }

    /// Total number of individual mutations, counting each field and member.
    pub fn mutation_count(&self) -> usize {
        let hashes: usize = self
            .hash_upserts
            .iter()
            .map(|u| u.changed_fields.len() + u.deleted_fields.len())
            .sum();
        let sets: usize = self
            .set_upserts
            .iter()
            .map(|u| u.added.len() + u.removed.len())
            .sum();
        hashes + sets + self.hash_deletes.len() + self.set_deletes.len()
    }

    pub fn upsert_for(&self, id: &str) -> Option<&HashUpsert> {
        self.hash_upserts.iter().find(|u| u.id == id)
    }

    pub fn set_upsert_for(&self, id: &str) -> Option<&SetUpsert> {
        self.set_upserts.iter().find(|u| u.id == id)
    }
}

/// Where an embedded entity reference lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "key", rename_all = "lowercase")]
pub enum Lookup {
    /// A hash field of the owner, by storage name.
    Field(String),
    /// Members of a set record.
    Set(CollectionId),
    /// Values of a map record.
    Map(CollectionId),
}

/// Tells the load driver which type the references at `lookup` point to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationMapping {
    pub owner_id: EntityId,
    pub target_type: String,
    pub lookup: Lookup,
}

/// Structural description of what to fetch for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadOperation {
    pub root_id: EntityId,
    /// Collection records owned by the root that must be fetched with it.
    pub owned_keys: Vec<CollectionId>,
    pub relation_mappings: Vec<RelationMapping>,
}

impl LoadOperation {
    /// Every key this operation needs fetched: the root hash first.
    pub fn fetch_keys(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.root_id.as_str()).chain(self.owned_keys.iter().map(|k| k.as_str()))
    }
}
