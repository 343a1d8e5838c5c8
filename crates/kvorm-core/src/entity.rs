//! In-memory entity arena.
//!
//! Live entities are owned by an [`EntityGraph`] and addressed by
//! [`EntityKey`]. Relation fields hold keys rather than owned values, so shared
//! and cyclic graphs are ordinary data: two fields pointing at the same
//! instance hold the same key, and "same object" means "same key".
//!
//! The graph also owns the [`SnapshotStore`] for its entities. Snapshots are
//! keyed by `(EntityKey, field)` and are never reachable through an entity's
//! own field API.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::CollectionId;
use crate::snapshot::SnapshotStore;
use crate::value::Value;

/// Stable identity of one entity instance within an [`EntityGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey(pub u32);

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A collection member or map entry value: a scalar or an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Member {
    Value(Value),
    Entity(EntityKey),
}

impl Member {
    pub fn as_entity(&self) -> Option<EntityKey> {
        match self {
            Member::Entity(key) => Some(*key),
            Member::Value(_) => None,
        }
    }
}

impl From<EntityKey> for Member {
    fn from(key: EntityKey) -> Self {
        Member::Entity(key)
    }
}

impl From<Value> for Member {
    fn from(v: Value) -> Self {
        Member::Value(v)
    }
}

/// Runtime representation of a set-typed field.
///
/// The schema only says "this field is a set"; which variant backs it is a
/// property of the instance.
#[derive(Debug, Clone, PartialEq)]
pub enum SetValue {
    /// Members held in memory and diffed wholesale on save.
    Live(Vec<Member>),
    /// Lazy set whose owner has never been saved. Every member is new.
    Staged(Vec<Member>),
    /// Lazy set bound to its storage record. Mutations go straight to storage.
    Backed(CollectionId),
}

/// Runtime representation of a map-typed field. Later entries with an equal
/// key replace earlier ones.
#[derive(Debug, Clone, PartialEq)]
pub enum MapValue {
    Live(Vec<(Value, Member)>),
    Staged(Vec<(Value, Member)>),
    Backed(CollectionId),
}

/// The value held by one entity field. An absent field is "undefined".
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Value(Value),
    Entity(EntityKey),
    Set(SetValue),
    Map(MapValue),
}

impl FieldValue {
    /// A live set of the given members.
    pub fn set<I, M>(members: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<Member>,
    {
        FieldValue::Set(SetValue::Live(members.into_iter().map(Into::into).collect()))
    }

    /// A live map of the given entries.
    pub fn map<I, K, M>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, M)>,
        K: Into<Value>,
        M: Into<Member>,
    {
        FieldValue::Map(MapValue::Live(
            entries
                .into_iter()
                .map(|(k, m)| (k.into(), m.into()))
                .collect(),
        ))
    }

    /// An empty staged lazy set.
    pub fn staged_set() -> Self {
        FieldValue::Set(SetValue::Staged(Vec::new()))
    }

    /// An empty staged lazy map.
    pub fn staged_map() -> Self {
        FieldValue::Map(MapValue::Staged(Vec::new()))
    }

    pub fn null() -> Self {
        FieldValue::Value(Value::Null)
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            FieldValue::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<EntityKey> {
        match self {
            FieldValue::Entity(key) => Some(*key),
            _ => None,
        }
    }
}

impl From<EntityKey> for FieldValue {
    fn from(key: EntityKey) -> Self {
        FieldValue::Entity(key)
    }
}

impl From<SetValue> for FieldValue {
    fn from(set: SetValue) -> Self {
        FieldValue::Set(set)
    }
}

impl From<MapValue> for FieldValue {
    fn from(map: MapValue) -> Self {
        FieldValue::Map(map)
    }
}

impl From<Value> for FieldValue {
    fn from(v: Value) -> Self {
        FieldValue::Value(v)
    }
}

macro_rules! scalar_conversions {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Member {
                fn from(v: $ty) -> Self {
                    Member::Value(Value::from(v))
                }
            }

            impl From<$ty> for FieldValue {
                fn from(v: $ty) -> Self {
                    FieldValue::Value(Value::from(v))
                }
            }
        )*
    };
}

scalar_conversions!(i64, i32, f64, bool, &str, String, serde_json::Value);

/// A plain data holder: a type name and its field values.
#[derive(Debug, Clone)]
pub struct Entity {
    type_name: String,
    fields: IndexMap<String, FieldValue>,
}

impl Entity {
    pub fn new(type_name: impl Into<String>) -> Self {
        Entity {
            type_name: type_name.into(),
            fields: IndexMap::new(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn get_mut(&mut self, field: &str) -> Option<&mut FieldValue> {
        self.fields.get_mut(field)
    }

    pub fn set(&mut self, field: &str, value: impl Into<FieldValue>) {
        self.fields.insert(field.to_string(), value.into());
    }

    /// Makes the field undefined, returning its previous value.
    pub fn unset(&mut self, field: &str) -> Option<FieldValue> {
        self.fields.shift_remove(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Arena of live entities plus their snapshot side table.
#[derive(Debug, Clone, Default)]
pub struct EntityGraph {
    entities: Vec<Entity>,
    snapshots: SnapshotStore,
}

impl EntityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new, field-less instance of `type_name`.
    pub fn create(&mut self, type_name: &str) -> EntityKey {
        self.insert(Entity::new(type_name))
    }

    pub fn insert(&mut self, entity: Entity) -> EntityKey {
        let key = EntityKey(self.entities.len() as u32);
        self.entities.push(entity);
        key
    }

    pub fn entity(&self, key: EntityKey) -> Result<&Entity, CoreError> {
        self.entities
            .get(key.0 as usize)
            .ok_or(CoreError::EntityNotFound { key })
    }

    pub fn entity_mut(&mut self, key: EntityKey) -> Result<&mut Entity, CoreError> {
        self.entities
            .get_mut(key.0 as usize)
            .ok_or(CoreError::EntityNotFound { key })
    }

    /// Field value, or `None` when the field is undefined or the key unknown.
    pub fn get(&self, key: EntityKey, field: &str) -> Option<&FieldValue> {
        self.entities.get(key.0 as usize)?.get(field)
    }

    /// Follows a single relation field.
    pub fn related(&self, key: EntityKey, field: &str) -> Option<EntityKey> {
        self.get(key, field)?.as_entity()
    }

    pub fn set(
        &mut self,
        key: EntityKey,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> Result<(), CoreError> {
        self.entity_mut(key)?.set(field, value);
        Ok(())
    }

    pub fn unset(&mut self, key: EntityKey, field: &str) -> Result<Option<FieldValue>, CoreError> {
        Ok(self.entity_mut(key)?.unset(field))
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = EntityKey> {
        (0..self.entities.len() as u32).map(EntityKey)
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn snapshots_mut(&mut self) -> &mut SnapshotStore {
        &mut self.snapshots
    }
}
