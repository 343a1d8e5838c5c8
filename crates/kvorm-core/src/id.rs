//! Storage key naming scheme.
//!
//! - Entity hash: `e:<Type>:<id>`
//! - Set record owned by a field: `a:<EntityId>:<fieldStorageName>`
//! - Map record owned by a field: `m:<EntityId>:<fieldStorageName>`
//!
//! Collection keys are always derived from the owner's [`EntityId`] and the
//! field's storage name; they are never stored separately.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::value::{Value, TAG_ENTITY, TAG_MAP, TAG_SET};

/// The raw value of an identifier field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdValue {
    Int(i64),
    Str(String),
}

impl IdValue {
    /// Extracts an identifier from a field value. Only strings and numbers
    /// qualify; integral floats are narrowed to integers.
    pub fn from_value(value: &Value) -> Option<IdValue> {
        match value {
            Value::Str(s) => Some(IdValue::Str(s.clone())),
            Value::Int(n) => Some(IdValue::Int(*n)),
            Value::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(IdValue::Int(*f as i64)),
            Value::Float(f) if f.is_finite() => Some(IdValue::Str(f.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for IdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdValue::Int(n) => write!(f, "{n}"),
            IdValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for IdValue {
    fn from(n: i64) -> Self {
        IdValue::Int(n)
    }
}

impl From<i32> for IdValue {
    fn from(n: i32) -> Self {
        IdValue::Int(n as i64)
    }
}

impl From<&str> for IdValue {
    fn from(s: &str) -> Self {
        IdValue::Str(s.to_string())
    }
}

impl From<String> for IdValue {
    fn from(s: String) -> Self {
        IdValue::Str(s)
    }
}

/// Key of an entity's hash record, `e:<Type>:<id>`.
///
/// Also the encoding of an embedded reference to that entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(type_name: &str, id: &IdValue) -> Self {
        EntityId(format!("{TAG_ENTITY}{type_name}:{id}"))
    }

    /// Parses an `e:` key, validating that it names a type and an id.
    pub fn parse(key: &str) -> Result<Self, CoreError> {
        let rest = key
            .strip_prefix(TAG_ENTITY)
            .ok_or_else(|| invalid_key(key))?;
        match rest.split_once(':') {
            Some((ty, id)) if !ty.is_empty() && !id.is_empty() => Ok(EntityId(key.to_string())),
            _ => Err(invalid_key(key)),
        }
    }

    /// The entity type segment.
    pub fn type_name(&self) -> &str {
        self.parts().0
    }

    /// The identifier segment, as it appears in the key.
    pub fn id_part(&self) -> &str {
        self.parts().1
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn parts(&self) -> (&str, &str) {
        // Constructed by `new` or validated by `parse`.
        let rest = &self.0[TAG_ENTITY.len()..];
        rest.split_once(':').unwrap_or((rest, ""))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a collection record is a set or a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    Set,
    Map,
}

impl CollectionKind {
    fn tag(self) -> &'static str {
        match self {
            CollectionKind::Set => TAG_SET,
            CollectionKind::Map => TAG_MAP,
        }
    }
}

/// Key of the record backing a collection-typed field:
/// `a:<EntityId>:<field>` for sets, `m:<EntityId>:<field>` for maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionId(String);

impl CollectionId {
    pub fn new(kind: CollectionKind, owner: &EntityId, storage_name: &str) -> Self {
        CollectionId(format!("{}{owner}:{storage_name}", kind.tag()))
    }

    pub fn set(owner: &EntityId, storage_name: &str) -> Self {
        Self::new(CollectionKind::Set, owner, storage_name)
    }

    pub fn map(owner: &EntityId, storage_name: &str) -> Self {
        Self::new(CollectionKind::Map, owner, storage_name)
    }

    /// Parses an `a:` or `m:` key.
    pub fn parse(key: &str) -> Result<Self, CoreError> {
        let rest = key
            .strip_prefix(TAG_SET)
            .or_else(|| key.strip_prefix(TAG_MAP))
            .ok_or_else(|| invalid_key(key))?;
        let (owner, field) = rest.rsplit_once(':').ok_or_else(|| invalid_key(key))?;
        EntityId::parse(owner)?;
        if field.is_empty() {
            return Err(invalid_key(key));
        }
        Ok(CollectionId(key.to_string()))
    }

    pub fn kind(&self) -> CollectionKind {
        if self.0.starts_with(TAG_MAP) {
            CollectionKind::Map
        } else {
            CollectionKind::Set
        }
    }

    /// The owning entity's id.
    pub fn owner(&self) -> EntityId {
        let rest = &self.0[2..];
        let owner = rest.rsplit_once(':').map(|(o, _)| o).unwrap_or(rest);
        EntityId(owner.to_string())
    }

    /// The owning field's storage name.
    pub fn field(&self) -> &str {
        self.0.rsplit_once(':').map(|(_, f)| f).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Any key produced by the naming scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Entity(EntityId),
    Collection(CollectionId),
}

impl RecordKey {
    pub fn parse(key: &str) -> Result<Self, CoreError> {
        if key.starts_with(TAG_ENTITY) {
            EntityId::parse(key).map(RecordKey::Entity)
        } else {
            CollectionId::parse(key).map(RecordKey::Collection)
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RecordKey::Entity(id) => id.as_str(),
            RecordKey::Collection(id) => id.as_str(),
        }
    }
}

fn invalid_key(key: &str) -> CoreError {
    CoreError::InvalidKey {
        key: key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_and_collection_keys_follow_the_scheme() {
        let owner = EntityId::new("User", &IdValue::Int(7));
        assert_eq!(owner.as_str(), "e:User:7");
        assert_eq!(CollectionId::set(&owner, "tags").as_str(), "a:e:User:7:tags");
        assert_eq!(CollectionId::map(&owner, "meta").as_str(), "m:e:User:7:meta");
    }

    #[test]
    fn parses_ids_containing_colons() {
        let id = EntityId::new("Doc", &IdValue::from("2024:01:abc"));
        let parsed = EntityId::parse(id.as_str()).unwrap();
        assert_eq!(parsed.type_name(), "Doc");
        assert_eq!(parsed.id_part(), "2024:01:abc");

        let coll = CollectionId::set(&id, "pages");
        let parsed = CollectionId::parse(coll.as_str()).unwrap();
        assert_eq!(parsed.owner(), id);
        assert_eq!(parsed.field(), "pages");
        assert_eq!(parsed.kind(), CollectionKind::Set);
    }

    #[test]
    fn rejects_malformed_keys() {
        for key in ["User:1", "e:User", "e::1", "a:e:User:1", "m:x:y", "q:e:A:1:f"] {
            assert!(RecordKey::parse(key).is_err(), "{key} should be rejected");
        }
    }

    #[test]
    fn id_value_accepts_only_strings_and_numbers() {
        assert_eq!(IdValue::from_value(&Value::Int(3)), Some(IdValue::Int(3)));
        assert_eq!(IdValue::from_value(&Value::Float(3.0)), Some(IdValue::Int(3)));
        assert_eq!(IdValue::from_value(&Value::from("a")), Some(IdValue::from("a")));
        assert_eq!(IdValue::from_value(&Value::Bool(true)), None);
        assert_eq!(IdValue::from_value(&Value::Null), None);
    }
}
