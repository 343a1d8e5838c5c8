//! Planners: turn entities into storage mutations and load descriptions.
//!
//! - [`save`]: snapshot diff of an entity and its cascaded relations
//! - [`delete`]: removal of an entity's own records
//! - [`load`]: keys and relation mappings needed to fetch an entity
//!
//! All planning is synchronous and side-effect free. A [`Plan`] carries the
//! mutations plus the snapshot updates that become true once those mutations
//! have been applied; [`Plan::commit`] must only be called after the batch
//! was acknowledged.

pub mod delete;
pub mod load;
pub mod save;

use crate::entity::{Entity, EntityGraph, EntityKey, FieldValue, MapValue, SetValue};
use crate::error::CoreError;
use crate::id::{CollectionId, CollectionKind, EntityId, IdValue};
use crate::ops::PersistenceOperation;
use crate::schema::{EntitySchema, SchemaRegistry};
use crate::snapshot::PendingSnapshots;

pub use delete::DeletePlanner;
pub use load::LoadPlanner;
pub use save::SavePlanner;

/// A staged lazy collection that becomes storage-backed once saved.
#[derive(Debug, Clone, PartialEq)]
struct Rebind {
    key: EntityKey,
    field: String,
    collection: CollectionId,
}

/// Output of the save and delete planners.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub operation: PersistenceOperation,
    pub snapshots: PendingSnapshots,
    rebinds: Vec<Rebind>,
}

impl Plan {
    /// True when the plan needs no storage round trip.
    pub fn is_empty(&self) -> bool {
        self.operation.is_empty()
    }

    /// Applies the snapshot updates and rebinds staged lazy collections to
    /// their storage records.
    pub fn commit(self, graph: &mut EntityGraph) -> Result<(), CoreError> {
        graph.snapshots_mut().apply(self.snapshots);
        for rebind in self.rebinds {
            let backed = match rebind.collection.kind() {
                CollectionKind::Set => FieldValue::Set(SetValue::Backed(rebind.collection)),
                CollectionKind::Map => FieldValue::Map(MapValue::Backed(rebind.collection)),
            };
            graph.set(rebind.key, &rebind.field, backed)?;
        }
        Ok(())
    }

    fn rebind(&mut self, key: EntityKey, field: &str, collection: CollectionId) {
        self.rebinds.push(Rebind {
            key,
            field: field.to_string(),
            collection,
        });
    }
}

/// Computes the [`EntityId`] of a live instance.
pub fn entity_id(
    registry: &SchemaRegistry,
    graph: &EntityGraph,
    key: EntityKey,
) -> Result<EntityId, CoreError> {
    let entity = graph.entity(key)?;
    let schema = registry.resolve(entity.type_name())?;
    identity_of(schema, entity)
}

/// Reads the identifier field of `entity` and builds its [`EntityId`].
pub(crate) fn identity_of(schema: &EntitySchema, entity: &Entity) -> Result<EntityId, CoreError> {
    let field = schema.identifier()?;
    let value = entity.get(&field.name);
    let id = match value {
        Some(FieldValue::Value(v)) => IdValue::from_value(v),
        _ => None,
    };
    match id {
        Some(IdValue::Str(s)) if s.is_empty() => Err(empty_identifier(schema)),
        Some(id) => Ok(EntityId::new(schema.name(), &id)),
        None => Err(CoreError::Identity {
            type_name: schema.name().to_string(),
            field: field.name.clone(),
            reason: if value.is_none() {
                "identifier is not set".to_string()
            } else {
                "identifier must be a string or a number".to_string()
            },
        }),
    }
}

/// An empty identifier would produce a key with no id segment.
pub(crate) fn empty_identifier(schema: &EntitySchema) -> CoreError {
    CoreError::Identity {
        type_name: schema.name().to_string(),
        field: schema
            .identifier()
            .map(|f| f.name.clone())
            .unwrap_or_default(),
        reason: "identifier must not be empty".to_string(),
    }
}
