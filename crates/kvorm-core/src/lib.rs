//! Planning and hydration core for persisting object graphs in a key/value
//! store. Everything in this crate is synchronous and performs no I/O; the
//! storage crate executes the operations planned here.

pub mod value;
pub mod id;
pub mod schema;
pub mod entity;
pub mod snapshot;
pub mod ops;
pub mod plan;
pub mod hydrate;
pub mod error;

// Re-export commonly used types
pub use value::{decode, encode, Decoded, EncodedValue, Value};
pub use id::{CollectionId, CollectionKind, EntityId, IdValue, RecordKey};
pub use schema::{Cascade, EntitySchema, FieldKind, FieldSchema, RelationSpec, SchemaRegistry};
pub use entity::{Entity, EntityGraph, EntityKey, FieldValue, MapValue, Member, SetValue};
pub use snapshot::{CollectionSnapshot, PendingSnapshots, Snapshot, SnapshotStore};
pub use ops::{HashUpsert, LoadOperation, Lookup, PersistenceOperation, RelationMapping, SetUpsert};
pub use plan::{entity_id, DeletePlanner, LoadPlanner, Plan, SavePlanner};
pub use hydrate::{Hydrator, RawData, RawRecord};
pub use error::CoreError;
