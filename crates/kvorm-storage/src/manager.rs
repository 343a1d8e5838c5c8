//! [`EntityManager`]: runs planned operations against a [`KeyValueStore`].
//!
//! Saves and removals are planned synchronously by kvorm-core, sent as one
//! command batch, and committed to the snapshot store only after the whole
//! batch was acknowledged. A failed batch leaves snapshots untouched; use
//! [`EntityManager::reset_snapshots`] to force the next save to rewrite
//! every field.
//!
//! Loads run in waves. Each wave fetches every known-but-unfetched key in
//! one round trip, then inspects the fetched records for entity references
//! that have not been planned yet. The next wave fetches those. When a wave
//! discovers nothing new, the accumulated records are hydrated in one pass.
//! Round trips are therefore bounded by graph depth, not node count.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use kvorm_core::hydrate::{Hydrator, RawData, RawRecord};
use kvorm_core::ops::{LoadOperation, Lookup, PersistenceOperation, RelationMapping};
use kvorm_core::schema::FieldKind;
use kvorm_core::value::{decode, decode_scalar, Decoded, TAG_ENTITY, TAG_SET};
use kvorm_core::{
    entity_id, CoreError, DeletePlanner, EntityGraph, EntityId, EntityKey, FieldValue, IdValue,
    LoadPlanner, MapValue, Member, SavePlanner, SchemaRegistry, SetValue, Value,
};

use crate::config::EngineConfig;
use crate::error::StorageError;
use crate::lazy::{BackedMap, BackedSet, MapAdapter, SetAdapter, StagedMap, StagedSet};
use crate::traits::KeyValueStore;
use crate::types::Command;

/// Persists and loads entity graphs through a [`KeyValueStore`].
pub struct EntityManager<S> {
    store: Arc<S>,
    registry: Arc<SchemaRegistry>,
    config: EngineConfig,
}

impl<S> Clone for EntityManager<S> {
    fn clone(&self) -> Self {
        EntityManager {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
        }
    }
}

impl<S: KeyValueStore> EntityManager<S> {
    pub fn new(store: S, registry: SchemaRegistry) -> Self {
        Self::with_config(Arc::new(store), Arc::new(registry), EngineConfig::default())
    }

    pub fn with_config(
        store: Arc<S>,
        registry: Arc<SchemaRegistry>,
        config: EngineConfig,
    ) -> Self {
        EntityManager {
            store,
            registry,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -------------------------------------------------------------------
    // Save and remove
    // -------------------------------------------------------------------

    /// Saves `key` and everything it cascades to. An unchanged graph makes
    /// no round trip.
    pub async fn save(&self, graph: &mut EntityGraph, key: EntityKey) -> Result<(), StorageError> {
        let root = entity_id(&self.registry, graph, key)?;
        let plan = SavePlanner::new(&self.registry, graph).plan(key)?;
        if plan.is_empty() {
            tracing::debug!(entity = %root, "save planned no mutations");
            plan.commit(graph)?;
            return Ok(());
        }

        let mutations = plan.operation.mutation_count();
        self.run(&plan.operation).await?;
        plan.commit(graph)?;
        tracing::info!(entity = %root, mutations, "saved entity");
        Ok(())
    }

    /// Deletes the entity's own records. Related entities are kept.
    pub async fn remove(&self, graph: &mut EntityGraph, key: EntityKey) -> Result<(), StorageError> {
        let root = entity_id(&self.registry, graph, key)?;
        let plan = DeletePlanner::new(&self.registry).plan_entity(graph, key)?;
        let mutations = plan.operation.mutation_count();
        self.run(&plan.operation).await?;
        plan.commit(graph)?;
        tracing::info!(entity = %root, mutations, "removed entity");
        Ok(())
    }

    /// Deletes entities known only by type and id, in one batch.
    pub async fn remove_by_id(&self, type_name: &str, ids: &[IdValue]) -> Result<(), StorageError> {
        let planner = DeletePlanner::new(&self.registry);
        let mut operation = PersistenceOperation::default();
        for id in ids {
            operation.merge(planner.plan_id(type_name, id)?.operation);
        }
        if operation.is_empty() {
            return Ok(());
        }
        self.run(&operation).await?;
        tracing::info!(type_name, count = ids.len(), "removed entities by id");
        Ok(())
    }

    /// Whether an entity hash exists.
    pub async fn has(&self, type_name: &str, id: impl Into<IdValue>) -> Result<bool, StorageError> {
        let schema = self.registry.resolve(type_name)?;
        let key = EntityId::new(schema.name(), &id.into());
        self.store
            .execute_one(Command::Exists(key.to_string()))
            .await?
            .into_bool("EXISTS")
    }

    /// Forgets every snapshot of `key`, so its next save rewrites all fields.
    pub fn reset_snapshots(&self, graph: &mut EntityGraph, key: EntityKey) {
        graph.snapshots_mut().clear_entity(key);
    }

    async fn run(&self, operation: &PersistenceOperation) -> Result<(), StorageError> {
        let commands = commands_for(operation);
        let count = commands.len();
        let replies = self.store.execute(commands).await?;
        if replies.len() != count {
            return Err(StorageError::Connection(format!(
                "expected {count} replies, got {}",
                replies.len()
            )));
        }
        tracing::debug!(commands = count, "executed batch");
        Ok(())
    }

    // -------------------------------------------------------------------
    // Load
    // -------------------------------------------------------------------

    pub async fn load(
        &self,
        graph: &mut EntityGraph,
        type_name: &str,
        id: impl Into<IdValue>,
    ) -> Result<Option<EntityKey>, StorageError> {
        let loaded = self
            .load_with(graph, type_name, &[id.into()], &HashSet::new())
            .await?;
        Ok(loaded.into_iter().next().flatten())
    }

    pub async fn load_many(
        &self,
        graph: &mut EntityGraph,
        type_name: &str,
        ids: &[IdValue],
    ) -> Result<Vec<Option<EntityKey>>, StorageError> {
        self.load_with(graph, type_name, ids, &HashSet::new()).await
    }

    /// Loads `ids` of `type_name` with every reachable related entity.
    ///
    /// `skip_fields` names relation fields of the root type that are neither
    /// fetched nor resolved. Returns one entry per id, `None` where the
    /// entity does not exist.
    pub async fn load_with(
        &self,
        graph: &mut EntityGraph,
        type_name: &str,
        ids: &[IdValue],
        skip_fields: &HashSet<String>,
    ) -> Result<Vec<Option<EntityKey>>, StorageError> {
        let planner = LoadPlanner::new(&self.registry);
        let mut roots = Vec::with_capacity(ids.len());
        let mut planned: HashSet<EntityId> = HashSet::new();
        let mut pending: Vec<LoadOperation> = Vec::new();
        for id in ids {
            let op = planner.plan_id(id, type_name, skip_fields)?;
            roots.push(op.as_ref().map(|op| op.root_id.clone()));
            if let Some(op) = op {
                if planned.insert(op.root_id.clone()) {
                    pending.push(op);
                }
            }
        }

        let no_skips = HashSet::new();
        let mut raw = RawData::new();
        let mut wave = 0;
        while !pending.is_empty() {
            if wave == self.config.max_load_waves {
                return Err(StorageError::Config(format!(
                    "loading {type_name} exceeded {} waves",
                    self.config.max_load_waves
                )));
            }
            wave += 1;

            let keys: IndexSet<String> = pending
                .iter()
                .flat_map(LoadOperation::fetch_keys)
                .filter(|key| !raw.contains_key(*key))
                .map(str::to_string)
                .collect();
            self.fetch(&keys, &mut raw).await?;

            let mut discovered = Vec::new();
            for mapping in pending.iter().flat_map(|op| &op.relation_mappings) {
                for reference in references(&raw, mapping) {
                    let id = EntityId::parse(reference)?;
                    if !planned.insert(id.clone()) {
                        continue;
                    }
                    if id.type_name() != mapping.target_type {
                        tracing::warn!(
                            reference,
                            declared = %mapping.target_type,
                            "reference type differs from the relation's declared target"
                        );
                    }
                    if let Some(op) = planner.plan(id.id_part(), id.type_name(), &no_skips)? {
                        discovered.push(op);
                    }
                }
            }
            tracing::debug!(
                wave,
                fetched = keys.len(),
                discovered = discovered.len(),
                "load wave"
            );
            pending = discovered;
        }

        let present: Vec<EntityId> = roots.iter().flatten().cloned().collect();
        let mut hydrated = Hydrator::new(&self.registry, &raw)
            .hydrate(graph, &present)?
            .into_iter();
        Ok(roots
            .into_iter()
            .map(|root| root.and_then(|_| hydrated.next().flatten()))
            .collect())
    }

    async fn fetch(&self, keys: &IndexSet<String>, raw: &mut RawData) -> Result<(), StorageError> {
        if keys.is_empty() {
            return Ok(());
        }
        let commands = keys
            .iter()
            .map(|key| {
                if key.starts_with(TAG_SET) {
                    Command::SMembers(key.clone())
                } else {
                    Command::HGetAll(key.clone())
                }
            })
            .collect();
        let replies = self.store.execute(commands).await?;
        if replies.len() != keys.len() {
            return Err(StorageError::Connection(format!(
                "expected {} replies, got {}",
                keys.len(),
                replies.len()
            )));
        }
        for (key, reply) in keys.iter().zip(replies) {
            let record = if key.starts_with(TAG_SET) {
                RawRecord::Set(reply.into_members("SMEMBERS")?)
            } else {
                RawRecord::Hash(reply.into_hash("HGETALL")?)
            };
            raw.insert(key.clone(), record);
        }
        Ok(())
    }

    /// Resolves stored member encodings, loading referenced entities in one
    /// wave-driven load per type. Positions are kept; references to missing
    /// entities resolve to `None`.
    pub(crate) async fn resolve_members(
        &self,
        graph: &mut EntityGraph,
        raws: &[String],
    ) -> Result<Vec<Option<Member>>, StorageError> {
        enum Pending {
            Value(Value),
            Entity(EntityId),
            Skip,
        }

        let mut by_type: IndexMap<String, Vec<IdValue>> = IndexMap::new();
        let mut pending = Vec::with_capacity(raws.len());
        for raw in raws {
            match decode(raw)? {
                Decoded::Value(v) => pending.push(Pending::Value(v)),
                Decoded::Reference(r) if r.starts_with(TAG_ENTITY) => {
                    let id = EntityId::parse(&r)?;
                    by_type
                        .entry(id.type_name().to_string())
                        .or_default()
                        .push(IdValue::Str(id.id_part().to_string()));
                    pending.push(Pending::Entity(id));
                }
                Decoded::Reference(r) => {
                    tracing::debug!(reference = %r, "collections cannot be collection members");
                    pending.push(Pending::Skip);
                }
            }
        }

        let mut resolved: HashMap<EntityId, EntityKey> = HashMap::new();
        for (type_name, ids) in by_type {
            let keys = self.load_many(graph, &type_name, &ids).await?;
            for (id, key) in ids.iter().zip(keys) {
                if let Some(key) = key {
                    resolved.insert(EntityId::new(&type_name, id), key);
                }
            }
        }

        Ok(pending
            .into_iter()
            .map(|p| match p {
                Pending::Value(v) => Some(Member::Value(v)),
                Pending::Entity(id) => resolved.get(&id).map(|key| Member::Entity(*key)),
                Pending::Skip => None,
            })
            .collect())
    }

    /// Resolves hash entries of a map record: keys are scalars, values are
    /// members.
    pub(crate) async fn resolve_entries(
        &self,
        graph: &mut EntityGraph,
        entries: Vec<(String, String)>,
    ) -> Result<Vec<(Value, Member)>, StorageError> {
        let (keys, values): (Vec<String>, Vec<String>) = entries.into_iter().unzip();
        let members = self.resolve_members(graph, &values).await?;
        let mut out = Vec::with_capacity(keys.len());
        for (key, member) in keys.iter().zip(members) {
            if let Some(member) = member {
                out.push((decode_scalar(key)?, member));
            }
        }
        Ok(out)
    }

    // -------------------------------------------------------------------
    // Lazy collections
    // -------------------------------------------------------------------

    /// Adapter for a lazy set field: staged while the field is held in
    /// memory, storage-backed once it is bound to its record.
    pub fn lazy_set(
        &self,
        graph: &EntityGraph,
        owner: EntityKey,
        field: &str,
    ) -> Result<SetAdapter<'_, S>, StorageError> {
        let entity = graph.entity(owner)?;
        let schema = self.registry.resolve(entity.type_name())?;
        let declared = schema
            .field(field)
            .filter(|f| matches!(f.kind, FieldKind::Set { lazy: true, .. }))
            .ok_or_else(|| not_lazy(entity.type_name(), field))?;
        let relation = declared.kind.relation().cloned();
        match entity.get(field) {
            Some(FieldValue::Set(SetValue::Backed(collection))) => Ok(SetAdapter::Backed(
                BackedSet::new(self, collection.clone(), relation),
            )),
            None
            | Some(FieldValue::Value(Value::Null))
            | Some(FieldValue::Set(SetValue::Live(_) | SetValue::Staged(_))) => Ok(
                SetAdapter::Staged(StagedSet::new(owner, entity.type_name(), field)),
            ),
            Some(_) => Err(mismatch(entity.type_name(), field, "a set").into()),
        }
    }

    /// Adapter for a lazy map field.
    pub fn lazy_map(
        &self,
        graph: &EntityGraph,
        owner: EntityKey,
        field: &str,
    ) -> Result<MapAdapter<'_, S>, StorageError> {
        let entity = graph.entity(owner)?;
        let schema = self.registry.resolve(entity.type_name())?;
        let declared = schema
            .field(field)
            .filter(|f| matches!(f.kind, FieldKind::Map { lazy: true, .. }))
            .ok_or_else(|| not_lazy(entity.type_name(), field))?;
        let relation = declared.kind.relation().cloned();
        match entity.get(field) {
            Some(FieldValue::Map(MapValue::Backed(collection))) => Ok(MapAdapter::Backed(
                BackedMap::new(self, collection.clone(), relation),
            )),
            None
            | Some(FieldValue::Value(Value::Null))
            | Some(FieldValue::Map(MapValue::Live(_) | MapValue::Staged(_))) => Ok(
                MapAdapter::Staged(StagedMap::new(owner, entity.type_name(), field)),
            ),
            Some(_) => Err(mismatch(entity.type_name(), field, "a map").into()),
        }
    }
}

/// Converts an operation into one command batch: record upserts first, then
/// key deletions.
pub fn commands_for(operation: &PersistenceOperation) -> Vec<Command> {
    let mut commands = Vec::new();
    for upsert in &operation.hash_upserts {
        if !upsert.changed_fields.is_empty() {
            commands.push(Command::HSet {
                key: upsert.id.clone(),
                fields: upsert
                    .changed_fields
                    .iter()
                    .map(|(field, value)| (field.clone(), value.as_str().to_string()))
                    .collect(),
            });
        }
        if !upsert.deleted_fields.is_empty() {
            commands.push(Command::HDel {
                key: upsert.id.clone(),
                fields: upsert.deleted_fields.clone(),
            });
        }
    }
    for upsert in &operation.set_upserts {
        if !upsert.added.is_empty() {
            commands.push(Command::SAdd {
                key: upsert.id.clone(),
                members: upsert.added.iter().map(|m| m.as_str().to_string()).collect(),
            });
        }
        if !upsert.removed.is_empty() {
            commands.push(Command::SRem {
                key: upsert.id.clone(),
                members: upsert.removed.iter().map(|m| m.as_str().to_string()).collect(),
            });
        }
    }
    let deletes: Vec<String> = operation
        .hash_deletes
        .iter()
        .chain(&operation.set_deletes)
        .cloned()
        .collect();
    if !deletes.is_empty() {
        commands.push(Command::Del(deletes));
    }
    commands
}

/// Entity references found at a relation mapping's lookup location.
fn references<'r>(raw: &'r RawData, mapping: &RelationMapping) -> Vec<&'r str> {
    let is_entity = |v: &&String| v.starts_with(TAG_ENTITY);
    match &mapping.lookup {
        Lookup::Field(name) => match raw.get(mapping.owner_id.as_str()) {
            Some(RawRecord::Hash(fields)) => fields
                .get(name)
                .filter(is_entity)
                .map(String::as_str)
                .into_iter()
                .collect(),
            _ => Vec::new(),
        },
        Lookup::Set(collection) => match raw.get(collection.as_str()) {
            Some(RawRecord::Set(members)) => members
                .iter()
                .filter(is_entity)
                .map(String::as_str)
                .collect(),
            _ => Vec::new(),
        },
        Lookup::Map(collection) => match raw.get(collection.as_str()) {
            Some(RawRecord::Hash(entries)) => entries
                .values()
                .filter(is_entity)
                .map(String::as_str)
                .collect(),
            _ => Vec::new(),
        },
    }
}

fn not_lazy(type_name: &str, field: &str) -> StorageError {
    StorageError::NotLazy {
        type_name: type_name.to_string(),
        field: field.to_string(),
    }
}

fn mismatch(type_name: &str, field: &str, expected: &'static str) -> CoreError {
    CoreError::FieldMismatch {
        type_name: type_name.to_string(),
        field: field.to_string(),
        expected,
    }
}
