//! Save planner: snapshot diff of an entity graph.
//!
//! For each declared field the current value is encoded and compared with
//! the field's [`Snapshot`]. Only differences become mutations. Relations
//! with cascade flags are planned recursively into the same [`Plan`].
//!
//! One [`EntityId`] may resolve to exactly one instance per save. The
//! `processed` table spans the whole cascade: meeting the same instance again
//! closes a cycle and ends recursion, meeting a different instance with the
//! same id is a [`CoreError::DuplicateIdentity`].

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use crate::entity::{EntityGraph, EntityKey, FieldValue, MapValue, Member, SetValue};
use crate::error::CoreError;
use crate::id::{CollectionId, CollectionKind, EntityId};
use crate::ops::{HashUpsert, SetUpsert};
use crate::schema::{Cascade, EntitySchema, FieldKind, FieldSchema, RelationSpec, SchemaRegistry};
use crate::snapshot::{CollectionSnapshot, Snapshot};
use crate::value::{encode, EncodedValue, Value};

use super::{identity_of, Plan};

/// Per-field planning context.
struct FieldCtx<'p> {
    key: EntityKey,
    owner: &'p EntityId,
    schema: &'p EntitySchema,
    field: &'p FieldSchema,
    snapshot: Option<&'p Snapshot>,
}

impl FieldCtx<'_> {
    fn last_value(&self) -> Option<&EncodedValue> {
        self.snapshot.and_then(|s| s.last_value.as_ref())
    }

    fn mismatch(&self, expected: &'static str) -> CoreError {
        CoreError::FieldMismatch {
            type_name: self.schema.name().to_string(),
            field: self.field.name.clone(),
            expected,
        }
    }
}

/// Shape of a collection field's current value.
enum CollectionState<'v, T> {
    /// Undefined, or an empty live/staged collection.
    Undefined,
    Null,
    Backed,
    Live(&'v [T]),
    Staged(&'v [T]),
}

/// Plans saves against an [`EntityGraph`] and its snapshots.
pub struct SavePlanner<'a> {
    registry: &'a SchemaRegistry,
    graph: &'a EntityGraph,
}

impl<'a> SavePlanner<'a> {
    pub fn new(registry: &'a SchemaRegistry, graph: &'a EntityGraph) -> Self {
        SavePlanner { registry, graph }
    }

    /// Plans the save of `root` and everything it cascades to.
    pub fn plan(&self, root: EntityKey) -> Result<Plan, CoreError> {
        let mut processed = HashMap::new();
        let mut plan = Plan::default();
        self.plan_entity(root, &mut processed, &mut plan)?;
        Ok(plan)
    }

    fn plan_entity(
        &self,
        key: EntityKey,
        processed: &mut HashMap<EntityId, EntityKey>,
        plan: &mut Plan,
    ) -> Result<(), CoreError> {
        let entity = self.graph.entity(key)?;
        let schema = self.registry.resolve(entity.type_name())?;
        let id = identity_of(schema, entity)?;

        match processed.get(&id) {
            Some(&seen) if seen != key => return Err(CoreError::DuplicateIdentity { id }),
            Some(_) => return Ok(()),
            None => {
                processed.insert(id.clone(), key);
            }
        }

        // The owner's upsert goes ahead of anything its relations add.
        let slot = plan.operation.hash_upserts.len();
        let mut upsert = HashUpsert::new(id.as_str());

        for field in schema.fields() {
            let ctx = FieldCtx {
                key,
                owner: &id,
                schema,
                field,
                snapshot: self.graph.snapshots().read(key, &field.name),
            };
            let value = entity.get(&field.name);
            match &field.kind {
                FieldKind::Scalar => {
                    let encoded = self.encode_link(&ctx, value)?;
                    record_value(&ctx, encoded, &mut upsert, plan);
                }
                FieldKind::Relation(rel) => {
                    self.plan_relation(&ctx, rel, value, &mut upsert, processed, plan)?
                }
                FieldKind::Set { relation, .. } => {
                    let state = match value {
                        Some(FieldValue::Set(set)) => match set {
                            SetValue::Live(m) if m.is_empty() => CollectionState::Undefined,
                            SetValue::Staged(m) if m.is_empty() => CollectionState::Undefined,
                            SetValue::Live(m) => CollectionState::Live(m.as_slice()),
                            SetValue::Staged(m) => CollectionState::Staged(m.as_slice()),
                            SetValue::Backed(_) => CollectionState::Backed,
                        },
                        other => plain_state(&ctx, other, "a set")?,
                    };
                    self.plan_set(&ctx, relation.as_ref(), state, &mut upsert, processed, plan)?
                }
                FieldKind::Map { relation, .. } => {
                    let state = match value {
                        Some(FieldValue::Map(map)) => match map {
                            MapValue::Live(e) if e.is_empty() => CollectionState::Undefined,
                            MapValue::Staged(e) if e.is_empty() => CollectionState::Undefined,
                            MapValue::Live(e) => CollectionState::Live(e.as_slice()),
                            MapValue::Staged(e) => CollectionState::Staged(e.as_slice()),
                            MapValue::Backed(_) => CollectionState::Backed,
                        },
                        other => plain_state(&ctx, other, "a map")?,
                    };
                    self.plan_map(&ctx, relation.as_ref(), state, &mut upsert, processed, plan)?
                }
            }
        }

        if !upsert.is_noop() {
            plan.operation.hash_upserts.insert(slot, upsert);
        }
        Ok(())
    }

    fn plan_relation(
        &self,
        ctx: &FieldCtx<'_>,
        rel: &RelationSpec,
        value: Option<&FieldValue>,
        upsert: &mut HashUpsert,
        processed: &mut HashMap<EntityId, EntityKey>,
        plan: &mut Plan,
    ) -> Result<(), CoreError> {
        let encoded = self.encode_link(ctx, value)?;
        let changed = encoded.as_ref() != ctx.last_value();
        record_value(ctx, encoded, upsert, plan);

        if let Some(FieldValue::Entity(target)) = value {
            if (changed && rel.cascade.insert) || (!changed && rel.cascade.update) {
                self.plan_entity(*target, processed, plan)?;
            }
        }
        Ok(())
    }

    fn plan_set(
        &self,
        ctx: &FieldCtx<'_>,
        relation: Option<&RelationSpec>,
        state: CollectionState<'_, Member>,
        upsert: &mut HashUpsert,
        processed: &mut HashMap<EntityId, EntityKey>,
        plan: &mut Plan,
    ) -> Result<(), CoreError> {
        let collection = CollectionId::set(ctx.owner, &ctx.field.storage_name);
        let (members, staged) = match state {
            CollectionState::Undefined => {
                clear_collection(ctx, collection, false, upsert, plan);
                return Ok(());
            }
            CollectionState::Null => {
                clear_collection(ctx, collection, true, upsert, plan);
                return Ok(());
            }
            CollectionState::Backed => return Ok(()),
            CollectionState::Live(m) => (m, false),
            CollectionState::Staged(m) => (m, true),
        };

        let cascade = relation.map(|r| r.cascade).unwrap_or(Cascade::NONE);
        if relation.is_some() && cascade.any() {
            self.check_duplicates(members.iter().filter_map(Member::as_entity))?;
        }

        let mut current: IndexMap<EncodedValue, Option<EntityKey>> = IndexMap::new();
        for member in members {
            let encoded = self.encode_member(member)?;
            current.entry(encoded).or_insert(member.as_entity());
        }

        let prior: Vec<EncodedValue> = match ctx.snapshot.and_then(|s| s.last_collection.as_ref()) {
            Some(CollectionSnapshot::Set(prior)) if !staged => prior.clone(),
            _ => Vec::new(),
        };
        let prior_set: HashSet<&EncodedValue> = prior.iter().collect();

        let added: Vec<EncodedValue> = current
            .keys()
            .filter(|m| !prior_set.contains(m))
            .cloned()
            .collect();
        let removed: Vec<EncodedValue> = prior
            .iter()
            .filter(|m| !current.contains_key(*m))
            .cloned()
            .collect();
        if !added.is_empty() || !removed.is_empty() {
            plan.operation.set_upserts.push(SetUpsert {
                id: collection.to_string(),
                added,
                removed,
            });
        }

        if relation.is_some() {
            for (encoded, target) in &current {
                let Some(target) = target else { continue };
                let is_new = !prior_set.contains(encoded);
                if cascade_applies(cascade, is_new, staged) {
                    self.plan_entity(*target, processed, plan)?;
                }
            }
        }

        self.link_collection(
            ctx,
            &collection,
            CollectionSnapshot::Set(current.into_keys().collect()),
            upsert,
            plan,
        );
        if staged {
            plan.rebind(ctx.key, &ctx.field.name, collection);
        }
        Ok(())
    }

    fn plan_map(
        &self,
        ctx: &FieldCtx<'_>,
        relation: Option<&RelationSpec>,
        state: CollectionState<'_, (Value, Member)>,
        upsert: &mut HashUpsert,
        processed: &mut HashMap<EntityId, EntityKey>,
        plan: &mut Plan,
    ) -> Result<(), CoreError> {
        let collection = CollectionId::map(ctx.owner, &ctx.field.storage_name);
        let (entries, staged) = match state {
            CollectionState::Undefined => {
                clear_collection(ctx, collection, false, upsert, plan);
                return Ok(());
            }
            CollectionState::Null => {
                clear_collection(ctx, collection, true, upsert, plan);
                return Ok(());
            }
            CollectionState::Backed => return Ok(()),
            CollectionState::Live(e) => (e, false),
            CollectionState::Staged(e) => (e, true),
        };

        let cascade = relation.map(|r| r.cascade).unwrap_or(Cascade::NONE);
        if relation.is_some() && cascade.any() {
            self.check_duplicates(entries.iter().filter_map(|(_, m)| m.as_entity()))?;
        }

        let mut current: IndexMap<EncodedValue, (EncodedValue, Option<EntityKey>)> =
            IndexMap::new();
        for (k, member) in entries {
            current.insert(encode(k), (self.encode_member(member)?, member.as_entity()));
        }

        let empty = IndexMap::new();
        let prior = match ctx.snapshot.and_then(|s| s.last_collection.as_ref()) {
            Some(CollectionSnapshot::Map(prior)) if !staged => prior,
            _ => &empty,
        };

        let mut map_upsert = HashUpsert::new(collection.as_str());
        for (k, (v, _)) in &current {
            if prior.get(k) != Some(v) {
                map_upsert
                    .changed_fields
                    .insert(k.as_str().to_string(), v.clone());
            }
        }
        for k in prior.keys() {
            if !current.contains_key(k) {
                map_upsert.deleted_fields.push(k.as_str().to_string());
            }
        }
        if !map_upsert.is_noop() {
            plan.operation.hash_upserts.push(map_upsert);
        }

        if relation.is_some() {
            for (k, (v, target)) in &current {
                let Some(target) = target else { continue };
                let is_new = prior.get(k) != Some(v);
                if cascade_applies(cascade, is_new, staged) {
                    self.plan_entity(*target, processed, plan)?;
                }
            }
        }

        let contents = current.into_iter().map(|(k, (v, _))| (k, v)).collect();
        self.link_collection(ctx, &collection, CollectionSnapshot::Map(contents), upsert, plan);
        if staged {
            plan.rebind(ctx.key, &ctx.field.name, collection);
        }
        Ok(())
    }

    /// Points the owner's field at its collection record and records the
    /// collection snapshot.
    fn link_collection(
        &self,
        ctx: &FieldCtx<'_>,
        collection: &CollectionId,
        contents: CollectionSnapshot,
        upsert: &mut HashUpsert,
        plan: &mut Plan,
    ) {
        let link = EncodedValue::from_raw(collection.as_str());
        if ctx.last_value() != Some(&link) {
            upsert
                .changed_fields
                .insert(ctx.field.storage_name.clone(), link.clone());
        }
        plan.snapshots.write(
            ctx.key,
            &ctx.field.name,
            Snapshot {
                last_value: Some(link),
                last_collection: Some(contents),
            },
        );
    }

    /// Rejects two distinct instances sharing an entity id among `targets`.
    fn check_duplicates(&self, targets: impl Iterator<Item = EntityKey>) -> Result<(), CoreError> {
        let mut seen: HashMap<EntityId, EntityKey> = HashMap::new();
        for target in targets {
            let id = super::entity_id(self.registry, self.graph, target)?;
            match seen.get(&id) {
                Some(&other) if other != target => {
                    return Err(CoreError::DuplicateIdentity { id });
                }
                Some(_) => {}
                None => {
                    seen.insert(id, target);
                }
            }
        }
        Ok(())
    }

    /// Encodes a scalar or single-relation field value.
    fn encode_link(
        &self,
        ctx: &FieldCtx<'_>,
        value: Option<&FieldValue>,
    ) -> Result<Option<EncodedValue>, CoreError> {
        match value {
            None => Ok(None),
            Some(FieldValue::Value(v)) => Ok(Some(encode(v))),
            Some(FieldValue::Entity(target)) => Ok(Some(self.encode_entity(*target)?)),
            Some(FieldValue::Set(_) | FieldValue::Map(_)) => {
                Err(ctx.mismatch("a scalar or entity reference"))
            }
        }
    }

    fn encode_member(&self, member: &Member) -> Result<EncodedValue, CoreError> {
        match member {
            Member::Value(v) => Ok(encode(v)),
            Member::Entity(target) => self.encode_entity(*target),
        }
    }

    fn encode_entity(&self, target: EntityKey) -> Result<EncodedValue, CoreError> {
        let id = super::entity_id(self.registry, self.graph, target)?;
        Ok(EncodedValue::from_raw(id.as_str()))
    }
}

/// Maps a non-collection value found in a collection field.
fn plain_state<'v, T>(
    ctx: &FieldCtx<'_>,
    value: Option<&FieldValue>,
    expected: &'static str,
) -> Result<CollectionState<'v, T>, CoreError> {
    match value {
        None => Ok(CollectionState::Undefined),
        Some(FieldValue::Value(Value::Null)) => Ok(CollectionState::Null),
        Some(_) => Err(ctx.mismatch(expected)),
    }
}

/// Whether a related member is planned. Staged collections plan every member
/// as an insert whenever the field cascades at all.
fn cascade_applies(cascade: Cascade, is_new: bool, staged: bool) -> bool {
    if staged {
        cascade.any()
    } else if is_new {
        cascade.insert
    } else {
        cascade.update
    }
}

/// Diffs a scalar or relation encoding against the snapshot.
fn record_value(
    ctx: &FieldCtx<'_>,
    encoded: Option<EncodedValue>,
    upsert: &mut HashUpsert,
    plan: &mut Plan,
) {
    match (&encoded, ctx.last_value()) {
        (Some(now), last) if Some(now) != last => {
            upsert
                .changed_fields
                .insert(ctx.field.storage_name.clone(), now.clone());
        }
        (None, Some(_)) => upsert.deleted_fields.push(ctx.field.storage_name.clone()),
        _ => {}
    }
    plan.snapshots
        .write(ctx.key, &ctx.field.name, Snapshot::value(encoded));
}

/// A collection field that is now null, undefined or empty.
///
/// | before    | after     | collection | owner field  |
/// |-----------|-----------|------------|--------------|
/// | value     | null      | delete     | set `null`   |
/// | value     | undefined | delete     | delete       |
/// | null      | null      | -          | -            |
/// | null      | undefined | -          | delete       |
/// | undefined | undefined | -          | -            |
/// | undefined | null      | -          | set `null`   |
fn clear_collection(
    ctx: &FieldCtx<'_>,
    collection: CollectionId,
    explicit_null: bool,
    upsert: &mut HashUpsert,
    plan: &mut Plan,
) {
    let last = ctx.last_value();
    let had_null = last.is_some_and(EncodedValue::is_null);
    let had_value = last.is_some() && !had_null;

    if had_value {
        match collection.kind() {
            CollectionKind::Set => plan.operation.set_deletes.push(collection.to_string()),
            CollectionKind::Map => plan.operation.hash_deletes.push(collection.to_string()),
        }
    }

    let now = if explicit_null {
        if !had_null {
            upsert
                .changed_fields
                .insert(ctx.field.storage_name.clone(), EncodedValue::null());
        }
        Some(EncodedValue::null())
    } else {
        if last.is_some() {
            upsert.deleted_fields.push(ctx.field.storage_name.clone());
        }
        None
    };
    plan.snapshots
        .write(ctx.key, &ctx.field.name, Snapshot::value(now));
}
