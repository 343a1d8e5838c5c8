//! Delete planner.
//!
//! Removes an entity's own hash and every collection record it owns. Related
//! entities are never touched: deleting an entity does not delete what it
//! points to. Collection keys are deleted unconditionally because deleting a
//! missing key is a no-op in storage.

use crate::entity::{EntityGraph, EntityKey};
use crate::error::CoreError;
use crate::id::{CollectionId, EntityId, IdValue};
use crate::schema::{EntitySchema, FieldKind, SchemaRegistry};

use super::{identity_of, Plan};

pub struct DeletePlanner<'a> {
    registry: &'a SchemaRegistry,
}

impl<'a> DeletePlanner<'a> {
    pub fn new(registry: &'a SchemaRegistry) -> Self {
        DeletePlanner { registry }
    }

    /// Plans the removal of a live instance and clears its snapshots on
    /// commit.
    pub fn plan_entity(&self, graph: &EntityGraph, key: EntityKey) -> Result<Plan, CoreError> {
        let entity = graph.entity(key)?;
        let schema = self.registry.resolve(entity.type_name())?;
        let id = identity_of(schema, entity)?;
        let mut plan = Plan::default();
        self.push_deletes(schema, &id, &mut plan);
        plan.snapshots.clear_entity(key);
        Ok(plan)
    }

    /// Plans the removal of an entity known only by type and id.
    pub fn plan_id(&self, type_name: &str, id: &IdValue) -> Result<Plan, CoreError> {
        let schema = self.registry.resolve(type_name)?;
        if matches!(id, IdValue::Str(s) if s.is_empty()) {
            return Err(super::empty_identifier(schema));
        }
        let id = EntityId::new(schema.name(), id);
        let mut plan = Plan::default();
        self.push_deletes(schema, &id, &mut plan);
        Ok(plan)
    }

    fn push_deletes(&self, schema: &EntitySchema, id: &EntityId, plan: &mut Plan) {
        let op = &mut plan.operation;
        op.hash_deletes.push(id.to_string());
        for field in schema.fields() {
            match field.kind {
                FieldKind::Set { .. } => op
                    .set_deletes
                    .push(CollectionId::set(id, &field.storage_name).to_string()),
                FieldKind::Map { .. } => op
                    .hash_deletes
                    .push(CollectionId::map(id, &field.storage_name).to_string()),
                FieldKind::Scalar | FieldKind::Relation(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::FieldValue;
    use crate::schema::{Cascade, EntitySchema};

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new()
            .with(
                EntitySchema::builder("A")
                    .id("id")
                    .relation("owner", "Rel", Cascade::ALL)
                    .relation_set("rels", "Rel", Cascade::ALL)
                    .map("meta")
                    .lazy_set("log", None)
                    .build(),
            )
            .with(EntitySchema::builder("Rel").id("id").build())
    }

    #[test]
    fn deletes_own_records_but_not_related_entities() {
        let reg = registry();
        let mut graph = EntityGraph::new();
        let a = graph.create("A");
        graph.set(a, "id", 1).unwrap();
        let r = graph.create("Rel");
        graph.set(r, "id", 2).unwrap();
        graph.set(a, "owner", r).unwrap();
        graph.set(a, "rels", FieldValue::set([r])).unwrap();

        let plan = DeletePlanner::new(&reg).plan_entity(&graph, a).unwrap();
        let op = &plan.operation;
        assert_eq!(op.hash_deletes, ["e:A:1", "m:e:A:1:meta"]);
        assert_eq!(op.set_deletes, ["a:e:A:1:rels", "a:e:A:1:log"]);
        assert!(!op.hash_deletes.iter().any(|k| k.contains("Rel")));
        assert!(op.hash_upserts.is_empty());
    }

    #[test]
    fn deletes_by_id_without_an_instance() {
        let reg = registry();
        let plan = DeletePlanner::new(&reg)
            .plan_id("A", &IdValue::from("x"))
            .unwrap();
        assert_eq!(plan.operation.hash_deletes[0], "e:A:x");
        assert!(plan.snapshots.is_empty());
    }

    #[test]
    fn empty_id_is_rejected() {
        let reg = registry();
        assert!(matches!(
            DeletePlanner::new(&reg).plan_id("A", &IdValue::from("")),
            Err(CoreError::Identity { .. })
        ));
    }

    #[test]
    fn unknown_type_is_a_schema_error() {
        let reg = registry();
        assert!(matches!(
            DeletePlanner::new(&reg).plan_id("Missing", &IdValue::Int(1)),
            Err(CoreError::Schema { .. })
        ));
    }
}
