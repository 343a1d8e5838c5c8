//! Load planner.
//!
//! Describes what to fetch for one entity: its own hash, the collection
//! records it owns, and where embedded references to other entities will be
//! found once those records arrive. Single relations live inside the owner's
//! hash, so they add a mapping but no extra key. Lazy collection fields are
//! skipped entirely; their adapters fetch on demand.

use std::collections::HashSet;

use crate::error::CoreError;
use crate::id::{CollectionId, EntityId, IdValue};
use crate::ops::{LoadOperation, Lookup, RelationMapping};
use crate::schema::{FieldKind, SchemaRegistry};
use crate::value::NULL_LITERAL;

pub struct LoadPlanner<'a> {
    registry: &'a SchemaRegistry,
}

impl<'a> LoadPlanner<'a> {
    pub fn new(registry: &'a SchemaRegistry) -> Self {
        LoadPlanner { registry }
    }

    /// Plans the fetch of `type_name` with identifier text `id`.
    ///
    /// Returns `None` for the literal id `"null"`, which is what a recorded
    /// absent reference looks like.
    pub fn plan(
        &self,
        id: &str,
        type_name: &str,
        skip_fields: &HashSet<String>,
    ) -> Result<Option<LoadOperation>, CoreError> {
        let schema = self.registry.resolve(type_name)?;
        if id == NULL_LITERAL {
            return Ok(None);
        }
        if id.is_empty() {
            return Err(super::empty_identifier(schema));
        }
        let root_id = EntityId::new(schema.name(), &IdValue::Str(id.to_string()));

        let mut owned_keys = Vec::new();
        let mut relation_mappings = Vec::new();
        for field in schema.fields() {
            let skipped = skip_fields.contains(&field.name);
            match &field.kind {
                FieldKind::Scalar => {}
                FieldKind::Relation(rel) => {
                    if !skipped {
                        relation_mappings.push(RelationMapping {
                            owner_id: root_id.clone(),
                            target_type: rel.target.clone(),
                            lookup: Lookup::Field(field.storage_name.clone()),
                        });
                    }
                }
                FieldKind::Set { lazy: true, .. } | FieldKind::Map { lazy: true, .. } => {}
                FieldKind::Set { relation, .. } => {
                    let key = CollectionId::set(&root_id, &field.storage_name);
                    match relation {
                        None => owned_keys.push(key),
                        Some(_) if skipped => {}
                        Some(rel) => {
                            owned_keys.push(key.clone());
                            relation_mappings.push(RelationMapping {
                                owner_id: root_id.clone(),
                                target_type: rel.target.clone(),
                                lookup: Lookup::Set(key),
                            });
                        }
                    }
                }
                FieldKind::Map { relation, .. } => {
                    let key = CollectionId::map(&root_id, &field.storage_name);
                    match relation {
                        None => owned_keys.push(key),
                        Some(_) if skipped => {}
                        Some(rel) => {
                            owned_keys.push(key.clone());
                            relation_mappings.push(RelationMapping {
                                owner_id: root_id.clone(),
                                target_type: rel.target.clone(),
                                lookup: Lookup::Map(key),
                            });
                        }
                    }
                }
            }
        }

        Ok(Some(LoadOperation {
            root_id,
            owned_keys,
            relation_mappings,
        }))
    }

    /// Convenience for typed identifiers.
    pub fn plan_id(
        &self,
        id: &IdValue,
        type_name: &str,
        skip_fields: &HashSet<String>,
    ) -> Result<Option<LoadOperation>, CoreError> {
        self.plan(&id.to_string(), type_name, skip_fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Cascade, EntitySchema};

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new()
            .with(
                EntitySchema::builder("A")
                    .id("id")
                    .scalar("name")
                    .relation("b", "B", Cascade::NONE)
                    .set("tags")
                    .relation_set("friends", "A", Cascade::NONE)
                    .relation_map("byName", "B", Cascade::NONE)
                    .stored_as("bn")
                    .lazy_set("history", Some(("B", Cascade::INSERT)))
                    .build(),
            )
            .with(EntitySchema::builder("B").id("id").build())
    }

    #[test]
    fn collects_owned_keys_and_relation_mappings() {
        let reg = registry();
        let op = LoadPlanner::new(&reg)
            .plan("1", "A", &HashSet::new())
            .unwrap()
            .unwrap();

        assert_eq!(op.root_id.as_str(), "e:A:1");
        let keys: Vec<&str> = op.owned_keys.iter().map(|k| k.as_str()).collect();
        assert_eq!(keys, ["a:e:A:1:tags", "a:e:A:1:friends", "m:e:A:1:bn"]);

        let lookups: Vec<(&str, &Lookup)> = op
            .relation_mappings
            .iter()
            .map(|m| (m.target_type.as_str(), &m.lookup))
            .collect();
        assert_eq!(lookups.len(), 3);
        assert_eq!(lookups[0], ("B", &Lookup::Field("b".into())));
        assert!(matches!(lookups[1], ("A", Lookup::Set(_))));
        assert!(matches!(lookups[2], ("B", Lookup::Map(_))));
        assert!(!keys.iter().any(|k| k.contains("history")));
    }

    #[test]
    fn skipped_relations_are_neither_fetched_nor_mapped() {
        let reg = registry();
        let skip: HashSet<String> = ["b", "friends"].iter().map(|s| s.to_string()).collect();
        let op = LoadPlanner::new(&reg).plan("1", "A", &skip).unwrap().unwrap();

        let keys: Vec<&str> = op.owned_keys.iter().map(|k| k.as_str()).collect();
        assert_eq!(keys, ["a:e:A:1:tags", "m:e:A:1:bn"]);
        assert_eq!(op.relation_mappings.len(), 1);
        assert_eq!(op.fetch_keys().count(), 3);
    }

    #[test]
    fn null_id_plans_nothing() {
        let reg = registry();
        assert!(LoadPlanner::new(&reg)
            .plan("null", "A", &HashSet::new())
            .unwrap()
            .is_none());
    }

    #[test]
    fn empty_id_is_an_identity_error() {
        let reg = registry();
        assert!(matches!(
            LoadPlanner::new(&reg).plan("", "A", &HashSet::new()),
            Err(CoreError::Identity { .. })
        ));
    }
}
