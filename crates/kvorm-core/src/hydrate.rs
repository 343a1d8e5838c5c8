//! Graph hydration from fetched key/value records.
//!
//! The [`Hydrator`] walks every fetched key once, memoized by key. An entity
//! is allocated in the [`EntityGraph`] and entered in the memo *before* its
//! fields are populated, so a field that points back at an entity still being
//! hydrated receives the in-progress instance instead of recursing again.
//! That two-phase allocate/populate step is what lets cyclic graphs load with
//! correct identity.
//!
//! Every populated field also gets a fresh [`Snapshot`] built from the raw
//! encoded value, so a loaded instance diffs correctly on its next save.
//! References that cannot be resolved (not fetched, or missing in storage)
//! leave the field undefined and write no snapshot, so saving the instance
//! later does not unlink data that simply was not loaded. The same holds for
//! collection members: a collection snapshot lists only the members that
//! were materialized, and a stored collection whose members all dangle is
//! left undefined.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::entity::{EntityGraph, EntityKey, FieldValue, MapValue, Member, SetValue};
use crate::error::CoreError;
use crate::id::{CollectionId, CollectionKind, EntityId};
use crate::schema::{FieldSchema, SchemaRegistry};
use crate::snapshot::{CollectionSnapshot, Snapshot};
use crate::value::{decode, decode_scalar, Decoded, EncodedValue, Value, TAG_ENTITY, TAG_MAP};

/// One fetched record, as returned by storage.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    /// Entity hash or map record: field name to encoded value.
    Hash(IndexMap<String, String>),
    /// Set record members.
    Set(Vec<String>),
    /// Nothing stored under the key.
    Missing,
}

impl RawRecord {
    /// Empty records are treated as never having existed.
    pub fn is_missing(&self) -> bool {
        match self {
            RawRecord::Hash(h) => h.is_empty(),
            RawRecord::Set(s) => s.is_empty(),
            RawRecord::Missing => true,
        }
    }
}

/// Accumulated fetch results, keyed by storage key.
pub type RawData = HashMap<String, RawRecord>;

#[derive(Debug, Clone)]
enum Resolved {
    Missing,
    Entity(EntityKey),
    Set {
        members: Vec<Member>,
        contents: Vec<EncodedValue>,
    },
    Map {
        entries: Vec<(Value, Member)>,
        contents: IndexMap<EncodedValue, EncodedValue>,
    },
}

pub struct Hydrator<'a> {
    registry: &'a SchemaRegistry,
    raw: &'a RawData,
    memo: HashMap<String, Resolved>,
}

impl<'a> Hydrator<'a> {
    pub fn new(registry: &'a SchemaRegistry, raw: &'a RawData) -> Self {
        Hydrator {
            registry,
            raw,
            memo: HashMap::new(),
        }
    }

    /// Materializes every fetched record into `graph` and returns the
    /// instance for each root, `None` where the root does not exist.
    pub fn hydrate(
        mut self,
        graph: &mut EntityGraph,
        roots: &[EntityId],
    ) -> Result<Vec<Option<EntityKey>>, CoreError> {
        let raw = self.raw;
        let mut keys: Vec<&String> = raw.keys().collect();
        keys.sort();
        for key in keys {
            self.resolve(graph, key)?;
        }
        Ok(roots
            .iter()
            .map(|id| match self.memo.get(id.as_str()) {
                Some(Resolved::Entity(key)) => Some(*key),
                _ => None,
            })
            .collect())
    }

    fn resolve(&mut self, graph: &mut EntityGraph, key: &str) -> Result<Resolved, CoreError> {
        if let Some(done) = self.memo.get(key) {
            return Ok(done.clone());
        }
        let raw = self.raw;
        let resolved = match raw.get(key) {
            None => Resolved::Missing,
            Some(record) if record.is_missing() => Resolved::Missing,
            Some(RawRecord::Hash(fields)) if key.starts_with(TAG_ENTITY) => {
                return self.resolve_entity(graph, key, fields);
            }
            Some(RawRecord::Hash(entries)) if key.starts_with(TAG_MAP) => {
                self.resolve_map(graph, entries)?
            }
            Some(RawRecord::Set(members)) => self.resolve_set(graph, members)?,
            Some(_) => {
                return Err(CoreError::InvalidKey {
                    key: key.to_string(),
                })
            }
        };
        self.memo.insert(key.to_string(), resolved.clone());
        Ok(resolved)
    }

    fn resolve_entity(
        &mut self,
        graph: &mut EntityGraph,
        key: &str,
        fields: &IndexMap<String, String>,
    ) -> Result<Resolved, CoreError> {
        let id = EntityId::parse(key)?;
        let registry = self.registry;
        let schema = registry.resolve(id.type_name())?;

        // Register before populating: this is what terminates cycles.
        let instance = graph.create(schema.name());
        self.memo
            .insert(key.to_string(), Resolved::Entity(instance));

        for (storage_name, raw) in fields {
            let Some(field) = schema.field_by_storage_name(storage_name) else {
                tracing::debug!(key, field = %storage_name, "skipping undeclared stored field");
                continue;
            };
            self.populate_field(graph, instance, field, raw)?;
        }
        Ok(Resolved::Entity(instance))
    }

    fn populate_field(
        &mut self,
        graph: &mut EntityGraph,
        instance: EntityKey,
        field: &FieldSchema,
        raw: &str,
    ) -> Result<(), CoreError> {
        let encoded = EncodedValue::from_raw(raw);

        if field.kind.is_lazy() && encoded.is_reference() {
            let collection = CollectionId::parse(raw)?;
            let value = match collection.kind() {
                CollectionKind::Set => FieldValue::Set(SetValue::Backed(collection)),
                CollectionKind::Map => FieldValue::Map(MapValue::Backed(collection)),
            };
            graph.set(instance, &field.name, value)?;
            graph
                .snapshots_mut()
                .write(instance, &field.name, Snapshot::value(Some(encoded)));
            return Ok(());
        }

        let reference = match decode(raw)? {
            Decoded::Value(v) => {
                graph.set(instance, &field.name, v)?;
                graph
                    .snapshots_mut()
                    .write(instance, &field.name, Snapshot::value(Some(encoded)));
                return Ok(());
            }
            Decoded::Reference(r) => r,
        };

        let (value, contents) = match self.resolve(graph, &reference)? {
            Resolved::Missing => return Ok(()),
            Resolved::Entity(target) => (FieldValue::Entity(target), None),
            // Every stored member dangles.
            Resolved::Set { members, .. } if members.is_empty() => return Ok(()),
            Resolved::Map { entries, .. } if entries.is_empty() => return Ok(()),
            Resolved::Set { members, contents } => (
                FieldValue::Set(SetValue::Live(members)),
                Some(CollectionSnapshot::Set(contents)),
            ),
            Resolved::Map { entries, contents } => (
                FieldValue::Map(MapValue::Live(entries)),
                Some(CollectionSnapshot::Map(contents)),
            ),
        };
        graph.set(instance, &field.name, value)?;
        graph.snapshots_mut().write(
            instance,
            &field.name,
            Snapshot {
                last_value: Some(encoded),
                last_collection: contents,
            },
        );
        Ok(())
    }

    fn resolve_set(
        &mut self,
        graph: &mut EntityGraph,
        raw_members: &[String],
    ) -> Result<Resolved, CoreError> {
        let mut members = Vec::with_capacity(raw_members.len());
        let mut contents = Vec::with_capacity(raw_members.len());
        for raw in raw_members {
            if let Some(member) = self.resolve_member(graph, raw)? {
                members.push(member);
                contents.push(EncodedValue::from_raw(raw.as_str()));
            }
        }
        Ok(Resolved::Set { members, contents })
    }

    fn resolve_map(
        &mut self,
        graph: &mut EntityGraph,
        raw_entries: &IndexMap<String, String>,
    ) -> Result<Resolved, CoreError> {
        let mut entries = Vec::with_capacity(raw_entries.len());
        let mut contents = IndexMap::new();
        for (raw_key, raw) in raw_entries {
            let key = decode_scalar(raw_key)?;
            if let Some(member) = self.resolve_member(graph, raw)? {
                entries.push((key, member));
                contents.insert(
                    EncodedValue::from_raw(raw_key.as_str()),
                    EncodedValue::from_raw(raw.as_str()),
                );
            }
        }
        Ok(Resolved::Map { entries, contents })
    }

    /// Decodes a set member or map value. Unresolvable entity references are
    /// dropped from the in-memory collection.
    fn resolve_member(
        &mut self,
        graph: &mut EntityGraph,
        raw: &str,
    ) -> Result<Option<Member>, CoreError> {
        match decode(raw)? {
            Decoded::Value(v) => Ok(Some(Member::Value(v))),
            Decoded::Reference(r) => match self.resolve(graph, &r)? {
                Resolved::Entity(key) => Ok(Some(Member::Entity(key))),
                Resolved::Missing => Ok(None),
                Resolved::Set { .. } | Resolved::Map { .. } => {
                    tracing::debug!(reference = %r, "collections cannot be collection members");
                    Ok(None)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::SavePlanner;
    use crate::schema::{Cascade, EntitySchema};

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new()
            .with(
                EntitySchema::builder("A")
                    .id("id")
                    .scalar("prop")
                    .relation("b", "B", Cascade::ALL)
                    .set("tags")
                    .relation_map("peers", "B", Cascade::NONE)
                    .lazy_set("log", None)
                    .build(),
            )
            .with(
                EntitySchema::builder("B")
                    .id("id")
                    .relation("a", "A", Cascade::ALL)
                    .build(),
            )
    }

    fn hash(pairs: &[(&str, &str)]) -> RawRecord {
        RawRecord::Hash(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn cyclic_raw() -> RawData {
        let mut raw = RawData::new();
        raw.insert(
            "e:A:1".into(),
            hash(&[
                ("id", "i:1"),
                ("prop", "s:x"),
                ("b", "e:B:1"),
                ("tags", "a:e:A:1:tags"),
                ("peers", "m:e:A:1:peers"),
                ("log", "a:e:A:1:log"),
            ]),
        );
        raw.insert("e:B:1".into(), hash(&[("id", "i:1"), ("a", "e:A:1")]));
        raw.insert(
            "a:e:A:1:tags".into(),
            RawRecord::Set(vec!["s:red".into(), "i:2".into()]),
        );
        raw.insert("m:e:A:1:peers".into(), hash(&[("s:first", "e:B:1")]));
        raw
    }

    #[test]
    fn cycles_resolve_to_the_same_instance() {
        let reg = registry();
        let raw = cyclic_raw();
        let mut graph = EntityGraph::new();
        let roots = Hydrator::new(&reg, &raw)
            .hydrate(&mut graph, &[EntityId::parse("e:A:1").unwrap()])
            .unwrap();

        let a = roots[0].unwrap();
        let b = graph.related(a, "b").unwrap();
        assert_eq!(graph.related(b, "a"), Some(a));
        assert_eq!(graph.len(), 2);

        assert_eq!(
            graph.get(a, "tags"),
            Some(&FieldValue::set([Member::from("red"), Member::from(2)]))
        );
        assert_eq!(
            graph.get(a, "peers"),
            Some(&FieldValue::Map(MapValue::Live(vec![(
                Value::from("first"),
                Member::Entity(b)
            )])))
        );
        assert!(matches!(
            graph.get(a, "log"),
            Some(FieldValue::Set(SetValue::Backed(_)))
        ));
    }

    #[test]
    fn hydrated_graph_saves_as_unchanged() {
        let reg = registry();
        let raw = cyclic_raw();
        let mut graph = EntityGraph::new();
        let roots = Hydrator::new(&reg, &raw)
            .hydrate(&mut graph, &[EntityId::parse("e:A:1").unwrap()])
            .unwrap();
        let a = roots[0].unwrap();

        assert!(SavePlanner::new(&reg, &graph).plan(a).unwrap().is_empty());

        graph.set(a, "tags", FieldValue::set(["red"])).unwrap();
        let plan = SavePlanner::new(&reg, &graph).plan(a).unwrap();
        let set = plan.operation.set_upsert_for("a:e:A:1:tags").unwrap();
        assert!(set.added.is_empty());
        assert_eq!(set.removed, [EncodedValue::from_raw("i:2")]);
    }

    #[test]
    fn missing_and_empty_records_leave_fields_undefined() {
        let reg = registry();
        let mut raw = RawData::new();
        raw.insert(
            "e:A:1".into(),
            hash(&[("id", "i:1"), ("b", "e:B:404"), ("tags", "a:e:A:1:tags")]),
        );
        raw.insert("a:e:A:1:tags".into(), RawRecord::Set(vec![]));
        raw.insert("e:A:2".into(), RawRecord::Missing);

        let mut graph = EntityGraph::new();
        let roots = Hydrator::new(&reg, &raw)
            .hydrate(
                &mut graph,
                &[
                    EntityId::parse("e:A:1").unwrap(),
                    EntityId::parse("e:A:2").unwrap(),
                ],
            )
            .unwrap();

        let a = roots[0].unwrap();
        assert!(roots[1].is_none());
        assert_eq!(graph.get(a, "b"), None);
        assert_eq!(graph.get(a, "tags"), None);
        assert!(graph.snapshots().read(a, "b").is_none());
        // Saving does not unlink references that were never loaded.
        assert!(SavePlanner::new(&reg, &graph).plan(a).unwrap().is_empty());
    }

    #[test]
    fn dangling_collection_members_stay_stored() {
        let reg = registry();
        let mut raw = RawData::new();
        raw.insert(
            "e:A:1".into(),
            hash(&[("id", "i:1"), ("tags", "a:e:A:1:tags"), ("peers", "m:e:A:1:peers")]),
        );
        raw.insert(
            "a:e:A:1:tags".into(),
            RawRecord::Set(vec!["s:red".into(), "e:B:404".into()]),
        );
        raw.insert("e:B:404".into(), RawRecord::Missing);
        raw.insert("m:e:A:1:peers".into(), hash(&[("s:gone", "e:B:404")]));

        let mut graph = EntityGraph::new();
        let roots = Hydrator::new(&reg, &raw)
            .hydrate(&mut graph, &[EntityId::parse("e:A:1").unwrap()])
            .unwrap();
        let a = roots[0].unwrap();

        assert_eq!(graph.get(a, "tags"), Some(&FieldValue::set(["red"])));
        assert_eq!(
            graph.snapshots().read(a, "tags").unwrap().last_collection,
            Some(CollectionSnapshot::Set(vec![EncodedValue::from_raw("s:red")]))
        );
        assert_eq!(graph.get(a, "peers"), None);
        assert!(graph.snapshots().read(a, "peers").is_none());
        assert!(SavePlanner::new(&reg, &graph).plan(a).unwrap().is_empty());
    }

    #[test]
    fn undeclared_stored_fields_are_ignored() {
        let reg = registry();
        let mut raw = RawData::new();
        raw.insert("e:B:7".into(), hash(&[("id", "i:7"), ("legacy", "s:old")]));
        let mut graph = EntityGraph::new();
        let roots = Hydrator::new(&reg, &raw)
            .hydrate(&mut graph, &[EntityId::parse("e:B:7").unwrap()])
            .unwrap();
        let b = roots[0].unwrap();
        assert_eq!(graph.get(b, "id"), Some(&FieldValue::from(7)));
        assert_eq!(graph.entity(b).unwrap().fields().count(), 1);
    }
}
