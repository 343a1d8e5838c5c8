//! End-to-end tests for EntityManager against the in-memory store.
//!
//! Each test builds a fresh store and registry, saves an entity graph,
//! inspects the raw keyspace, and loads the graph back into a new arena.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;

use kvorm_core::schema::{Cascade, EntitySchema, SchemaRegistry};
use kvorm_core::{CoreError, EntityGraph, EntityKey, FieldValue, IdValue, Member, SavePlanner};
use kvorm_storage::{Command, EngineConfig, EntityManager, InMemoryStore, KeyValueStore, StorageError};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

fn registry() -> SchemaRegistry {
    SchemaRegistry::new()
        .with(
            EntitySchema::builder("A")
                .id("id")
                .scalar("prop")
                .relation("b", "B", Cascade::ALL)
                .set("tags")
                .relation_set("rels", "Rel", Cascade::INSERT)
                .build(),
        )
        .with(
            EntitySchema::builder("B")
                .id("id")
                .relation("a", "A", Cascade::ALL)
                .relation("c", "C", Cascade::INSERT)
                .build(),
        )
        .with(EntitySchema::builder("C").id("id").scalar("label").build())
        .with(EntitySchema::builder("Rel").id("id").scalar("label").build())
}

fn manager() -> EntityManager<InMemoryStore> {
    EntityManager::new(InMemoryStore::new(), registry())
}

fn entity(graph: &mut EntityGraph, ty: &str, id: i64) -> EntityKey {
    let key = graph.create(ty);
    graph.set(key, "id", id).unwrap();
    key
}

async fn hash(manager: &EntityManager<InMemoryStore>, key: &str) -> IndexMap<String, String> {
    manager
        .store()
        .execute_one(Command::HGetAll(key.into()))
        .await
        .unwrap()
        .into_hash("HGETALL")
        .unwrap()
}

fn pairs(h: &IndexMap<String, String>) -> Vec<(&str, &str)> {
    h.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
}

// ---------------------------------------------------------------------------
// Save
// ---------------------------------------------------------------------------

#[tokio::test]
async fn save_change_save_writes_only_the_change() {
    let manager = manager();
    let mut graph = EntityGraph::new();
    let a = entity(&mut graph, "A", 1);
    graph.set(a, "prop", "x").unwrap();

    manager.save(&mut graph, a).await.unwrap();
    assert_eq!(
        pairs(&hash(&manager, "e:A:1").await),
        [("id", "i:1"), ("prop", "s:x")]
    );
    let trips = manager.store().round_trips();

    graph.set(a, "prop", "y").unwrap();
    let plan = SavePlanner::new(manager.registry(), &graph).plan(a).unwrap();
    assert_eq!(plan.operation.hash_upserts.len(), 1);
    assert_eq!(plan.operation.mutation_count(), 1);

    manager.save(&mut graph, a).await.unwrap();
    assert_eq!(manager.store().round_trips(), trips + 1);
    assert_eq!(hash(&manager, "e:A:1").await["prop"], "s:y");
}

#[tokio::test]
async fn unchanged_entity_makes_no_round_trip() {
    let manager = manager();
    let mut graph = EntityGraph::new();
    let a = entity(&mut graph, "A", 1);
    graph.set(a, "tags", FieldValue::set(["red", "blue"])).unwrap();

    manager.save(&mut graph, a).await.unwrap();
    let trips = manager.store().round_trips();
    manager.save(&mut graph, a).await.unwrap();
    manager.save(&mut graph, a).await.unwrap();
    assert_eq!(manager.store().round_trips(), trips);
}

#[tokio::test]
async fn cascade_insert_saves_related_entities() {
    let manager = manager();
    let mut graph = EntityGraph::new();
    let a = entity(&mut graph, "A", 1);
    let r1 = entity(&mut graph, "Rel", 1);
    let r2 = entity(&mut graph, "Rel", 2);
    graph.set(a, "rels", FieldValue::set([r1, r2])).unwrap();

    manager.save(&mut graph, a).await.unwrap();
    assert_eq!(
        manager.store().keys(),
        ["a:e:A:1:rels", "e:A:1", "e:Rel:1", "e:Rel:2"]
    );
    assert_eq!(hash(&manager, "e:A:1").await["rels"], "a:e:A:1:rels");
}

#[tokio::test]
async fn duplicate_identity_fails_before_any_io() {
    let manager = manager();
    let mut graph = EntityGraph::new();
    let a = entity(&mut graph, "A", 1);
    let r1 = entity(&mut graph, "Rel", 1);
    let r1_again = entity(&mut graph, "Rel", 1);
    graph.set(a, "rels", FieldValue::set([r1, r1_again])).unwrap();

    let err = manager.save(&mut graph, a).await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::Core(CoreError::DuplicateIdentity { .. })
    ));
    assert_eq!(manager.store().round_trips(), 0);
}

#[tokio::test]
async fn failed_batch_keeps_snapshots_for_retry() {
    let manager = manager();
    let mut graph = EntityGraph::new();
    let a = entity(&mut graph, "A", 1);
    graph.set(a, "prop", "x").unwrap();
    manager.save(&mut graph, a).await.unwrap();

    graph.set(a, "prop", "y").unwrap();
    graph.set(a, "tags", FieldValue::set(["red"])).unwrap();
    manager.store().fail_after(1);
    let err = manager.save(&mut graph, a).await.unwrap_err();
    assert!(matches!(err, StorageError::Connection(_)));

    // The first command landed, the rest did not, and nothing was committed.
    assert_eq!(hash(&manager, "e:A:1").await["prop"], "s:y");
    assert!(!manager.store().contains_key("a:e:A:1:tags"));
    let retry = SavePlanner::new(manager.registry(), &graph).plan(a).unwrap();
    assert!(!retry.is_empty());

    manager.save(&mut graph, a).await.unwrap();
    assert!(manager.store().contains_key("a:e:A:1:tags"));
    assert!(SavePlanner::new(manager.registry(), &graph)
        .plan(a)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn reset_snapshots_forces_a_full_rewrite() {
    let manager = manager();
    let mut graph = EntityGraph::new();
    let a = entity(&mut graph, "A", 1);
    graph.set(a, "prop", "x").unwrap();
    manager.save(&mut graph, a).await.unwrap();

    manager.reset_snapshots(&mut graph, a);
    let plan = SavePlanner::new(manager.registry(), &graph).plan(a).unwrap();
    let upsert = plan.operation.upsert_for("e:A:1").unwrap();
    assert_eq!(
        upsert.changed_fields.keys().collect::<Vec<_>>(),
        ["id", "prop"]
    );
}

#[tokio::test]
async fn empty_identifier_is_rejected_before_any_io() {
    let manager = manager();
    let mut graph = EntityGraph::new();
    let a = graph.create("A");
    graph.set(a, "id", "").unwrap();
    graph.set(a, "prop", "x").unwrap();

    let err = manager.save(&mut graph, a).await.unwrap_err();
    assert!(matches!(err, StorageError::Core(CoreError::Identity { .. })));
    let err = manager.load(&mut graph, "A", "").await.unwrap_err();
    assert!(matches!(err, StorageError::Core(CoreError::Identity { .. })));
    assert_eq!(manager.store().round_trips(), 0);
    assert!(manager.store().is_empty());
}

// ---------------------------------------------------------------------------
// Remove
// ---------------------------------------------------------------------------

#[tokio::test]
async fn remove_deletes_owned_records_only() {
    let manager = manager();
    let mut graph = EntityGraph::new();
    let a = entity(&mut graph, "A", 1);
    let r = entity(&mut graph, "Rel", 1);
    graph.set(a, "rels", FieldValue::set([r])).unwrap();
    graph.set(a, "tags", FieldValue::set(["t"])).unwrap();
    manager.save(&mut graph, a).await.unwrap();

    manager.remove(&mut graph, a).await.unwrap();
    assert_eq!(manager.store().keys(), ["e:Rel:1"]);
    assert!(!manager.has("A", 1).await.unwrap());
    assert!(manager.has("Rel", 1).await.unwrap());
    assert!(!graph.snapshots().contains(a));
}

#[tokio::test]
async fn dangling_members_survive_an_unchanged_save() {
    let manager = manager();
    let mut graph = EntityGraph::new();
    let a = entity(&mut graph, "A", 1);
    let kept = entity(&mut graph, "Rel", 1);
    let gone = entity(&mut graph, "Rel", 2);
    graph.set(a, "rels", FieldValue::set([kept, gone])).unwrap();
    manager.save(&mut graph, a).await.unwrap();
    manager.remove(&mut graph, gone).await.unwrap();

    let mut fresh = EntityGraph::new();
    let loaded = manager.load(&mut fresh, "A", 1).await.unwrap().unwrap();
    match fresh.get(loaded, "rels") {
        Some(FieldValue::Set(kvorm_core::SetValue::Live(members))) => assert_eq!(members.len(), 1),
        other => panic!("expected a live set, got {other:?}"),
    }
    assert!(SavePlanner::new(manager.registry(), &fresh)
        .plan(loaded)
        .unwrap()
        .is_empty());

    // Every member dangling: the field and its record stay untouched.
    let b = entity(&mut graph, "A", 2);
    let lost = entity(&mut graph, "Rel", 3);
    graph.set(b, "rels", FieldValue::set([lost])).unwrap();
    manager.save(&mut graph, b).await.unwrap();
    manager.remove(&mut graph, lost).await.unwrap();

    let mut fresh = EntityGraph::new();
    let loaded = manager.load(&mut fresh, "A", 2).await.unwrap().unwrap();
    assert_eq!(fresh.get(loaded, "rels"), None);
    manager.save(&mut fresh, loaded).await.unwrap();
    assert!(manager.store().contains_key("a:e:A:2:rels"));
    assert_eq!(hash(&manager, "e:A:2").await["rels"], "a:e:A:2:rels");
}

#[tokio::test]
async fn remove_by_id_batches_every_id() {
    let manager = manager();
    let mut graph = EntityGraph::new();
    for id in 1..=3 {
        let r = entity(&mut graph, "Rel", id);
        manager.save(&mut graph, r).await.unwrap();
    }
    let trips = manager.store().round_trips();

    manager
        .remove_by_id("Rel", &[IdValue::Int(1), IdValue::Int(3)])
        .await
        .unwrap();
    assert_eq!(manager.store().round_trips(), trips + 1);
    assert_eq!(manager.store().keys(), ["e:Rel:2"]);
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cyclic_graph_loads_with_identity() {
    let manager = manager();
    let mut graph = EntityGraph::new();
    let a = entity(&mut graph, "A", 1);
    let b = entity(&mut graph, "B", 1);
    graph.set(a, "b", b).unwrap();
    graph.set(b, "a", a).unwrap();
    manager.save(&mut graph, a).await.unwrap();
    assert_eq!(hash(&manager, "e:B:1").await["a"], "e:A:1");

    let mut fresh = EntityGraph::new();
    let loaded = manager.load(&mut fresh, "A", 1).await.unwrap().unwrap();
    let loaded_b = fresh.related(loaded, "b").unwrap();
    assert_eq!(fresh.related(loaded_b, "a"), Some(loaded));
    assert_eq!(fresh.len(), 2);

    // Loaded instances carry snapshots and save as unchanged.
    let trips = manager.store().round_trips();
    manager.save(&mut fresh, loaded).await.unwrap();
    assert_eq!(manager.store().round_trips(), trips);
}

#[tokio::test]
async fn load_round_trips_are_bounded_by_depth() {
    let manager = manager();
    let mut graph = EntityGraph::new();
    let a = entity(&mut graph, "A", 1);
    let b = entity(&mut graph, "B", 1);
    let c = entity(&mut graph, "C", 1);
    graph.set(c, "label", "leaf").unwrap();
    graph.set(a, "b", b).unwrap();
    graph.set(b, "c", c).unwrap();
    let rels: Vec<Member> = (1..=10)
        .map(|id| Member::Entity(entity(&mut graph, "Rel", id)))
        .collect();
    graph.set(a, "rels", FieldValue::set(rels)).unwrap();
    manager.save(&mut graph, a).await.unwrap();

    let trips = manager.store().round_trips();
    let mut fresh = EntityGraph::new();
    let loaded = manager.load(&mut fresh, "A", 1).await.unwrap().unwrap();

    // A and its sets, then B and the ten Rels, then C.
    assert_eq!(manager.store().round_trips(), trips + 3);
    let leaf = fresh
        .related(fresh.related(loaded, "b").unwrap(), "c")
        .unwrap();
    assert_eq!(fresh.get(leaf, "label"), Some(&FieldValue::from("leaf")));
    match fresh.get(loaded, "rels") {
        Some(FieldValue::Set(kvorm_core::SetValue::Live(members))) => assert_eq!(members.len(), 10),
        other => panic!("expected a live set, got {other:?}"),
    }
}

#[tokio::test]
async fn load_many_keeps_positions_and_missing_ids() {
    let manager = manager();
    let mut graph = EntityGraph::new();
    let r = entity(&mut graph, "Rel", 2);
    manager.save(&mut graph, r).await.unwrap();

    let mut fresh = EntityGraph::new();
    let loaded = manager
        .load_many(
            &mut fresh,
            "Rel",
            &[IdValue::Int(1), IdValue::Int(2), IdValue::from("null")],
        )
        .await
        .unwrap();
    assert_eq!(loaded.len(), 3);
    assert!(loaded[0].is_none());
    assert_eq!(fresh.get(loaded[1].unwrap(), "id"), Some(&FieldValue::from(2)));
    assert!(loaded[2].is_none());
}

#[tokio::test]
async fn null_id_makes_no_round_trip() {
    let manager = manager();
    let mut graph = EntityGraph::new();
    assert!(manager.load(&mut graph, "A", "null").await.unwrap().is_none());
    assert_eq!(manager.store().round_trips(), 0);
}

#[tokio::test]
async fn skipped_relations_are_not_fetched() {
    let manager = manager();
    let mut graph = EntityGraph::new();
    let a = entity(&mut graph, "A", 1);
    let b = entity(&mut graph, "B", 1);
    graph.set(a, "b", b).unwrap();
    manager.save(&mut graph, a).await.unwrap();

    let trips = manager.store().round_trips();
    let mut fresh = EntityGraph::new();
    let skip: HashSet<String> = ["b".to_string()].into_iter().collect();
    let loaded = manager
        .load_with(&mut fresh, "A", &[IdValue::Int(1)], &skip)
        .await
        .unwrap();
    let loaded = loaded[0].unwrap();
    assert_eq!(manager.store().round_trips(), trips + 1);
    assert_eq!(fresh.get(loaded, "b"), None);
    assert_eq!(fresh.len(), 1);
}

#[tokio::test]
async fn wave_limit_is_enforced() {
    let store = Arc::new(InMemoryStore::new());
    let registry = Arc::new(registry());
    let unlimited = EntityManager::with_config(store.clone(), registry.clone(), EngineConfig::memory());
    let mut graph = EntityGraph::new();
    let a = entity(&mut graph, "A", 1);
    let b = entity(&mut graph, "B", 1);
    graph.set(a, "b", b).unwrap();
    unlimited.save(&mut graph, a).await.unwrap();

    let config = EngineConfig {
        max_load_waves: 1,
        ..EngineConfig::memory()
    };
    let limited = EntityManager::with_config(store, registry, config);
    let err = limited
        .load(&mut EntityGraph::new(), "A", 1)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Config(_)));
}

#[tokio::test]
async fn unknown_type_is_a_schema_error() {
    let manager = manager();
    let err = manager.has("Nope", 1).await.unwrap_err();
    assert!(matches!(err, StorageError::Core(CoreError::Schema { .. })));
}
