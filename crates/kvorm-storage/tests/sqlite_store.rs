//! The engine running on the SQLite store, persisted across reopen.

use std::sync::Arc;

use kvorm_core::schema::{Cascade, EntitySchema, SchemaRegistry};
use kvorm_core::{EntityGraph, FieldValue, Member, SetValue};
use kvorm_storage::{EngineConfig, EntityManager, LazySet, SqliteStore};

fn registry() -> Arc<SchemaRegistry> {
    Arc::new(
        SchemaRegistry::new()
            .with(
                EntitySchema::builder("Author")
                    .id("id")
                    .scalar("name")
                    .relation_set("books", "Book", Cascade::INSERT)
                    .lazy_set("visits", None)
                    .build(),
            )
            .with(
                EntitySchema::builder("Book")
                    .id("isbn")
                    .scalar("title")
                    .relation("author", "Author", Cascade::NONE)
                    .build(),
            ),
    )
}

fn manager(path: &str) -> EntityManager<SqliteStore> {
    let config = EngineConfig {
        scan_count: 2,
        ..EngineConfig::sqlite(path)
    };
    EntityManager::with_config(Arc::new(SqliteStore::new(path).unwrap()), registry(), config)
}

#[tokio::test]
async fn graph_survives_reopening_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kv.db");
    let path = path.to_str().unwrap();

    {
        let manager = manager(path);
        let mut graph = EntityGraph::new();
        let author = graph.create("Author");
        graph.set(author, "id", 1).unwrap();
        graph.set(author, "name", "Le Guin").unwrap();
        let book = graph.create("Book");
        graph.set(book, "isbn", "978-0441478125").unwrap();
        graph.set(book, "title", "The Left Hand of Darkness").unwrap();
        graph.set(book, "author", author).unwrap();
        graph.set(author, "books", FieldValue::set([book])).unwrap();
        manager.save(&mut graph, author).await.unwrap();

        assert_eq!(
            manager.store().keys().unwrap(),
            ["a:e:Author:1:books", "e:Author:1", "e:Book:978-0441478125"]
        );
    }

    let manager = manager(path);
    let mut graph = EntityGraph::new();
    let author = manager.load(&mut graph, "Author", 1).await.unwrap().unwrap();
    assert_eq!(graph.get(author, "name"), Some(&FieldValue::from("Le Guin")));
    let book = match graph.get(author, "books") {
        Some(FieldValue::Set(SetValue::Live(members))) => members[0].as_entity().unwrap(),
        other => panic!("expected a live set, got {other:?}"),
    };
    assert_eq!(graph.related(book, "author"), Some(author));
    assert_eq!(
        graph.get(book, "title"),
        Some(&FieldValue::from("The Left Hand of Darkness"))
    );
}

#[tokio::test]
async fn changed_fields_update_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kv.db");
    let manager = manager(path.to_str().unwrap());

    let mut graph = EntityGraph::new();
    let author = graph.create("Author");
    graph.set(author, "id", 1).unwrap();
    graph.set(author, "name", "first").unwrap();
    manager.save(&mut graph, author).await.unwrap();
    graph.set(author, "name", "second").unwrap();
    manager.save(&mut graph, author).await.unwrap();
    graph.unset(author, "name").unwrap();
    manager.save(&mut graph, author).await.unwrap();

    let mut fresh = EntityGraph::new();
    let loaded = manager.load(&mut fresh, "Author", 1).await.unwrap().unwrap();
    assert_eq!(fresh.get(loaded, "name"), None);

    manager.remove(&mut graph, author).await.unwrap();
    assert!(!manager.has("Author", 1).await.unwrap());
    assert!(manager.store().keys().unwrap().is_empty());
}

#[tokio::test]
async fn lazy_set_scans_sqlite_in_pages() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kv.db");
    let manager = manager(path.to_str().unwrap());

    let mut graph = EntityGraph::new();
    let author = graph.create("Author");
    graph.set(author, "id", 1).unwrap();
    let visits = manager.lazy_set(&graph, author, "visits").unwrap();
    visits.add(&mut graph, Member::from(1)).await.unwrap();
    manager.save(&mut graph, author).await.unwrap();

    let visits = manager.lazy_set(&graph, author, "visits").unwrap();
    for day in 2..=5 {
        visits.add(&mut graph, Member::from(day)).await.unwrap();
    }
    assert_eq!(visits.size(&graph).await.unwrap(), 5);
    let all = visits.to_vec(&mut graph).await.unwrap();
    assert_eq!(all, (1..=5).map(Member::from).collect::<Vec<_>>());
}
