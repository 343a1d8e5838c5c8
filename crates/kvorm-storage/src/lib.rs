//! Storage layer for kvorm entity graphs.
//!
//! Provides the [`KeyValueStore`] transport contract, the [`InMemoryStore`]
//! and [`SqliteStore`] backends, and the [`EntityManager`] that executes
//! operations planned by kvorm-core against a store.
//!
//! # Modules
//!
//! - [`error`]: StorageError enum with all failure modes
//! - [`types`]: Command and Reply wire types
//! - [`traits`]: KeyValueStore trait definition
//! - [`memory`]: InMemoryStore implementation
//! - [`sqlite`]: SqliteStore implementation and its table migrations
//! - [`config`]: EngineConfig from JSON or environment
//! - [`manager`]: save/remove/load orchestration
//! - [`lazy`]: staged and storage-backed lazy collection adapters

pub mod config;
pub mod error;
pub mod lazy;
pub mod manager;
pub mod memory;
pub mod sqlite;
pub mod traits;
pub mod types;

// Re-export key types for ergonomic use.
pub use config::{BackendConfig, EngineConfig};
pub use error::StorageError;
pub use lazy::{
    BackedMap, BackedSet, EntryCursor, LazyMap, LazySet, MapAdapter, MemberCursor, SetAdapter,
    StagedMap, StagedSet,
};
pub use manager::EntityManager;
pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use traits::KeyValueStore;
pub use types::{Command, Reply};
