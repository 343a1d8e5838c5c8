//! The [`KeyValueStore`] trait defining the transport contract.
//!
//! One call to [`KeyValueStore::execute`] is one network round trip. Commands
//! run in order and a batch is not transactional: if the transport fails
//! part way, earlier commands stay applied. Backends (InMemoryStore,
//! SqliteStore, or a network client) are swappable without touching the
//! engine.

use std::future::Future;

use crate::error::StorageError;
use crate::types::{Command, Reply};

/// The storage contract consumed by the engine.
pub trait KeyValueStore: Send + Sync {
    /// Executes `commands` in order and returns one reply per command.
    fn execute(
        &self,
        commands: Vec<Command>,
    ) -> impl Future<Output = Result<Vec<Reply>, StorageError>> + Send;

    /// Executes a single command as its own round trip.
    fn execute_one(
        &self,
        command: Command,
    ) -> impl Future<Output = Result<Reply, StorageError>> + Send {
        async move {
            let name = command.name();
            self.execute(vec![command])
                .await?
                .pop()
                .ok_or_else(|| StorageError::Connection(format!("no reply to {name}")))
        }
    }
}
