//! Storage error types for kvorm-storage.
//!
//! [`StorageError`] wraps planning errors from kvorm-core and adds the
//! failure modes of talking to a store: transport failures, backend errors,
//! replies that do not match the command sent, and configuration problems.
//! Transport errors are surfaced verbatim and never retried.

use thiserror::Error;

use kvorm_core::CoreError;

/// Errors produced by storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Planning or decoding failed before any I/O.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The transport failed. Commands earlier in the batch may have been
    /// applied.
    #[error("connection error: {0}")]
    Connection(String),

    /// SQLite backend error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Applying schema migrations failed.
    #[error("migration error: {0}")]
    Migration(String),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store answered a command with a reply of the wrong shape.
    #[error("unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: String, reply: String },

    /// Invalid configuration, or a configured limit was exceeded.
    #[error("config error: {0}")]
    Config(String),

    /// A lazy adapter was requested for a field not declared lazy.
    #[error("field '{type_name}.{field}' is not a lazy collection of that kind")]
    NotLazy { type_name: String, field: String },
}
