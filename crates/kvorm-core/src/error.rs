//! Core error types for kvorm-core.
//!
//! Uses `thiserror` for structured, matchable error variants. Every variant is
//! raised synchronously during planning or decoding, before any I/O, and is
//! deterministic for a given entity graph and schema.

use thiserror::Error;

use crate::entity::EntityKey;
use crate::id::EntityId;

/// Core errors produced by the kvorm-core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The entity type is not registered, declares no fields, or does not
    /// declare exactly one identifier field.
    #[error("schema error for '{type_name}': {reason}")]
    Schema { type_name: String, reason: String },

    /// The identifier field is missing or holds something other than a string
    /// or number.
    #[error("identity error for '{type_name}.{field}': {reason}")]
    Identity {
        type_name: String,
        field: String,
        reason: String,
    },

    /// Two distinct instances resolve to the same entity id within one save.
    #[error("duplicate identity: more than one instance maps to '{id}'")]
    DuplicateIdentity { id: EntityId },

    /// A field holds a value whose shape does not match its declared kind.
    #[error("field '{type_name}.{field}' holds a value that is not {expected}")]
    FieldMismatch {
        type_name: String,
        field: String,
        expected: &'static str,
    },

    /// An encoded value could not be decoded.
    #[error("cannot decode '{encoded}': {reason}")]
    Codec { encoded: String, reason: String },

    /// A storage key does not follow the key naming scheme.
    #[error("invalid storage key: '{key}'")]
    InvalidKey { key: String },

    /// An entity key does not address an entity in the graph.
    #[error("entity not found: {key}")]
    EntityNotFound { key: EntityKey },
}

impl CoreError {
    pub(crate) fn schema(type_name: &str, reason: impl Into<String>) -> Self {
        CoreError::Schema {
            type_name: type_name.to_string(),
            reason: reason.into(),
        }
    }
}
