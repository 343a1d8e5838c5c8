//! Entity schema registry.
//!
//! A [`SchemaRegistry`] maps an entity type name to its [`EntitySchema`]: the
//! ordered field list with each field's kind, storage name and, for relations,
//! the target type and cascade flags. The registry is built once at program
//! initialization and is only ever read by the planners and the hydrator.
//!
//! Registration is permissive. Structural problems (no fields, zero or several
//! identifier fields) surface as [`CoreError::Schema`] when a planner resolves
//! the type, so they are reported at the point of use.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Cascade flags on a relation field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cascade {
    /// Plan the related entity when the link is new or changed.
    pub insert: bool,
    /// Plan the related entity when the link is unchanged.
    pub update: bool,
}

impl Cascade {
    pub const NONE: Cascade = Cascade {
        insert: false,
        update: false,
    };
    pub const INSERT: Cascade = Cascade {
        insert: true,
        update: false,
    };
    pub const UPDATE: Cascade = Cascade {
        insert: false,
        update: true,
    };
    pub const ALL: Cascade = Cascade {
        insert: true,
        update: true,
    };

    pub fn any(self) -> bool {
        self.insert || self.update
    }
}

/// Target and cascade behaviour of a relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSpec {
    pub target: String,
    pub cascade: Cascade,
}

/// What a field holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    /// A plain scalar stored in the owner's hash.
    Scalar,
    /// A single reference to another entity, embedded in the owner's hash.
    Relation(RelationSpec),
    /// A set record. `relation` is set when members are entities. `lazy`
    /// fields are never diffed wholesale or fetched eagerly; they are served
    /// by the lazy collection adapters.
    Set {
        relation: Option<RelationSpec>,
        lazy: bool,
    },
    /// A map record, keyed by scalars.
    Map {
        relation: Option<RelationSpec>,
        lazy: bool,
    },
}

impl FieldKind {
    pub fn is_collection(&self) -> bool {
        matches!(self, FieldKind::Set { .. } | FieldKind::Map { .. })
    }

    pub fn is_lazy(&self) -> bool {
        matches!(
            self,
            FieldKind::Set { lazy: true, .. } | FieldKind::Map { lazy: true, .. }
        )
    }

    /// The relation spec of a single relation or a relation collection.
    pub fn relation(&self) -> Option<&RelationSpec> {
        match self {
            FieldKind::Relation(rel) => Some(rel),
            FieldKind::Set { relation, .. } | FieldKind::Map { relation, .. } => relation.as_ref(),
            FieldKind::Scalar => None,
        }
    }
}

/// One declared field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    /// Name used on the in-memory entity.
    pub name: String,
    /// Name used as the hash field / collection key suffix in storage.
    pub storage_name: String,
    pub kind: FieldKind,
    pub identifier: bool,
}

/// Schema of one entity type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySchema {
    name: String,
    fields: Vec<FieldSchema>,
}

impl EntitySchema {
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            schema: EntitySchema {
                name: name.into(),
                fields: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldSchema] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_by_storage_name(&self, storage_name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.storage_name == storage_name)
    }

    /// The identifier field. Only valid after [`EntitySchema::validate`].
    pub fn identifier(&self) -> Result<&FieldSchema, CoreError> {
        let mut ids = self.fields.iter().filter(|f| f.identifier);
        match (ids.next(), ids.next()) {
            (Some(id), None) => Ok(id),
            (None, _) => Err(CoreError::schema(&self.name, "no identifier field declared")),
            (Some(_), Some(_)) => Err(CoreError::schema(
                &self.name,
                "more than one identifier field declared",
            )),
        }
    }

    /// Checks that the schema declares fields and exactly one identifier.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.fields.is_empty() {
            return Err(CoreError::schema(&self.name, "no fields declared"));
        }
        self.identifier().map(|_| ())
    }
}

/// Fluent construction of an [`EntitySchema`].
#[derive(Debug)]
pub struct SchemaBuilder {
    schema: EntitySchema,
}

impl SchemaBuilder {
    /// Declares the identifier field (a scalar).
    pub fn id(self, name: &str) -> Self {
        self.push(name, FieldKind::Scalar, true)
    }

    pub fn scalar(self, name: &str) -> Self {
        self.push(name, FieldKind::Scalar, false)
    }

    pub fn relation(self, name: &str, target: &str, cascade: Cascade) -> Self {
        self.push(name, FieldKind::Relation(relation(target, cascade)), false)
    }

    pub fn set(self, name: &str) -> Self {
        self.push(
            name,
            FieldKind::Set {
                relation: None,
                lazy: false,
            },
            false,
        )
    }

    pub fn relation_set(self, name: &str, target: &str, cascade: Cascade) -> Self {
        self.push(
            name,
            FieldKind::Set {
                relation: Some(relation(target, cascade)),
                lazy: false,
            },
            false,
        )
    }

    pub fn map(self, name: &str) -> Self {
        self.push(
            name,
            FieldKind::Map {
                relation: None,
                lazy: false,
            },
            false,
        )
    }

    pub fn relation_map(self, name: &str, target: &str, cascade: Cascade) -> Self {
        self.push(
            name,
            FieldKind::Map {
                relation: Some(relation(target, cascade)),
                lazy: false,
            },
            false,
        )
    }

    /// Declares a lazily-served set. `target` makes it a relation set.
    pub fn lazy_set(self, name: &str, target: Option<(&str, Cascade)>) -> Self {
        self.push(
            name,
            FieldKind::Set {
                relation: target.map(|(t, c)| relation(t, c)),
                lazy: true,
            },
            false,
        )
    }

    /// Declares a lazily-served map. `target` makes it a relation map.
    pub fn lazy_map(self, name: &str, target: Option<(&str, Cascade)>) -> Self {
        self.push(
            name,
            FieldKind::Map {
                relation: target.map(|(t, c)| relation(t, c)),
                lazy: true,
            },
            false,
        )
    }

    /// Overrides the storage name of the most recently declared field.
    pub fn stored_as(mut self, storage_name: &str) -> Self {
        if let Some(last) = self.schema.fields.last_mut() {
            last.storage_name = storage_name.to_string();
        }
        self
    }

    /// Adds a fully-specified field.
    pub fn field(mut self, field: FieldSchema) -> Self {
        self.schema.fields.push(field);
        self
    }

    pub fn build(self) -> EntitySchema {
        self.schema
    }

    fn push(self, name: &str, kind: FieldKind, identifier: bool) -> Self {
        self.field(FieldSchema {
            name: name.to_string(),
            storage_name: name.to_string(),
            kind,
            identifier,
        })
    }
}

fn relation(target: &str, cascade: Cascade) -> RelationSpec {
    RelationSpec {
        target: target.to_string(),
        cascade,
    }
}

/// Type name to schema lookup.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    types: IndexMap<String, EntitySchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a schema under its type name.
    pub fn register(&mut self, schema: EntitySchema) -> &mut Self {
        self.types.insert(schema.name.clone(), schema);
        self
    }

    pub fn with(mut self, schema: EntitySchema) -> Self {
        self.register(schema);
        self
    }

    /// Looks up a schema without validating it.
    pub fn get(&self, type_name: &str) -> Option<&EntitySchema> {
        self.types.get(type_name)
    }

    /// Looks up and validates a schema.
    pub fn resolve(&self, type_name: &str) -> Result<&EntitySchema, CoreError> {
        let schema = self
            .types
            .get(type_name)
            .ok_or_else(|| CoreError::schema(type_name, "entity type is not registered"))?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}
