//! Lazy collection adapters.
//!
//! A lazy set or map field is never diffed wholesale or fetched eagerly.
//! Two implementations share each capability:
//!
//! - [`StagedSet`] / [`StagedMap`]: pure local state on the owner's field,
//!   used before the collection is bound to a storage record. The owner's
//!   next save writes every element and rebinds the field as backed.
//! - [`BackedSet`] / [`BackedMap`]: every operation is an immediate round
//!   trip. Iteration pages through the record with cursor scans and never
//!   holds the whole collection in memory. Scan order is whatever the store
//!   returns.
//!
//! [`EntityManager::lazy_set`] and [`EntityManager::lazy_map`] pick the
//! implementation from the field's runtime variant. Every cursor is fresh
//! and forward-only.

use std::collections::VecDeque;

use kvorm_core::schema::RelationSpec;
use kvorm_core::value::TAG_ENTITY;
use kvorm_core::{
    encode, entity_id, CollectionId, CoreError, EncodedValue, EntityGraph, EntityId, EntityKey,
    FieldValue, IdValue, MapValue, Member, SetValue, Value,
};

use crate::error::StorageError;
use crate::manager::EntityManager;
use crate::traits::KeyValueStore;
use crate::types::Command;

/// Set capability shared by staged and backed sets.
#[allow(async_fn_in_trait)]
pub trait LazySet {
    type Cursor: MemberCursor;

    /// Adds a member. An entity member of a relation set is saved first.
    async fn add(&self, graph: &mut EntityGraph, member: Member) -> Result<(), StorageError>;

    /// Adds a member without saving the related entity.
    async fn add_link(&self, graph: &mut EntityGraph, member: Member)
        -> Result<(), StorageError>;

    /// Removes a member, optionally deleting the referenced entity too.
    /// Returns whether the member was present.
    async fn delete(
        &self,
        graph: &mut EntityGraph,
        member: &Member,
        remove_entity: bool,
    ) -> Result<bool, StorageError>;

    async fn has(&self, graph: &EntityGraph, member: &Member) -> Result<bool, StorageError>;

    async fn size(&self, graph: &EntityGraph) -> Result<usize, StorageError>;

    fn cursor(&self) -> Self::Cursor;

    /// Every member, in iteration order.
    async fn to_vec(&self, graph: &mut EntityGraph) -> Result<Vec<Member>, StorageError> {
        let mut cursor = self.cursor();
        let mut out = Vec::new();
        while let Some(member) = cursor.next(graph).await? {
            out.push(member);
        }
        Ok(out)
    }
}

/// Map capability shared by staged and backed maps.
#[allow(async_fn_in_trait)]
pub trait LazyMap {
    type Cursor: EntryCursor;

    /// Sets an entry. An entity value of a relation map is saved first.
    async fn set(
        &self,
        graph: &mut EntityGraph,
        key: Value,
        member: Member,
    ) -> Result<(), StorageError>;

    /// Sets an entry without saving the related entity.
    async fn set_link(
        &self,
        graph: &mut EntityGraph,
        key: Value,
        member: Member,
    ) -> Result<(), StorageError>;

    /// Removes an entry, optionally deleting the referenced entity too.
    /// Returns whether the entry was present.
    async fn delete(
        &self,
        graph: &mut EntityGraph,
        key: &Value,
        remove_entity: bool,
    ) -> Result<bool, StorageError>;

    async fn has(&self, graph: &EntityGraph, key: &Value) -> Result<bool, StorageError>;

    async fn get(
        &self,
        graph: &mut EntityGraph,
        key: &Value,
    ) -> Result<Option<Member>, StorageError>;

    async fn size(&self, graph: &EntityGraph) -> Result<usize, StorageError>;

    fn cursor(&self) -> Self::Cursor;

    /// Every entry, in iteration order.
    async fn to_vec(&self, graph: &mut EntityGraph) -> Result<Vec<(Value, Member)>, StorageError> {
        let mut cursor = self.cursor();
        let mut out = Vec::new();
        while let Some(entry) = cursor.next(graph).await? {
            out.push(entry);
        }
        Ok(out)
    }
}

#[allow(async_fn_in_trait)]
pub trait MemberCursor {
    async fn next(&mut self, graph: &mut EntityGraph) -> Result<Option<Member>, StorageError>;
}

#[allow(async_fn_in_trait)]
pub trait EntryCursor {
    async fn next(
        &mut self,
        graph: &mut EntityGraph,
    ) -> Result<Option<(Value, Member)>, StorageError>;
}

// ---------------------------------------------------------------------------
// Staged
// ---------------------------------------------------------------------------

/// In-memory set held on the owner's field. Has no persistence side
/// effects: `remove_entity` is ignored and entity members are saved by the
/// owner's next cascading save.
#[derive(Debug, Clone)]
pub struct StagedSet {
    owner: EntityKey,
    type_name: String,
    field: String,
}

impl StagedSet {
    pub fn new(owner: EntityKey, type_name: &str, field: &str) -> Self {
        StagedSet {
            owner,
            type_name: type_name.to_string(),
            field: field.to_string(),
        }
    }

    fn members<'g>(&self, graph: &'g EntityGraph) -> &'g [Member] {
        match graph.get(self.owner, &self.field) {
            Some(FieldValue::Set(SetValue::Live(m) | SetValue::Staged(m))) => m,
            _ => &[],
        }
    }

    fn members_mut<'g>(&self, graph: &'g mut EntityGraph) -> Result<&'g mut Vec<Member>, StorageError> {
        let entity = graph.entity_mut(self.owner)?;
        if !matches!(
            entity.get(&self.field),
            Some(FieldValue::Set(SetValue::Live(_) | SetValue::Staged(_)))
        ) {
            entity.set(&self.field, FieldValue::staged_set());
        }
        match entity.get_mut(&self.field) {
            Some(FieldValue::Set(SetValue::Live(m) | SetValue::Staged(m))) => Ok(m),
            _ => Err(staged_mismatch(&self.type_name, &self.field, "a set")),
        }
    }
}

impl LazySet for StagedSet {
    type Cursor = StagedSetCursor;

    async fn add(&self, graph: &mut EntityGraph, member: Member) -> Result<(), StorageError> {
        self.add_link(graph, member).await
    }

    async fn add_link(&self, graph: &mut EntityGraph, member: Member) -> Result<(), StorageError> {
        let members = self.members_mut(graph)?;
        if !members.contains(&member) {
            members.push(member);
        }
        Ok(())
    }

    async fn delete(
        &self,
        graph: &mut EntityGraph,
        member: &Member,
        _remove_entity: bool,
    ) -> Result<bool, StorageError> {
        let members = self.members_mut(graph)?;
        let before = members.len();
        members.retain(|m| m != member);
        Ok(members.len() != before)
    }

    async fn has(&self, graph: &EntityGraph, member: &Member) -> Result<bool, StorageError> {
        Ok(self.members(graph).contains(member))
    }

    async fn size(&self, graph: &EntityGraph) -> Result<usize, StorageError> {
        Ok(self.members(graph).len())
    }

    fn cursor(&self) -> StagedSetCursor {
        StagedSetCursor {
            set: self.clone(),
            index: 0,
        }
    }
}

#[derive(Debug)]
pub struct StagedSetCursor {
    set: StagedSet,
    index: usize,
}

impl MemberCursor for StagedSetCursor {
    async fn next(&mut self, graph: &mut EntityGraph) -> Result<Option<Member>, StorageError> {
        let member = self.set.members(graph).get(self.index).cloned();
        if member.is_some() {
            self.index += 1;
        }
        Ok(member)
    }
}

/// In-memory map held on the owner's field. Setting an existing key
/// replaces its value in place.
#[derive(Debug, Clone)]
pub struct StagedMap {
    owner: EntityKey,
    type_name: String,
    field: String,
}

impl StagedMap {
    pub fn new(owner: EntityKey, type_name: &str, field: &str) -> Self {
        StagedMap {
            owner,
            type_name: type_name.to_string(),
            field: field.to_string(),
        }
    }

    fn entries<'g>(&self, graph: &'g EntityGraph) -> &'g [(Value, Member)] {
        match graph.get(self.owner, &self.field) {
            Some(FieldValue::Map(MapValue::Live(e) | MapValue::Staged(e))) => e,
            _ => &[],
        }
    }

    fn entries_mut<'g>(
        &self,
        graph: &'g mut EntityGraph,
    ) -> Result<&'g mut Vec<(Value, Member)>, StorageError> {
        let entity = graph.entity_mut(self.owner)?;
        if !matches!(
            entity.get(&self.field),
            Some(FieldValue::Map(MapValue::Live(_) | MapValue::Staged(_)))
        ) {
            entity.set(&self.field, FieldValue::staged_map());
        }
        match entity.get_mut(&self.field) {
            Some(FieldValue::Map(MapValue::Live(e) | MapValue::Staged(e))) => Ok(e),
            _ => Err(staged_mismatch(&self.type_name, &self.field, "a map")),
        }
    }
}

impl LazyMap for StagedMap {
    type Cursor = StagedMapCursor;

    async fn set(
        &self,
        graph: &mut EntityGraph,
        key: Value,
        member: Member,
    ) -> Result<(), StorageError> {
        self.set_link(graph, key, member).await
    }

    async fn set_link(
        &self,
        graph: &mut EntityGraph,
        key: Value,
        member: Member,
    ) -> Result<(), StorageError> {
        let entries = self.entries_mut(graph)?;
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = member,
            None => entries.push((key, member)),
        }
        Ok(())
    }

    async fn delete(
        &self,
        graph: &mut EntityGraph,
        key: &Value,
        _remove_entity: bool,
    ) -> Result<bool, StorageError> {
        let entries = self.entries_mut(graph)?;
        let before = entries.len();
        entries.retain(|(k, _)| k != key);
        Ok(entries.len() != before)
    }

    async fn has(&self, graph: &EntityGraph, key: &Value) -> Result<bool, StorageError> {
        Ok(self.entries(graph).iter().any(|(k, _)| k == key))
    }

    async fn get(
        &self,
        graph: &mut EntityGraph,
        key: &Value,
    ) -> Result<Option<Member>, StorageError> {
        Ok(self
            .entries(graph)
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, m)| m.clone()))
    }

    async fn size(&self, graph: &EntityGraph) -> Result<usize, StorageError> {
        Ok(self.entries(graph).len())
    }

    fn cursor(&self) -> StagedMapCursor {
        StagedMapCursor {
            map: self.clone(),
            index: 0,
        }
    }
}

#[derive(Debug)]
pub struct StagedMapCursor {
    map: StagedMap,
    index: usize,
}

impl EntryCursor for StagedMapCursor {
    async fn next(
        &mut self,
        graph: &mut EntityGraph,
    ) -> Result<Option<(Value, Member)>, StorageError> {
        let entry = self.map.entries(graph).get(self.index).cloned();
        if entry.is_some() {
            self.index += 1;
        }
        Ok(entry)
    }
}

// ---------------------------------------------------------------------------
// Backed
// ---------------------------------------------------------------------------

/// Set bound to its `a:` record.
pub struct BackedSet<'m, S> {
    manager: &'m EntityManager<S>,
    collection: CollectionId,
    relation: Option<RelationSpec>,
}

impl<'m, S: KeyValueStore> BackedSet<'m, S> {
    pub fn new(
        manager: &'m EntityManager<S>,
        collection: CollectionId,
        relation: Option<RelationSpec>,
    ) -> Self {
        BackedSet {
            manager,
            collection,
            relation,
        }
    }

    pub fn collection(&self) -> &CollectionId {
        &self.collection
    }
}

impl<'m, S: KeyValueStore> LazySet for BackedSet<'m, S> {
    type Cursor = BackedSetCursor<'m, S>;

    async fn add(&self, graph: &mut EntityGraph, member: Member) -> Result<(), StorageError> {
        if let (Some(_), Member::Entity(target)) = (&self.relation, &member) {
            self.manager.save(graph, *target).await?;
        }
        self.add_link(graph, member).await
    }

    async fn add_link(&self, graph: &mut EntityGraph, member: Member) -> Result<(), StorageError> {
        let encoded = encode_member(self.manager, graph, &member)?;
        self.manager
            .store()
            .execute_one(Command::SAdd {
                key: self.collection.to_string(),
                members: vec![encoded.into_string()],
            })
            .await?
            .into_int("SADD")?;
        Ok(())
    }

    async fn delete(
        &self,
        graph: &mut EntityGraph,
        member: &Member,
        remove_entity: bool,
    ) -> Result<bool, StorageError> {
        let encoded = encode_member(self.manager, graph, member)?;
        let removed = self
            .manager
            .store()
            .execute_one(Command::SRem {
                key: self.collection.to_string(),
                members: vec![encoded.into_string()],
            })
            .await?
            .into_int("SREM")?;
        if let (true, Member::Entity(target)) = (remove_entity, member) {
            self.manager.remove(graph, *target).await?;
        }
        Ok(removed > 0)
    }

    async fn has(&self, graph: &EntityGraph, member: &Member) -> Result<bool, StorageError> {
        let encoded = encode_member(self.manager, graph, member)?;
        self.manager
            .store()
            .execute_one(Command::SIsMember {
                key: self.collection.to_string(),
                member: encoded.into_string(),
            })
            .await?
            .into_bool("SISMEMBER")
    }

    async fn size(&self, _graph: &EntityGraph) -> Result<usize, StorageError> {
        let n = self
            .manager
            .store()
            .execute_one(Command::SCard(self.collection.to_string()))
            .await?
            .into_int("SCARD")?;
        Ok(n.max(0) as usize)
    }

    fn cursor(&self) -> BackedSetCursor<'m, S> {
        BackedSetCursor {
            manager: self.manager,
            collection: self.collection.clone(),
            scan: ScanState::Start,
            buffer: VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Start,
    At(u64),
    Done,
}

impl ScanState {
    fn cursor(self) -> Option<u64> {
        match self {
            ScanState::Start => Some(0),
            ScanState::At(c) => Some(c),
            ScanState::Done => None,
        }
    }

    fn advance(next: u64) -> Self {
        if next == 0 {
            ScanState::Done
        } else {
            ScanState::At(next)
        }
    }
}

/// SSCAN-driven cursor. Each page's entity members are loaded together.
pub struct BackedSetCursor<'m, S> {
    manager: &'m EntityManager<S>,
    collection: CollectionId,
    scan: ScanState,
    buffer: VecDeque<Member>,
}

impl<S: KeyValueStore> MemberCursor for BackedSetCursor<'_, S> {
    async fn next(&mut self, graph: &mut EntityGraph) -> Result<Option<Member>, StorageError> {
        loop {
            if let Some(member) = self.buffer.pop_front() {
                return Ok(Some(member));
            }
            let Some(cursor) = self.scan.cursor() else {
                return Ok(None);
            };
            let (next, page) = self
                .manager
                .store()
                .execute_one(Command::SScan {
                    key: self.collection.to_string(),
                    cursor,
                    count: self.manager.config().scan_count,
                })
                .await?
                .into_set_page("SSCAN")?;
            self.scan = ScanState::advance(next);
            let members = self.manager.resolve_members(graph, &page).await?;
            self.buffer.extend(members.into_iter().flatten());
        }
    }
}

/// Map bound to its `m:` record.
pub struct BackedMap<'m, S> {
    manager: &'m EntityManager<S>,
    collection: CollectionId,
    relation: Option<RelationSpec>,
}

impl<'m, S: KeyValueStore> BackedMap<'m, S> {
    pub fn new(
        manager: &'m EntityManager<S>,
        collection: CollectionId,
        relation: Option<RelationSpec>,
    ) -> Self {
        BackedMap {
            manager,
            collection,
            relation,
        }
    }

    pub fn collection(&self) -> &CollectionId {
        &self.collection
    }

    async fn raw_value(&self, key: &Value) -> Result<Option<String>, StorageError> {
        self.manager
            .store()
            .execute_one(Command::HGet {
                key: self.collection.to_string(),
                field: encode(key).into_string(),
            })
            .await?
            .into_value("HGET")
    }
}

impl<'m, S: KeyValueStore> LazyMap for BackedMap<'m, S> {
    type Cursor = BackedMapCursor<'m, S>;

    async fn set(
        &self,
        graph: &mut EntityGraph,
        key: Value,
        member: Member,
    ) -> Result<(), StorageError> {
        if let (Some(_), Member::Entity(target)) = (&self.relation, &member) {
            self.manager.save(graph, *target).await?;
        }
        self.set_link(graph, key, member).await
    }

    async fn set_link(
        &self,
        graph: &mut EntityGraph,
        key: Value,
        member: Member,
    ) -> Result<(), StorageError> {
        let encoded = encode_member(self.manager, graph, &member)?;
        self.manager
            .store()
            .execute_one(Command::HSet {
                key: self.collection.to_string(),
                fields: vec![(encode(&key).into_string(), encoded.into_string())],
            })
            .await?
            .into_int("HSET")?;
        Ok(())
    }

    async fn delete(
        &self,
        _graph: &mut EntityGraph,
        key: &Value,
        remove_entity: bool,
    ) -> Result<bool, StorageError> {
        let previous = if remove_entity {
            self.raw_value(key).await?
        } else {
            None
        };
        let removed = self
            .manager
            .store()
            .execute_one(Command::HDel {
                key: self.collection.to_string(),
                fields: vec![encode(key).into_string()],
            })
            .await?
            .into_int("HDEL")?;
        if let Some(target) = previous.filter(|raw| raw.starts_with(TAG_ENTITY)) {
            let id = EntityId::parse(&target)?;
            self.manager
                .remove_by_id(id.type_name(), &[IdValue::Str(id.id_part().to_string())])
                .await?;
        }
        Ok(removed > 0)
    }

    async fn has(&self, _graph: &EntityGraph, key: &Value) -> Result<bool, StorageError> {
        self.manager
            .store()
            .execute_one(Command::HExists {
                key: self.collection.to_string(),
                field: encode(key).into_string(),
            })
            .await?
            .into_bool("HEXISTS")
    }

    async fn get(
        &self,
        graph: &mut EntityGraph,
        key: &Value,
    ) -> Result<Option<Member>, StorageError> {
        let Some(raw) = self.raw_value(key).await? else {
            return Ok(None);
        };
        let mut resolved = self.manager.resolve_members(graph, &[raw]).await?;
        Ok(resolved.pop().flatten())
    }

    async fn size(&self, _graph: &EntityGraph) -> Result<usize, StorageError> {
        let n = self
            .manager
            .store()
            .execute_one(Command::HLen(self.collection.to_string()))
            .await?
            .into_int("HLEN")?;
        Ok(n.max(0) as usize)
    }

    fn cursor(&self) -> BackedMapCursor<'m, S> {
        BackedMapCursor {
            manager: self.manager,
            collection: self.collection.clone(),
            scan: ScanState::Start,
            buffer: VecDeque::new(),
        }
    }
}

/// HSCAN-driven cursor.
pub struct BackedMapCursor<'m, S> {
    manager: &'m EntityManager<S>,
    collection: CollectionId,
    scan: ScanState,
    buffer: VecDeque<(Value, Member)>,
}

impl<S: KeyValueStore> EntryCursor for BackedMapCursor<'_, S> {
    async fn next(
        &mut self,
        graph: &mut EntityGraph,
    ) -> Result<Option<(Value, Member)>, StorageError> {
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                return Ok(Some(entry));
            }
            let Some(cursor) = self.scan.cursor() else {
                return Ok(None);
            };
            let (next, page) = self
                .manager
                .store()
                .execute_one(Command::HScan {
                    key: self.collection.to_string(),
                    cursor,
                    count: self.manager.config().scan_count,
                })
                .await?
                .into_hash_page("HSCAN")?;
            self.scan = ScanState::advance(next);
            let entries = self.manager.resolve_entries(graph, page).await?;
            self.buffer.extend(entries);
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime dispatch
// ---------------------------------------------------------------------------

/// The adapter backing a lazy set field right now.
pub enum SetAdapter<'m, S> {
    Staged(StagedSet),
    Backed(BackedSet<'m, S>),
}

pub enum SetCursor<'m, S> {
    Staged(StagedSetCursor),
    Backed(BackedSetCursor<'m, S>),
}

impl<'m, S> SetAdapter<'m, S> {
    pub fn is_backed(&self) -> bool {
        matches!(self, SetAdapter::Backed(_))
    }
}

impl<'m, S: KeyValueStore> LazySet for SetAdapter<'m, S> {
    type Cursor = SetCursor<'m, S>;

    async fn add(&self, graph: &mut EntityGraph, member: Member) -> Result<(), StorageError> {
        match self {
            SetAdapter::Staged(s) => s.add(graph, member).await,
            SetAdapter::Backed(s) => s.add(graph, member).await,
        }
    }

    async fn add_link(&self, graph: &mut EntityGraph, member: Member) -> Result<(), StorageError> {
        match self {
            SetAdapter::Staged(s) => s.add_link(graph, member).await,
            SetAdapter::Backed(s) => s.add_link(graph, member).await,
        }
    }

    async fn delete(
        &self,
        graph: &mut EntityGraph,
        member: &Member,
        remove_entity: bool,
    ) -> Result<bool, StorageError> {
        match self {
            SetAdapter::Staged(s) => s.delete(graph, member, remove_entity).await,
            SetAdapter::Backed(s) => s.delete(graph, member, remove_entity).await,
        }
    }

    async fn has(&self, graph: &EntityGraph, member: &Member) -> Result<bool, StorageError> {
        match self {
            SetAdapter::Staged(s) => s.has(graph, member).await,
            SetAdapter::Backed(s) => s.has(graph, member).await,
        }
    }

    async fn size(&self, graph: &EntityGraph) -> Result<usize, StorageError> {
        match self {
            SetAdapter::Staged(s) => s.size(graph).await,
            SetAdapter::Backed(s) => s.size(graph).await,
        }
    }

    fn cursor(&self) -> SetCursor<'m, S> {
        match self {
            SetAdapter::Staged(s) => SetCursor::Staged(s.cursor()),
            SetAdapter::Backed(s) => SetCursor::Backed(s.cursor()),
        }
    }
}

impl<S: KeyValueStore> MemberCursor for SetCursor<'_, S> {
    async fn next(&mut self, graph: &mut EntityGraph) -> Result<Option<Member>, StorageError> {
        match self {
            SetCursor::Staged(c) => c.next(graph).await,
            SetCursor::Backed(c) => c.next(graph).await,
        }
    }
}

/// The adapter backing a lazy map field right now.
pub enum MapAdapter<'m, S> {
    Staged(StagedMap),
    Backed(BackedMap<'m, S>),
}

pub enum MapCursor<'m, S> {
    Staged(StagedMapCursor),
    Backed(BackedMapCursor<'m, S>),
}

impl<'m, S> MapAdapter<'m, S> {
    pub fn is_backed(&self) -> bool {
        matches!(self, MapAdapter::Backed(_))
    }
}

impl<'m, S: KeyValueStore> LazyMap for MapAdapter<'m, S> {
    type Cursor = MapCursor<'m, S>;

    async fn set(
        &self,
        graph: &mut EntityGraph,
        key: Value,
        member: Member,
    ) -> Result<(), StorageError> {
        match self {
            MapAdapter::Staged(m) => m.set(graph, key, member).await,
            MapAdapter::Backed(m) => m.set(graph, key, member).await,
        }
    }

    async fn set_link(
        &self,
        graph: &mut EntityGraph,
        key: Value,
        member: Member,
    ) -> Result<(), StorageError> {
        match self {
            MapAdapter::Staged(m) => m.set_link(graph, key, member).await,
            MapAdapter::Backed(m) => m.set_link(graph, key, member).await,
        }
    }

    async fn delete(
        &self,
        graph: &mut EntityGraph,
        key: &Value,
        remove_entity: bool,
    ) -> Result<bool, StorageError> {
        match self {
            MapAdapter::Staged(m) => m.delete(graph, key, remove_entity).await,
            MapAdapter::Backed(m) => m.delete(graph, key, remove_entity).await,
        }
    }

    async fn has(&self, graph: &EntityGraph, key: &Value) -> Result<bool, StorageError> {
        match self {
            MapAdapter::Staged(m) => m.has(graph, key).await,
            MapAdapter::Backed(m) => m.has(graph, key).await,
        }
    }

    async fn get(
        &self,
        graph: &mut EntityGraph,
        key: &Value,
    ) -> Result<Option<Member>, StorageError> {
        match self {
            MapAdapter::Staged(m) => m.get(graph, key).await,
            MapAdapter::Backed(m) => m.get(graph, key).await,
        }
    }

    async fn size(&self, graph: &EntityGraph) -> Result<usize, StorageError> {
        match self {
            MapAdapter::Staged(m) => m.size(graph).await,
            MapAdapter::Backed(m) => m.size(graph).await,
        }
    }

    fn cursor(&self) -> MapCursor<'m, S> {
        match self {
            MapAdapter::Staged(m) => MapCursor::Staged(m.cursor()),
            MapAdapter::Backed(m) => MapCursor::Backed(m.cursor()),
        }
    }
}

impl<S: KeyValueStore> EntryCursor for MapCursor<'_, S> {
    async fn next(
        &mut self,
        graph: &mut EntityGraph,
    ) -> Result<Option<(Value, Member)>, StorageError> {
        match self {
            MapCursor::Staged(c) => c.next(graph).await,
            MapCursor::Backed(c) => c.next(graph).await,
        }
    }
}

fn encode_member<S: KeyValueStore>(
    manager: &EntityManager<S>,
    graph: &EntityGraph,
    member: &Member,
) -> Result<EncodedValue, StorageError> {
    match member {
        Member::Value(v) => Ok(encode(v)),
        Member::Entity(target) => {
            let id = entity_id(manager.registry(), graph, *target)?;
            Ok(EncodedValue::from_raw(id.as_str()))
        }
    }
}

fn staged_mismatch(type_name: &str, field: &str, expected: &'static str) -> StorageError {
    CoreError::FieldMismatch {
        type_name: type_name.to_string(),
        field: field.to_string(),
        expected,
    }
    .into()
}
