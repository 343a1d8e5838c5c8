//! In-memory implementation of [`KeyValueStore`].
//!
//! [`InMemoryStore`] is a first-class backend for tests and ephemeral
//! sessions. It follows Redis keyspace semantics: reading a missing key
//! yields an empty record, a record that becomes empty disappears, and
//! using a key with the wrong record type is an error.
//!
//! It also counts round trips and can inject a transport failure part way
//! through a batch, which is how partial writes are exercised.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use indexmap::{IndexMap, IndexSet};

use crate::error::StorageError;
use crate::traits::KeyValueStore;
use crate::types::{Command, Reply};

const NO_FAILURE: usize = usize::MAX;

#[derive(Debug, Clone)]
enum Record {
    Hash(IndexMap<String, String>),
    Set(IndexSet<String>),
}

impl Record {
    fn is_empty(&self) -> bool {
        match self {
            Record::Hash(h) => h.is_empty(),
            Record::Set(s) => s.is_empty(),
        }
    }
}

/// DashMap-backed keyspace.
#[derive(Debug)]
pub struct InMemoryStore {
    records: DashMap<String, Record>,
    round_trips: AtomicUsize,
    fail_after: AtomicUsize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore {
            records: DashMap::new(),
            round_trips: AtomicUsize::new(0),
            fail_after: AtomicUsize::new(NO_FAILURE),
        }
    }

    /// Number of `execute` calls so far.
    pub fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::SeqCst)
    }

    /// Makes the next batch apply `n` commands and then fail with
    /// [`StorageError::Connection`].
    pub fn fail_after(&self, n: usize) {
        self.fail_after.store(n, Ordering::SeqCst);
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    /// Every stored key, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.records.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys
    }

    fn apply(&self, command: Command) -> Result<Reply, StorageError> {
        let reply = match command {
            Command::HGetAll(key) => {
                Reply::Hash(self.read_hash(&key, |h| h.clone())?.unwrap_or_default())
            }
            Command::HGet { key, field } => {
                Reply::Value(self.read_hash(&key, |h| h.get(&field).cloned())?.flatten())
            }
            Command::HSet { key, fields } => Reply::Int(self.write_hash(&key, |h| {
                fields
                    .into_iter()
                    .filter(|(f, v)| h.insert(f.clone(), v.clone()).is_none())
                    .count() as i64
            })?),
            Command::HDel { key, fields } => Reply::Int(self.write_hash(&key, |h| {
                fields
                    .iter()
                    .filter(|f| h.shift_remove(f.as_str()).is_some())
                    .count() as i64
            })?),
            Command::HExists { key, field } => {
                Reply::Bool(self.read_hash(&key, |h| h.contains_key(&field))?.unwrap_or(false))
            }
            Command::HLen(key) => Reply::Int(self.read_hash(&key, |h| h.len() as i64)?.unwrap_or(0)),
            Command::HScan { key, cursor, count } => {
                let (cursor, entries) = self
                    .read_hash(&key, |h| {
                        page(h.len(), cursor, count, |i| {
                            h.get_index(i).map(|(k, v)| (k.clone(), v.clone()))
                        })
                    })?
                    .unwrap_or((0, Vec::new()));
                Reply::HashPage { cursor, entries }
            }
            Command::SAdd { key, members } => Reply::Int(self.write_set(&key, |s| {
                members.into_iter().filter(|m| s.insert(m.clone())).count() as i64
            })?),
            Command::SRem { key, members } => Reply::Int(self.write_set(&key, |s| {
                members.iter().filter(|m| s.shift_remove(m.as_str())).count() as i64
            })?),
            Command::SIsMember { key, member } => {
                Reply::Bool(self.read_set(&key, |s| s.contains(&member))?.unwrap_or(false))
            }
            Command::SCard(key) => Reply::Int(self.read_set(&key, |s| s.len() as i64)?.unwrap_or(0)),
            Command::SMembers(key) => Reply::Members(
                self.read_set(&key, |s| s.iter().cloned().collect())?
                    .unwrap_or_default(),
            ),
            Command::SScan { key, cursor, count } => {
                let (cursor, members) = self
                    .read_set(&key, |s| page(s.len(), cursor, count, |i| s.get_index(i).cloned()))?
                    .unwrap_or((0, Vec::new()));
                Reply::SetPage { cursor, members }
            }
            Command::Del(keys) => Reply::Int(
                keys.iter()
                    .filter(|k| self.records.remove(k.as_str()).is_some())
                    .count() as i64,
            ),
            Command::Exists(key) => Reply::Bool(self.records.contains_key(&key)),
        };
        Ok(reply)
    }

    fn read_hash<T>(
        &self,
        key: &str,
        f: impl FnOnce(&IndexMap<String, String>) -> T,
    ) -> Result<Option<T>, StorageError> {
        match self.records.get(key).as_deref() {
            Some(Record::Hash(h)) => Ok(Some(f(h))),
            Some(Record::Set(_)) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    fn read_set<T>(
        &self,
        key: &str,
        f: impl FnOnce(&IndexSet<String>) -> T,
    ) -> Result<Option<T>, StorageError> {
        match self.records.get(key).as_deref() {
            Some(Record::Set(s)) => Ok(Some(f(s))),
            Some(Record::Hash(_)) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    fn write_hash<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut IndexMap<String, String>) -> T,
    ) -> Result<T, StorageError> {
        let out = {
            let mut entry = self
                .records
                .entry(key.to_string())
                .or_insert_with(|| Record::Hash(IndexMap::new()));
            match entry.value_mut() {
                Record::Hash(h) => f(h),
                Record::Set(_) => return Err(wrong_type(key)),
            }
        };
        self.records.remove_if(key, |_, r| r.is_empty());
        Ok(out)
    }

    fn write_set<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut IndexSet<String>) -> T,
    ) -> Result<T, StorageError> {
        let out = {
            let mut entry = self
                .records
                .entry(key.to_string())
                .or_insert_with(|| Record::Set(IndexSet::new()));
            match entry.value_mut() {
                Record::Set(s) => f(s),
                Record::Hash(_) => return Err(wrong_type(key)),
            }
        };
        self.records.remove_if(key, |_, r| r.is_empty());
        Ok(out)
    }
}

impl KeyValueStore for InMemoryStore {
    async fn execute(&self, commands: Vec<Command>) -> Result<Vec<Reply>, StorageError> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        let limit = self.fail_after.swap(NO_FAILURE, Ordering::SeqCst);

        let mut replies = Vec::with_capacity(commands.len());
        for command in commands {
            if replies.len() == limit {
                break;
            }
            replies.push(self.apply(command)?);
        }
        if limit != NO_FAILURE {
            return Err(StorageError::Connection(format!(
                "connection reset after {} commands",
                replies.len()
            )));
        }
        Ok(replies)
    }
}

/// One page of a cursor scan over `len` indexed items. The returned cursor is
/// 0 once the scan is complete.
fn page<T>(
    len: usize,
    cursor: u64,
    count: usize,
    item: impl Fn(usize) -> Option<T>,
) -> (u64, Vec<T>) {
    let start = cursor as usize;
    let end = start.saturating_add(count.max(1)).min(len);
    let items = (start..end).filter_map(item).collect();
    let next = if end >= len { 0 } else { end as u64 };
    (next, items)
}

fn wrong_type(key: &str) -> StorageError {
    StorageError::Connection(format!(
        "WRONGTYPE operation against key '{key}' holding the wrong kind of value"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hset(key: &str, pairs: &[(&str, &str)]) -> Command {
        Command::HSet {
            key: key.into(),
            fields: pairs
                .iter()
                .map(|(f, v)| (f.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn emptied_records_disappear() {
        let store = InMemoryStore::new();
        store
            .execute(vec![
                hset("e:A:1", &[("id", "i:1")]),
                Command::SAdd {
                    key: "a:e:A:1:tags".into(),
                    members: vec!["s:x".into()],
                },
            ])
            .await
            .unwrap();
        assert_eq!(store.len(), 2);

        store
            .execute(vec![
                Command::HDel {
                    key: "e:A:1".into(),
                    fields: vec!["id".into()],
                },
                Command::SRem {
                    key: "a:e:A:1:tags".into(),
                    members: vec!["s:x".into()],
                },
            ])
            .await
            .unwrap();
        assert!(store.is_empty());
        assert_eq!(store.round_trips(), 2);
    }

    #[tokio::test]
    async fn wrong_record_type_is_rejected() {
        let store = InMemoryStore::new();
        store.execute(vec![hset("k", &[("f", "v")])]).await.unwrap();
        let err = store
            .execute_one(Command::SCard("k".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Connection(msg) if msg.starts_with("WRONGTYPE")));
    }

    #[tokio::test]
    async fn scan_pages_until_cursor_returns_to_zero() {
        let store = InMemoryStore::new();
        let members: Vec<String> = (0..5).map(|i| format!("i:{i}")).collect();
        store
            .execute(vec![Command::SAdd {
                key: "s".into(),
                members: members.clone(),
            }])
            .await
            .unwrap();

        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let (next, page) = store
                .execute_one(Command::SScan {
                    key: "s".into(),
                    cursor,
                    count: 2,
                })
                .await
                .unwrap()
                .into_set_page("SSCAN")
                .unwrap();
            seen.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(seen, members);
    }

    #[tokio::test]
    async fn injected_failure_keeps_earlier_commands() {
        let store = InMemoryStore::new();
        store.fail_after(1);
        let err = store
            .execute(vec![hset("a", &[("f", "1")]), hset("b", &[("f", "2")])])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Connection(_)));
        assert_eq!(store.keys(), ["a"]);

        // The injection is one-shot.
        store.execute(vec![hset("b", &[("f", "2")])]).await.unwrap();
        assert_eq!(store.keys(), ["a", "b"]);
    }
}
