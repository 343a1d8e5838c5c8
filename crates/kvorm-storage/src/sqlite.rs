//! SQLite implementation of [`KeyValueStore`].
//!
//! [`SqliteStore`] keeps the keyspace in two tables, `kv_hash` and `kv_set`,
//! with WAL mode and automatic schema migrations. Commands of a batch are
//! applied one by one with no wrapping transaction, matching the
//! non-transactional contract of the trait. Scan cursors are row sequence
//! numbers, so a scan never revisits an entry even when the record changes
//! between pages.

use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use rusqlite::{params, Connection, OptionalExtension};
use rusqlite_migration::{Migrations, M};

use crate::error::StorageError;
use crate::traits::KeyValueStore;
use crate::types::{Command, Reply};

/// `kv_hash` and `kv_set`, versioned through `user_version`.
fn keyspace_migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(include_str!("migrations/001_initial_schema.sql"))])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordKind {
    Hash,
    Set,
}

/// SQLite-backed implementation of [`KeyValueStore`].
///
/// The connection sits behind a mutex and batches run on tokio's blocking
/// pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) a SQLite database at `path`.
    pub fn new(path: &str) -> Result<Self, StorageError> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Opens an in-memory SQLite database (for testing).
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    /// Brings the keyspace tables of `conn` up to date.
    fn with_connection(mut conn: Connection) -> Result<Self, StorageError> {
        // One writer, readers alongside it.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        keyspace_migrations()
            .to_latest(&mut conn)
            .map_err(|e| StorageError::Migration(e.to_string()))?;
        Ok(SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Every stored key, sorted.
    pub fn keys(&self) -> Result<Vec<String>, StorageError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT key FROM kv_hash UNION SELECT key FROM kv_set ORDER BY key",
        )?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    fn run_batch(
        conn: &Arc<Mutex<Connection>>,
        commands: Vec<Command>,
    ) -> Result<Vec<Reply>, StorageError> {
        let conn = lock(conn)?;
        commands
            .into_iter()
            .map(|command| apply(&conn, command))
            .collect()
    }
}

impl KeyValueStore for SqliteStore {
    async fn execute(&self, commands: Vec<Command>) -> Result<Vec<Reply>, StorageError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || Self::run_batch(&conn, commands))
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
    conn.lock()
        .map_err(|_| StorageError::Connection("sqlite connection lock poisoned".to_string()))
}

fn apply(conn: &Connection, command: Command) -> Result<Reply, StorageError> {
    let reply = match command {
        Command::HGetAll(key) => {
            expect_kind(conn, &key, RecordKind::Hash)?;
            let mut stmt =
                conn.prepare_cached("SELECT field, value FROM kv_hash WHERE key = ?1 ORDER BY seq")?;
            let hash = stmt
                .query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<IndexMap<String, String>, _>>()?;
            Reply::Hash(hash)
        }
        Command::HGet { key, field } => {
            expect_kind(conn, &key, RecordKind::Hash)?;
            let value = conn
                .query_row(
                    "SELECT value FROM kv_hash WHERE key = ?1 AND field = ?2",
                    params![key, field],
                    |row| row.get(0),
                )
                .optional()?;
            Reply::Value(value)
        }
        Command::HSet { key, fields } => {
            expect_kind(conn, &key, RecordKind::Hash)?;
            let mut created = 0;
            for (field, value) in fields {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM kv_hash WHERE key = ?1 AND field = ?2)",
                    params![key, field],
                    |row| row.get(0),
                )?;
                conn.execute(
                    "INSERT INTO kv_hash (key, field, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
                    params![key, field, value],
                )?;
                if !exists {
                    created += 1;
                }
            }
            Reply::Int(created)
        }
        Command::HDel { key, fields } => {
            expect_kind(conn, &key, RecordKind::Hash)?;
            let mut removed = 0;
            for field in fields {
                removed += conn.execute(
                    "DELETE FROM kv_hash WHERE key = ?1 AND field = ?2",
                    params![key, field],
                )? as i64;
            }
            Reply::Int(removed)
        }
        Command::HExists { key, field } => {
            expect_kind(conn, &key, RecordKind::Hash)?;
            Reply::Bool(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM kv_hash WHERE key = ?1 AND field = ?2)",
                params![key, field],
                |row| row.get(0),
            )?)
        }
        Command::HLen(key) => {
            expect_kind(conn, &key, RecordKind::Hash)?;
            Reply::Int(conn.query_row(
                "SELECT COUNT(*) FROM kv_hash WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )?)
        }
        Command::HScan { key, cursor, count } => {
            expect_kind(conn, &key, RecordKind::Hash)?;
            let mut stmt = conn.prepare_cached(
                "SELECT seq, field, value FROM kv_hash
                 WHERE key = ?1 AND seq > ?2 ORDER BY seq LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![key, cursor as i64, limit(count)], |row| {
                    Ok((row.get::<_, i64>(0)?, (row.get(1)?, row.get(2)?)))
                })?
                .collect::<Result<Vec<(i64, (String, String))>, _>>()?;
            let cursor = next_cursor(conn, "kv_hash", &key, &rows)?;
            Reply::HashPage {
                cursor,
                entries: rows.into_iter().map(|(_, entry)| entry).collect(),
            }
        }
        Command::SAdd { key, members } => {
            expect_kind(conn, &key, RecordKind::Set)?;
            let mut added = 0;
            for member in members {
                added += conn.execute(
                    "INSERT OR IGNORE INTO kv_set (key, member) VALUES (?1, ?2)",
                    params![key, member],
                )? as i64;
            }
            Reply::Int(added)
        }
        Command::SRem { key, members } => {
            expect_kind(conn, &key, RecordKind::Set)?;
            let mut removed = 0;
            for member in members {
                removed += conn.execute(
                    "DELETE FROM kv_set WHERE key = ?1 AND member = ?2",
                    params![key, member],
                )? as i64;
            }
            Reply::Int(removed)
        }
        Command::SIsMember { key, member } => {
            expect_kind(conn, &key, RecordKind::Set)?;
            Reply::Bool(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM kv_set WHERE key = ?1 AND member = ?2)",
                params![key, member],
                |row| row.get(0),
            )?)
        }
        Command::SCard(key) => {
            expect_kind(conn, &key, RecordKind::Set)?;
            Reply::Int(conn.query_row(
                "SELECT COUNT(*) FROM kv_set WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )?)
        }
        Command::SMembers(key) => {
            expect_kind(conn, &key, RecordKind::Set)?;
            let mut stmt =
                conn.prepare_cached("SELECT member FROM kv_set WHERE key = ?1 ORDER BY seq")?;
            let members = stmt
                .query_map(params![key], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Reply::Members(members)
        }
        Command::SScan { key, cursor, count } => {
            expect_kind(conn, &key, RecordKind::Set)?;
            let mut stmt = conn.prepare_cached(
                "SELECT seq, member FROM kv_set
                 WHERE key = ?1 AND seq > ?2 ORDER BY seq LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![key, cursor as i64, limit(count)], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get(1)?))
                })?
                .collect::<Result<Vec<(i64, String)>, _>>()?;
            let cursor = next_cursor(conn, "kv_set", &key, &rows)?;
            Reply::SetPage {
                cursor,
                members: rows.into_iter().map(|(_, member)| member).collect(),
            }
        }
        Command::Del(keys) => {
            let mut deleted = 0;
            for key in keys {
                let rows = conn.execute("DELETE FROM kv_hash WHERE key = ?1", params![key])?
                    + conn.execute("DELETE FROM kv_set WHERE key = ?1", params![key])?;
                if rows > 0 {
                    deleted += 1;
                }
            }
            Reply::Int(deleted)
        }
        Command::Exists(key) => Reply::Bool(record_kind(conn, &key)?.is_some()),
    };
    Ok(reply)
}

fn record_kind(conn: &Connection, key: &str) -> Result<Option<RecordKind>, StorageError> {
    let (hash, set): (bool, bool) = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM kv_hash WHERE key = ?1),
                EXISTS(SELECT 1 FROM kv_set WHERE key = ?1)",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(match (hash, set) {
        (true, _) => Some(RecordKind::Hash),
        (false, true) => Some(RecordKind::Set),
        (false, false) => None,
    })
}

fn expect_kind(conn: &Connection, key: &str, kind: RecordKind) -> Result<(), StorageError> {
    match record_kind(conn, key)? {
        Some(found) if found != kind => Err(StorageError::Connection(format!(
            "WRONGTYPE operation against key '{key}' holding the wrong kind of value"
        ))),
        _ => Ok(()),
    }
}

fn limit(count: usize) -> i64 {
    count.max(1).min(i64::MAX as usize) as i64
}

/// Cursor for the page after `rows`: the last sequence number if anything
/// follows it, otherwise 0.
fn next_cursor<T>(
    conn: &Connection,
    table: &str,
    key: &str,
    rows: &[(i64, T)],
) -> Result<u64, StorageError> {
    let Some((last, _)) = rows.last() else {
        return Ok(0);
    };
    let more: bool = conn.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE key = ?1 AND seq > ?2)"),
        params![key, last],
        |row| row.get(0),
    )?;
    Ok(if more { *last as u64 } else { 0 })
}
