//! Commands and replies exchanged with a [`KeyValueStore`](crate::KeyValueStore).
//!
//! The command set is the subset of a Redis-style keyspace the engine
//! needs: hash and set records plus key deletion and existence.

use std::fmt;

use indexmap::IndexMap;

use crate::error::StorageError;

/// A single storage command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    HGetAll(String),
    HGet { key: String, field: String },
    HSet { key: String, fields: Vec<(String, String)> },
    HDel { key: String, fields: Vec<String> },
    HExists { key: String, field: String },
    HLen(String),
    /// Cursor scan over hash entries. Cursor 0 starts a scan.
    HScan { key: String, cursor: u64, count: usize },
    SAdd { key: String, members: Vec<String> },
    SRem { key: String, members: Vec<String> },
    SIsMember { key: String, member: String },
    SCard(String),
    SMembers(String),
    /// Cursor scan over set members. Cursor 0 starts a scan.
    SScan { key: String, cursor: u64, count: usize },
    Del(Vec<String>),
    Exists(String),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::HGetAll(_) => "HGETALL",
            Command::HGet { .. } => "HGET",
            Command::HSet { .. } => "HSET",
            Command::HDel { .. } => "HDEL",
            Command::HExists { .. } => "HEXISTS",
            Command::HLen(_) => "HLEN",
            Command::HScan { .. } => "HSCAN",
            Command::SAdd { .. } => "SADD",
            Command::SRem { .. } => "SREM",
            Command::SIsMember { .. } => "SISMEMBER",
            Command::SCard(_) => "SCARD",
            Command::SMembers(_) => "SMEMBERS",
            Command::SScan { .. } => "SSCAN",
            Command::Del(_) => "DEL",
            Command::Exists(_) => "EXISTS",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reply to one [`Command`], in batch order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Number of fields, members or keys affected or counted.
    Int(i64),
    Bool(bool),
    Value(Option<String>),
    Hash(IndexMap<String, String>),
    Members(Vec<String>),
    HashPage {
        cursor: u64,
        entries: Vec<(String, String)>,
    },
    SetPage {
        cursor: u64,
        members: Vec<String>,
    },
}

impl Reply {
    fn kind(&self) -> &'static str {
        match self {
            Reply::Int(_) => "integer",
            Reply::Bool(_) => "boolean",
            Reply::Value(_) => "value",
            Reply::Hash(_) => "hash",
            Reply::Members(_) => "members",
            Reply::HashPage { .. } => "hash page",
            Reply::SetPage { .. } => "set page",
        }
    }

    fn unexpected(&self, command: &str) -> StorageError {
        StorageError::UnexpectedReply {
            command: command.to_string(),
            reply: self.kind().to_string(),
        }
    }

    pub fn into_int(self, command: &str) -> Result<i64, StorageError> {
        match self {
            Reply::Int(n) => Ok(n),
            other => Err(other.unexpected(command)),
        }
    }

    pub fn into_bool(self, command: &str) -> Result<bool, StorageError> {
        match self {
            Reply::Bool(b) => Ok(b),
            other => Err(other.unexpected(command)),
        }
    }

    pub fn into_value(self, command: &str) -> Result<Option<String>, StorageError> {
        match self {
            Reply::Value(v) => Ok(v),
            other => Err(other.unexpected(command)),
        }
    }

    pub fn into_hash(self, command: &str) -> Result<IndexMap<String, String>, StorageError> {
        match self {
            Reply::Hash(h) => Ok(h),
            other => Err(other.unexpected(command)),
        }
    }

    pub fn into_members(self, command: &str) -> Result<Vec<String>, StorageError> {
        match self {
            Reply::Members(m) => Ok(m),
            other => Err(other.unexpected(command)),
        }
    }

    pub fn into_hash_page(
        self,
        command: &str,
    ) -> Result<(u64, Vec<(String, String)>), StorageError> {
        match self {
            Reply::HashPage { cursor, entries } => Ok((cursor, entries)),
            other => Err(other.unexpected(command)),
        }
    }

    pub fn into_set_page(self, command: &str) -> Result<(u64, Vec<String>), StorageError> {
        match self {
            Reply::SetPage { cursor, members } => Ok((cursor, members)),
            other => Err(other.unexpected(command)),
        }
    }
}
