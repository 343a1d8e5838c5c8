//! kvorm keyspace inspector.
//!
//! Provides the `kvorm` binary for reading records of a SQLite-backed
//! keyspace. Stored strings are decoded with the kvorm value codec and
//! printed as JSON: scalars become JSON scalars, dates become
//! `{"date": <epoch millis>}` and references become `{"ref": <key>}`.

use std::process;

use clap::{Parser, Subcommand};
use serde_json::{json, Map, Number};

use kvorm_core::value::{decode_scalar, TAG_MAP, TAG_SET};
use kvorm_core::{decode, Decoded, Value};
use kvorm_storage::{
    BackendConfig, Command, EngineConfig, KeyValueStore, SqliteStore, StorageError,
};

/// kvorm keyspace tools.
#[derive(Parser)]
#[command(name = "kvorm", about = "Inspect a kvorm keyspace")]
struct Cli {
    /// Path to the database file (default: KVORM_DB_PATH).
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Print a whole record with decoded values.
    Get {
        /// Record key, e.g. `e:User:1` or `a:e:User:1:tags`.
        key: String,
    },

    /// Print whether a record exists.
    Exists { key: String },

    /// Page through a record with cursor scans, one JSON line per entry.
    Scan {
        key: String,

        /// Page-size hint (default: KVORM_SCAN_COUNT or 100).
        #[arg(short, long)]
        count: Option<usize>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = match resolve_config(cli.db) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };
    let BackendConfig::Sqlite { path } = &config.backend else {
        eprintln!("Error: no database given, pass --db or set KVORM_DB_PATH");
        process::exit(1);
    };
    let store = match SqliteStore::new(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: failed to open database '{}': {}", path, e);
            process::exit(3);
        }
    };

    let result = match cli.command {
        Commands::Get { key } => run_get(&store, &key).await,
        Commands::Exists { key } => run_exists(&store, &key).await,
        Commands::Scan { key, count } => {
            run_scan(&store, &key, count.unwrap_or(config.scan_count)).await
        }
    };
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// Environment configuration with `--db` taking precedence.
fn resolve_config(db: Option<String>) -> Result<EngineConfig, StorageError> {
    let mut config = EngineConfig::from_env()?;
    if let Some(path) = db {
        config.backend = BackendConfig::Sqlite { path };
        config.validate()?;
    }
    Ok(config)
}

async fn run_get(store: &SqliteStore, key: &str) -> Result<(), StorageError> {
    let json = if key.starts_with(TAG_SET) {
        let members = store
            .execute_one(Command::SMembers(key.to_string()))
            .await?
            .into_members("SMEMBERS")?;
        if members.is_empty() {
            serde_json::Value::Null
        } else {
            members.iter().map(|m| decoded_json(m)).collect()
        }
    } else {
        let fields = store
            .execute_one(Command::HGetAll(key.to_string()))
            .await?
            .into_hash("HGETALL")?;
        if fields.is_empty() {
            serde_json::Value::Null
        } else {
            let map_record = key.starts_with(TAG_MAP);
            let object: Map<String, serde_json::Value> = fields
                .iter()
                .map(|(field, value)| (field_name(field, map_record), decoded_json(value)))
                .collect();
            serde_json::Value::Object(object)
        }
    };
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

async fn run_exists(store: &SqliteStore, key: &str) -> Result<(), StorageError> {
    let exists = store
        .execute_one(Command::Exists(key.to_string()))
        .await?
        .into_bool("EXISTS")?;
    println!("{}", exists);
    Ok(())
}

async fn run_scan(store: &SqliteStore, key: &str, count: usize) -> Result<(), StorageError> {
    let is_set = key.starts_with(TAG_SET);
    let map_record = key.starts_with(TAG_MAP);
    let mut cursor = 0;
    let mut pages = 0usize;
    loop {
        let next = if is_set {
            let (next, members) = store
                .execute_one(Command::SScan {
                    key: key.to_string(),
                    cursor,
                    count,
                })
                .await?
                .into_set_page("SSCAN")?;
            for member in &members {
                println!("{}", decoded_json(member));
            }
            next
        } else {
            let (next, entries) = store
                .execute_one(Command::HScan {
                    key: key.to_string(),
                    cursor,
                    count,
                })
                .await?
                .into_hash_page("HSCAN")?;
            for (field, value) in &entries {
                println!("{}", json!([field_name(field, map_record), decoded_json(value)]));
            }
            next
        };
        pages += 1;
        if next == 0 {
            break;
        }
        cursor = next;
    }
    tracing::debug!(key, pages, "scan finished");
    Ok(())
}

/// Hash field names are plain on entity records and encoded scalars on map
/// records.
fn field_name(field: &str, map_record: bool) -> String {
    if !map_record {
        return field.to_string();
    }
    match decode_scalar(field) {
        Ok(Value::Str(s)) => s,
        Ok(other) => value_json(other).to_string(),
        Err(_) => field.to_string(),
    }
}

fn decoded_json(raw: &str) -> serde_json::Value {
    match decode(raw) {
        Ok(Decoded::Value(value)) => value_json(value),
        Ok(Decoded::Reference(key)) => json!({ "ref": key }),
        Err(e) => {
            tracing::warn!(raw, error = %e, "stored value does not decode");
            serde_json::Value::String(raw.to_string())
        }
    }
}

fn value_json(value: Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Int(n) => n.into(),
        Value::Float(f) => Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Str(s) => s.into(),
        Value::Bool(b) => b.into(),
        Value::Date(ms) => json!({ "date": ms }),
        Value::Json(j) => j,
    }
}
