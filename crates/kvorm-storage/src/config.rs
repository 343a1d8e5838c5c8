//! Engine configuration.
//!
//! Read from JSON or from environment variables:
//! - `KVORM_DB_PATH`: SQLite database file path (selects the SQLite backend)
//! - `KVORM_SCAN_COUNT`: page-size hint for cursor scans (default: 100)
//! - `KVORM_MAX_LOAD_WAVES`: upper bound on load waves (default: 64)

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

pub const DEFAULT_SCAN_COUNT: usize = 100;
pub const DEFAULT_MAX_LOAD_WAVES: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BackendConfig {
    Memory,
    Sqlite { path: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(flatten)]
    pub backend: BackendConfig,
    #[serde(default = "default_scan_count")]
    pub scan_count: usize,
    #[serde(default = "default_max_load_waves")]
    pub max_load_waves: usize,
}

fn default_scan_count() -> usize {
    DEFAULT_SCAN_COUNT
}

fn default_max_load_waves() -> usize {
    DEFAULT_MAX_LOAD_WAVES
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::memory()
    }
}

impl EngineConfig {
    pub fn memory() -> Self {
        Self {
            backend: BackendConfig::Memory,
            scan_count: DEFAULT_SCAN_COUNT,
            max_load_waves: DEFAULT_MAX_LOAD_WAVES,
        }
    }

    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            backend: BackendConfig::Sqlite { path: path.into() },
            ..Self::memory()
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, StorageError> {
        let config: EngineConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, StorageError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StorageError> {
        let mut config = match lookup("KVORM_DB_PATH") {
            Some(path) => Self::sqlite(path),
            None => Self::memory(),
        };
        if let Some(raw) = lookup("KVORM_SCAN_COUNT") {
            config.scan_count = parse_count("KVORM_SCAN_COUNT", &raw)?;
        }
        if let Some(raw) = lookup("KVORM_MAX_LOAD_WAVES") {
            config.max_load_waves = parse_count("KVORM_MAX_LOAD_WAVES", &raw)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.scan_count == 0 {
            return Err(StorageError::Config("scan_count must be at least 1".into()));
        }
        if self.max_load_waves == 0 {
            return Err(StorageError::Config("max_load_waves must be at least 1".into()));
        }
        if let BackendConfig::Sqlite { path } = &self.backend {
            if path.is_empty() {
                return Err(StorageError::Config("sqlite path is empty".into()));
            }
        }
        Ok(())
    }
}

fn parse_count(name: &str, raw: &str) -> Result<usize, StorageError> {
    raw.trim()
        .parse()
        .map_err(|_| StorageError::Config(format!("{name} must be a positive integer, got '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn env_defaults_to_memory() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::memory());
        assert_eq!(config.scan_count, 100);
        assert_eq!(config.max_load_waves, 64);
    }

    #[test]
    fn env_db_path_selects_sqlite() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("KVORM_DB_PATH", "data.db"),
            ("KVORM_SCAN_COUNT", "25"),
        ]))
        .unwrap();
        assert_eq!(
            config.backend,
            BackendConfig::Sqlite {
                path: "data.db".into()
            }
        );
        assert_eq!(config.scan_count, 25);
    }

    #[test]
    fn invalid_numbers_are_config_errors() {
        let err = EngineConfig::from_lookup(lookup(&[("KVORM_MAX_LOAD_WAVES", "lots")])).unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
        let err = EngineConfig::from_lookup(lookup(&[("KVORM_SCAN_COUNT", "0")])).unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[test]
    fn json_uses_backend_tag() {
        let config =
            EngineConfig::from_json(r#"{"backend":"sqlite","path":"kv.db","scan_count":10}"#)
                .unwrap();
        assert_eq!(config.backend, BackendConfig::Sqlite { path: "kv.db".into() });
        assert_eq!(config.scan_count, 10);
        assert_eq!(config.max_load_waves, DEFAULT_MAX_LOAD_WAVES);

        let config = EngineConfig::from_json(r#"{"backend":"memory"}"#).unwrap();
        assert_eq!(config.backend, BackendConfig::Memory);
    }
}
