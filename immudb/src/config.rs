//! Configuration.
//!
//! The admin tool reads its settings from environment variables.
//!
//! # Environment Variables
//!
//! - `IMMUDB_DIRECTORY`: Directory holding `data.imdb` and `index.imdb`
//!   (default: `./data`)
//! - `IMMUDB_SYNC_ON_COMMIT`: Flush both stores on every commit
//!   (default: `true`)
//! - `IMMUDB_MAX_NODE_KEYS`: Keys per B-tree node before it splits
//!   (default: `64`, range 4-4096)

use std::path::PathBuf;

use crate::storage::btree::{DEFAULT_MAX_NODE_KEYS, MAX_NODE_KEY_SIZE};
use crate::storage::mmap::{DEFAULT_CHUNK_SIZE, MIN_CHUNK_SIZE};

/// Settings for one open database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Flush the data log before writing the index root, and the index
    /// store after.
    pub sync_on_commit: bool,
    pub max_node_keys: usize,
    /// Chunk size of both stores. Must be a power of two of at least 1 MiB.
    pub chunk_size: u64,
}

impl DatabaseConfig {
    pub const DEFAULT_MAX_NODE_KEYS: usize = DEFAULT_MAX_NODE_KEYS;

    /// Fails unless the chunk size is a power of two of at least 1 MiB and
    /// a full node of the largest keys fits in one chunk.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |name: &str, message: String| ConfigError::InvalidValue {
            name: name.to_string(),
            message,
        };
        if !self.chunk_size.is_power_of_two()
            || !(MIN_CHUNK_SIZE..=u64::from(u32::MAX) + 1).contains(&self.chunk_size)
        {
            return Err(invalid(
                "chunk_size",
                format!("{} is not a power of two from 1 MiB to 4 GiB", self.chunk_size),
            ));
        }
        if !StoreConfig::MAX_NODE_KEYS_RANGE.contains(&self.max_node_keys) {
            return Err(invalid(
                "max_node_keys",
                format!("{} is not in 4-4096", self.max_node_keys),
            ));
        }
        let node_size = (self.max_node_keys as u64 + 1) * MAX_NODE_KEY_SIZE as u64;
        if node_size >= self.chunk_size {
            return Err(invalid(
                "max_node_keys",
                format!(
                    "nodes of {} keys may need {node_size} bytes, more than a chunk of {}",
                    self.max_node_keys, self.chunk_size
                ),
            ));
        }
        Ok(())
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sync_on_commit: true,
            max_node_keys: Self::DEFAULT_MAX_NODE_KEYS,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Tool configuration.
///
/// # Post-conditions
///
/// - `database.max_node_keys` is in 4..=4096
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Where the store files live.
    pub directory: PathBuf,
    pub database: DatabaseConfig,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl StoreConfig {
    /// Default store directory.
    pub const DEFAULT_DIRECTORY: &'static str = "./data";
    pub const MAX_NODE_KEYS_RANGE: std::ops::RangeInclusive<usize> = 4..=4096;

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns the value of a
    /// variable if it is set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let directory = lookup("IMMUDB_DIRECTORY")
            .filter(|v| !v.is_empty())
            .map_or_else(|| PathBuf::from(Self::DEFAULT_DIRECTORY), PathBuf::from);
        let sync_on_commit = match lookup("IMMUDB_SYNC_ON_COMMIT") {
            Some(value) => parse_bool("IMMUDB_SYNC_ON_COMMIT", &value)?,
            None => true,
        };
        let max_node_keys = match lookup("IMMUDB_MAX_NODE_KEYS") {
            Some(value) => parse_max_node_keys(&value)?,
            None => DatabaseConfig::DEFAULT_MAX_NODE_KEYS,
        };

        Ok(Self {
            directory,
            database: DatabaseConfig {
                sync_on_commit,
                max_node_keys,
                ..DatabaseConfig::default()
            },
        })
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not a boolean"),
        }),
    }
}

fn parse_max_node_keys(value: &str) -> Result<usize, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        name: "IMMUDB_MAX_NODE_KEYS".to_string(),
        message: format!("'{value}' is not a number in 4-4096"),
    };
    let n = value.parse::<usize>().map_err(|_| invalid())?;
    if StoreConfig::MAX_NODE_KEYS_RANGE.contains(&n) {
        Ok(n)
    } else {
        Err(invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mmap::MB;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<StoreConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        StoreConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = load(&[]).unwrap();
        assert_eq!(config.directory, PathBuf::from("./data"));
        assert!(config.database.sync_on_commit);
        assert_eq!(config.database.max_node_keys, 64);
        assert_eq!(config.database.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_values_from_environment() {
        let config = load(&[
            ("IMMUDB_DIRECTORY", "/tmp/db"),
            ("IMMUDB_SYNC_ON_COMMIT", "off"),
            ("IMMUDB_MAX_NODE_KEYS", "16"),
        ])
        .unwrap();
        assert_eq!(config.directory, PathBuf::from("/tmp/db"));
        assert!(!config.database.sync_on_commit);
        assert_eq!(config.database.max_node_keys, 16);
    }

    #[test]
    fn test_database_config_validation() {
        assert!(DatabaseConfig::default().validate().is_ok());
        let config = DatabaseConfig {
            max_node_keys: 4096,
            chunk_size: MB,
            ..DatabaseConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than a chunk"), "{err}");
        let config = DatabaseConfig {
            max_node_keys: 64,
            chunk_size: MB,
            ..DatabaseConfig::default()
        };
        assert!(config.validate().is_ok());
        let config = DatabaseConfig {
            chunk_size: 3 * MB,
            ..DatabaseConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_values() {
        let err = load(&[("IMMUDB_MAX_NODE_KEYS", "2")]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid value for IMMUDB_MAX_NODE_KEYS: '2' is not a number in 4-4096"
        );
        assert!(load(&[("IMMUDB_MAX_NODE_KEYS", "lots")]).is_err());
        assert!(load(&[("IMMUDB_SYNC_ON_COMMIT", "maybe")]).is_err());
    }
}
