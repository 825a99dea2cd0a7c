//! Configuration types
//!
//! There is no process-wide configuration. A [`TesseraConfig`] is built once
//! at startup (from the environment or through the `with_*` builders),
//! validated, and then handed by reference to every component that needs it.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::scope::ScopeName;

// ============================================================================
// STORAGE CONFIGURATION
// ============================================================================

/// Settings for the scoped store and its key-value backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of every storage key, e.g. `/registry`.
    pub key_root: String,
    /// Conflict retries inside `guaranteed_update` before giving up.
    pub max_update_retries: u32,
    /// Events retained for watches that start from a past revision.
    pub watch_history_capacity: usize,
    /// Buffer size of each watch channel.
    pub watch_channel_capacity: usize,
    /// Maximum size of an LMDB-backed store in megabytes.
    pub lmdb_map_size_mb: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            key_root: "/registry".to_string(),
            max_update_retries: 5,
            watch_history_capacity: 1024,
            watch_channel_capacity: 256,
            lmdb_map_size_mb: 64,
        }
    }
}

impl StorageConfig {
    pub fn with_key_root(mut self, key_root: impl Into<String>) -> Self {
        self.key_root = key_root.into();
        self
    }

    pub fn with_max_update_retries(mut self, retries: u32) -> Self {
        self.max_update_retries = retries;
        self
    }

    pub fn with_watch_history(mut self, capacity: usize) -> Self {
        self.watch_history_capacity = capacity;
        self
    }

    pub fn with_watch_channel_capacity(mut self, capacity: usize) -> Self {
        self.watch_channel_capacity = capacity;
        self
    }

    pub fn with_lmdb_map_size_mb(mut self, size_mb: usize) -> Self {
        self.lmdb_map_size_mb = size_mb;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.key_root.starts_with('/') || self.key_root.len() < 2 || self.key_root.ends_with('/')
        {
            return Err(ConfigError::InvalidValue {
                field: "key_root".to_string(),
                value: self.key_root.clone(),
                reason: "must start with '/' and must not end with '/'".to_string(),
            });
        }
        if self.max_update_retries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_update_retries".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.watch_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "watch_channel_capacity".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.lmdb_map_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lmdb_map_size_mb".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.lmdb_map_size_mb.checked_mul(1024 * 1024).is_none() {
            return Err(ConfigError::InvalidValue {
                field: "lmdb_map_size_mb".to_string(),
                value: self.lmdb_map_size_mb.to_string(),
                reason: "map size in bytes overflows usize".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// CACHE CONFIGURATION
// ============================================================================

/// Settings for the scoped indexer and its reflector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Delay before the reflector relists after its watch ends with an error.
    pub resync_backoff: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            resync_backoff: Duration::from_millis(500),
        }
    }
}

impl CacheConfig {
    pub fn with_resync_backoff(mut self, backoff: Duration) -> Self {
        self.resync_backoff = backoff;
        self
    }
}

// ============================================================================
// TOP-LEVEL CONFIGURATION
// ============================================================================

/// Complete configuration, built once and passed explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TesseraConfig {
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    /// Scope used when an operation carries none.
    pub default_scope: Option<ScopeName>,
}

impl TesseraConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_default_scope(mut self, scope: ScopeName) -> Self {
        self.default_scope = Some(scope);
        self
    }

    /// Create a config from environment variables.
    ///
    /// Environment variables:
    /// - `TESSERA_KEY_ROOT`: Storage key root (default: /registry)
    /// - `TESSERA_MAX_UPDATE_RETRIES`: Optimistic update retries (default: 5)
    /// - `TESSERA_WATCH_HISTORY`: Retained watch events (default: 1024)
    /// - `TESSERA_WATCH_CHANNEL_CAPACITY`: Per-watch buffer (default: 256)
    /// - `TESSERA_LMDB_MAP_SIZE_MB`: LMDB map size (default: 64)
    /// - `TESSERA_RESYNC_BACKOFF_MS`: Reflector relist delay (default: 500)
    /// - `TESSERA_DEFAULT_SCOPE`: Scope for unscoped operations (default: none)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = StorageConfig::default();
        let storage = StorageConfig {
            key_root: lookup("TESSERA_KEY_ROOT").unwrap_or(defaults.key_root),
            max_update_retries: parse_or("TESSERA_MAX_UPDATE_RETRIES", &lookup, defaults.max_update_retries)?,
            watch_history_capacity: parse_or("TESSERA_WATCH_HISTORY", &lookup, defaults.watch_history_capacity)?,
            watch_channel_capacity: parse_or(
                "TESSERA_WATCH_CHANNEL_CAPACITY",
                &lookup,
                defaults.watch_channel_capacity,
            )?,
            lmdb_map_size_mb: parse_or("TESSERA_LMDB_MAP_SIZE_MB", &lookup, defaults.lmdb_map_size_mb)?,
        };

        let backoff_ms: u64 = parse_or(
            "TESSERA_RESYNC_BACKOFF_MS",
            &lookup,
            CacheConfig::default().resync_backoff.as_millis() as u64,
        )?;
        let cache = CacheConfig {
            resync_backoff: Duration::from_millis(backoff_ms),
        };

        let default_scope = match lookup("TESSERA_DEFAULT_SCOPE").filter(|s| !s.is_empty()) {
            Some(raw) => Some(ScopeName::new(raw.clone()).map_err(|e| ConfigError::InvalidValue {
                field: "TESSERA_DEFAULT_SCOPE".to_string(),
                value: raw,
                reason: e.to_string(),
            })?),
            None => None,
        };

        let config = Self {
            storage,
            cache,
            default_scope,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.storage.validate()
    }
}

fn parse_or<T, F>(key: &str, lookup: &F, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            field: key.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}
