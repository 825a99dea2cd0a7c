//! Error types for TESSERA operations

use thiserror::Error;

/// Scope misuse and validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScopeError {
    #[error("Invalid scope name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Wildcard scope is not allowed for {operation}")]
    WildcardMisuse { operation: String },

    #[error("No scope attached to the operation and no default scope configured")]
    Missing,
}

/// Storage key construction and parsing errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid {segment} segment {value:?}: {reason}")]
    InvalidSegment {
        segment: &'static str,
        value: String,
        reason: String,
    },

    #[error("Key {key} does not start with prefix {prefix}")]
    PrefixMismatch { key: String, prefix: String },

    #[error("Key {key} has too few segments: expected {expected}, got {got}")]
    TooFewSegments {
        key: String,
        expected: usize,
        got: usize,
    },

    #[error("Legacy segment {segment:?} in key {key} cannot be decoded: {reason}")]
    InvalidLegacySegment {
        key: String,
        segment: String,
        reason: String,
    },

    #[error("Unknown resource {resource}")]
    UnknownResource { resource: String },
}

/// Errors raised while turning stored bytes into a scoped object.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Object {key} claims scope {claimed} but was read through scope {expected}")]
    ScopeMismatch {
        key: String,
        claimed: String,
        expected: String,
    },

    #[error("Object {key} carries no concrete owning scope")]
    MissingScope { key: String },

    #[error("Failed to decode {key}: {reason}")]
    Codec { key: String, reason: String },

    #[error("Failed to recover scope for {key}: {source}")]
    Key {
        key: String,
        #[source]
        source: KeyError,
    },
}

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Object already exists: {key}")]
    AlreadyExists { key: String },

    #[error("Update of {key} conflicted {attempts} times, giving up")]
    Conflict { key: String, attempts: u32 },

    #[error("Precondition failed for {key}: {reason}")]
    PreconditionFailed { key: String, reason: String },

    #[error("Store backend error: {reason}")]
    Backend { reason: String },

    #[error("Revision {requested} has been compacted, oldest available is {oldest}")]
    Compacted { requested: i64, oldest: i64 },

    #[error("Watch fell behind and {skipped} events were dropped")]
    WatchLagged { skipped: u64 },

    #[error("Codec error for {key}: {reason}")]
    Codec { key: String, reason: String },

    #[error("Invalid object: {reason}")]
    InvalidObject { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Scoped indexer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("Index {name} does not exist")]
    UnknownIndex { name: String },

    #[error("Index {name} already exists")]
    DuplicateIndex { name: String },

    #[error("Indexers cannot be added after items have been stored")]
    IndexerAfterStart,

    #[error("Index function {name} failed: {reason}")]
    IndexFunc { name: String, reason: String },

    #[error("Object {key} is annotated with the wildcard scope")]
    WildcardKey { key: String },

    #[error("Indexer lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all TESSERA errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TesseraError {
    #[error("Scope error: {0}")]
    Scope(#[from] ScopeError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl TesseraError {
    /// Identity absent for the given scope.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TesseraError::Storage(StorageError::NotFound { .. }))
    }

    /// Optimistic update gave up after exhausting its retries.
    pub fn is_conflict(&self) -> bool {
        matches!(self, TesseraError::Storage(StorageError::Conflict { .. }))
    }

    /// Wildcard passed where a concrete scope is mandatory.
    pub fn is_scope_misuse(&self) -> bool {
        matches!(self, TesseraError::Scope(ScopeError::WildcardMisuse { .. }))
    }

    /// Store connectivity or internal failure; the caller owns retry policy.
    pub fn is_backend(&self) -> bool {
        matches!(self, TesseraError::Storage(StorageError::Backend { .. }))
    }
}

/// Result type alias for TESSERA operations.
pub type TesseraResult<T> = Result<T, TesseraError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_error_display_wildcard_misuse() {
        let err = ScopeError::WildcardMisuse {
            operation: "create".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Wildcard"));
        assert!(msg.contains("create"));
    }

    #[test]
    fn test_storage_error_display_conflict() {
        let err = StorageError::Conflict {
            key: "/registry/core/configmaps/root/cm".to_string(),
            attempts: 5,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("conflicted"));
        assert!(msg.contains("5"));
    }

    #[test]
    fn test_key_error_display_too_few_segments() {
        let err = KeyError::TooFewSegments {
            key: "/registry/x".to_string(),
            expected: 3,
            got: 1,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("/registry/x"));
        assert!(msg.contains("expected 3"));
    }

    #[test]
    fn test_tessera_error_from_variants() {
        let scope = TesseraError::from(ScopeError::Missing);
        assert!(matches!(scope, TesseraError::Scope(_)));

        let storage = TesseraError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, TesseraError::Storage(_)));

        let index = TesseraError::from(IndexError::IndexerAfterStart);
        assert!(matches!(index, TesseraError::Index(_)));

        let config = TesseraError::from(ConfigError::MissingRequired {
            field: "key_root".to_string(),
        });
        assert!(matches!(config, TesseraError::Config(_)));
    }

    #[test]
    fn test_classification_helpers() {
        let not_found: TesseraError = StorageError::NotFound { key: "k".into() }.into();
        assert!(not_found.is_not_found());
        assert!(!not_found.is_conflict());

        let conflict: TesseraError = StorageError::Conflict {
            key: "k".into(),
            attempts: 3,
        }
        .into();
        assert!(conflict.is_conflict());

        let misuse: TesseraError = ScopeError::WildcardMisuse {
            operation: "delete".into(),
        }
        .into();
        assert!(misuse.is_scope_misuse());

        let backend: TesseraError = StorageError::Backend {
            reason: "connection reset".into(),
        }
        .into();
        assert!(backend.is_backend());
        assert!(!backend.is_not_found());
    }
}
