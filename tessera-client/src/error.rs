//! Error types for the client surface.

use tessera_core::{
    DecodeError, IndexError, KeyError, ScopeError, StorageError, TesseraError,
};
use thiserror::Error;

/// Client-side errors.
///
/// Scope misuse is caught before a request reaches the transport and gets
/// its own variant; everything the storage taxonomy already names travels
/// as [`ClientError::Tessera`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("Scope misuse in {operation}: {reason}")]
    ScopeMisuse { operation: String, reason: String },

    #[error("Transport error (status {status:?}): {reason}")]
    Transport { status: Option<u16>, reason: String },

    #[error(transparent)]
    Tessera(#[from] TesseraError),
}

impl ClientError {
    pub fn scope_misuse(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        ClientError::ScopeMisuse {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn is_scope_misuse(&self) -> bool {
        matches!(self, ClientError::ScopeMisuse { .. })
            || matches!(self, ClientError::Tessera(e) if e.is_scope_misuse())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Tessera(e) if e.is_not_found())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Tessera(e) if e.is_conflict())
    }
}

impl From<ScopeError> for ClientError {
    fn from(err: ScopeError) -> Self {
        match err {
            ScopeError::WildcardMisuse { operation } => ClientError::ScopeMisuse {
                operation,
                reason: "wildcard scope is read-only".to_string(),
            },
            other => ClientError::Tessera(other.into()),
        }
    }
}

impl From<StorageError> for ClientError {
    fn from(err: StorageError) -> Self {
        ClientError::Tessera(err.into())
    }
}

impl From<DecodeError> for ClientError {
    fn from(err: DecodeError) -> Self {
        ClientError::Tessera(err.into())
    }
}

impl From<IndexError> for ClientError {
    fn from(err: IndexError) -> Self {
        ClientError::Tessera(err.into())
    }
}

impl From<KeyError> for ClientError {
    fn from(err: KeyError) -> Self {
        ClientError::Tessera(err.into())
    }
}

/// Result type alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
