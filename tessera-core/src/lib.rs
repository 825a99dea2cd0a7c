//! TESSERA Core - Scope Types
//!
//! Pure data structures shared by every other crate: the scope value and its
//! context carrier, the resource descriptor table that decides key layout,
//! the object model, configuration, and the error taxonomy.

pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod object;
pub mod scope;

pub use config::{CacheConfig, StorageConfig, TesseraConfig};
pub use context::{ContextLayer, ScopedContext};
pub use descriptor::{
    is_builtin_group, KeyLayout, ResourceDescriptor, ResourceRegistry, BUILTIN_GROUPS,
    CORE_GROUP_SEGMENT,
};
pub use error::{
    ConfigError, DecodeError, IndexError, KeyError, ScopeError, StorageError, TesseraError,
    TesseraResult,
};
pub use object::{
    DynamicObject, LabelSelector, ObjectMeta, Preconditions, Resource, DEFAULT_NAMESPACE,
    SCOPE_ANNOTATION,
};
pub use scope::{Scope, ScopeName, SCOPE_PATH_SEPARATOR, WILDCARD};
