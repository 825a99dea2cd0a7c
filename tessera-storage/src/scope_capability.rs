//! The storage layer's view of a [`Scope`].

use tessera_core::{DecodeError, Resource, Scope};

/// What the store asks of a scope after key construction is done.
pub trait StorageScope {
    /// Root for keys of kinds with no namespace segment.
    fn no_namespace_key_root(&self, prefix: &str) -> String;

    /// Validate or annotate an object just decoded from `key`.
    ///
    /// An error means the object must not be handed to the caller.
    fn post_decode<T: Resource>(&self, key: &str, object: &mut T) -> Result<(), DecodeError>;
}

impl StorageScope for Scope {
    fn no_namespace_key_root(&self, prefix: &str) -> String {
        let prefix = prefix.trim_end_matches('/');
        match self {
            Scope::Concrete(name) => format!("{prefix}/{name}"),
            Scope::Wildcard => prefix.to_string(),
        }
    }

    fn post_decode<T: Resource>(&self, key: &str, object: &mut T) -> Result<(), DecodeError> {
        let claimed = object.meta().scope_annotation().map(str::to_string);
        match self {
            Scope::Concrete(expected) => match claimed {
                None => {
                    object.meta_mut().set_scope(expected);
                    Ok(())
                }
                Some(claimed) if claimed == expected.as_str() => Ok(()),
                Some(claimed) => Err(DecodeError::ScopeMismatch {
                    key: key.to_string(),
                    claimed,
                    expected: expected.to_string(),
                }),
            },
            Scope::Wildcard => match object.meta().scope() {
                Ok(Some(_)) => Ok(()),
                _ => Err(DecodeError::MissingScope {
                    key: key.to_string(),
                }),
            },
        }
    }
}
