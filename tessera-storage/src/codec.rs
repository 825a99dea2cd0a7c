//! Object (de)serialization and per-item scope recovery for scans.

use tessera_core::{
    DecodeError, KeyError, KeyLayout, Resource, ResourceDescriptor, Scope, StorageError,
    TesseraError,
};

use crate::keys::{DecodedKey, KeyTranslator};
use crate::scope_capability::StorageScope;

/// Serialize an object for storage.
///
/// `resource_version` is derived from the store revision on read, so it is
/// never persisted.
pub(crate) fn encode_object<T: Resource>(key: &str, object: &T) -> Result<Vec<u8>, StorageError> {
    let mut stored = object.clone();
    stored.meta_mut().resource_version = None;
    serde_json::to_vec(&stored).map_err(|e| StorageError::Codec {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Deserialize stored bytes and stamp the store revision.
pub(crate) fn decode_object<T: Resource>(
    key: &str,
    bytes: &[u8],
    mod_revision: i64,
) -> Result<T, DecodeError> {
    let mut object: T = serde_json::from_slice(bytes).map_err(|e| DecodeError::Codec {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    object.meta_mut().resource_version = Some(mod_revision.to_string());
    Ok(object)
}

/// Which keys a scan covers and how returned keys are read back.
#[derive(Debug, Clone)]
pub(crate) struct ScanPlan {
    /// Scope the caller asked for; may be the wildcard.
    pub scope: Scope,
    pub namespace: Option<String>,
    pub prefix: String,
    /// Prefix stops before the identity segment (partial-metadata scan).
    pub skip_identity: bool,
}

/// Turns raw scan results into scoped objects according to a [`ScanPlan`].
#[derive(Debug, Clone)]
pub(crate) struct ItemDecoder {
    keys: KeyTranslator,
    descriptor: ResourceDescriptor,
    plan: ScanPlan,
}

impl ItemDecoder {
    pub fn new(keys: KeyTranslator, descriptor: ResourceDescriptor, plan: ScanPlan) -> Self {
        Self {
            keys,
            descriptor,
            plan,
        }
    }

    pub fn plan(&self) -> &ScanPlan {
        &self.plan
    }

    /// Recover identity from `key`.
    ///
    /// Under a wildcard scan a scope-aware decode failure degrades to the
    /// legacy rule instead of failing the item.
    pub fn decode_identity(&self, key: &str) -> Result<DecodedKey, KeyError> {
        let plan = &self.plan;
        match self
            .keys
            .decode_key(key, &self.descriptor, &plan.prefix, plan.skip_identity)
        {
            Ok(decoded) => Ok(decoded),
            Err(err) if plan.scope.is_wildcard() && !self.descriptor.layout.is_legacy() => {
                let decoded = self
                    .keys
                    .decode_key_as(key, &self.descriptor, KeyLayout::Legacy, &plan.prefix, plan.skip_identity)
                    .map_err(|_| err.clone())?;
                tracing::warn!(
                    key = %key,
                    scope = %decoded.scope,
                    error = %err,
                    "Scope-aware key decode failed, recovered scope with the legacy rule"
                );
                Ok(decoded)
            }
            Err(err) => Err(err),
        }
    }

    /// Whether an item with this identity belongs to the scan.
    ///
    /// Legacy scope prefixes also cover longer scope names, and wildcard
    /// scans cannot narrow by namespace, so both are checked here.
    pub fn selects(&self, decoded: &DecodedKey) -> bool {
        self.plan.scope.matches(&decoded.scope)
            && self
                .plan
                .namespace
                .as_deref()
                .map_or(true, |ns| decoded.namespace.as_deref() == Some(ns))
    }

    /// Decode one scanned item.
    ///
    /// `Ok(None)` means the key is outside the requested scope or namespace.
    pub fn decode_item<T: Resource>(
        &self,
        key: &str,
        bytes: &[u8],
        mod_revision: i64,
    ) -> Result<Option<T>, TesseraError> {
        let decoded = self.decode_identity(key).map_err(|source| DecodeError::Key {
            key: key.to_string(),
            source,
        })?;
        if !self.selects(&decoded) {
            return Ok(None);
        }

        let mut object: T = decode_object(key, bytes, mod_revision)?;
        Scope::Concrete(decoded.scope).post_decode(key, &mut object)?;
        self.plan.scope.post_decode(key, &mut object)?;
        Ok(Some(object))
    }
}
