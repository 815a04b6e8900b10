//! Backend seams for the two trust domains.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{BackendError, KeyStoreError};
use crate::keys::WrappingKey;

// ============================================================================
// KvBackend (domain A)
// ============================================================================

/// Caller-supplied JSON key/value storage (domain A).
///
/// Shared with unrelated data: the cache only ever passes explicit key lists
/// and never asks for a full listing.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Read the given keys, or everything when `keys` is `None`.
    /// Absent keys are simply missing from the result.
    async fn get(&self, keys: Option<&[String]>) -> Result<Map<String, Value>, BackendError>;

    async fn set(&self, items: Map<String, Value>) -> Result<(), BackendError>;

    async fn remove(&self, keys: &[String]) -> Result<(), BackendError>;
}

#[async_trait]
impl<T: KvBackend + ?Sized> KvBackend for Arc<T> {
    async fn get(&self, keys: Option<&[String]>) -> Result<Map<String, Value>, BackendError> {
        (**self).get(keys).await
    }

    async fn set(&self, items: Map<String, Value>) -> Result<(), BackendError> {
        (**self).set(items).await
    }

    async fn remove(&self, keys: &[String]) -> Result<(), BackendError> {
        (**self).remove(keys).await
    }
}

// ============================================================================
// WrappingKeyStore (domain B)
// ============================================================================

/// Durable single-slot storage for the wrapping key (domain B).
///
/// `get` returns `Ok(None)` only for a healthy, empty store. Anything wrong
/// with the store itself is a `KeyStoreError`.
#[async_trait]
pub trait WrappingKeyStore: Send + Sync {
    async fn get(&self) -> Result<Option<WrappingKey>, KeyStoreError>;

    async fn set(&self, key: &WrappingKey) -> Result<(), KeyStoreError>;

    /// Destroy the whole store. Must succeed even when the store is unreadable.
    async fn delete(&self) -> Result<(), KeyStoreError>;
}

#[async_trait]
impl<T: WrappingKeyStore + ?Sized> WrappingKeyStore for Arc<T> {
    async fn get(&self) -> Result<Option<WrappingKey>, KeyStoreError> {
        (**self).get().await
    }

    async fn set(&self, key: &WrappingKey) -> Result<(), KeyStoreError> {
        (**self).set(key).await
    }

    async fn delete(&self) -> Result<(), KeyStoreError> {
        (**self).delete().await
    }
}
