//! In-process backends for both domains.
//!
//! Nothing here is durable. Useful for tests and for embedding where both
//! domains live in one process's memory anyway.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use zeroize::Zeroizing;

use crate::error::{BackendError, KeyStoreError};
use crate::keys::WrappingKey;

use super::traits::{KvBackend, WrappingKeyStore};

/// `KvBackend` holding JSON values in a map.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: Mutex<Map<String, Value>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read one stored value as-is.
    pub fn raw_get(&self, key: &str) -> Option<Value> {
        self.data.lock().get(key).cloned()
    }

    /// Overwrite one stored value as-is.
    pub fn raw_set(&self, key: impl Into<String>, value: Value) {
        self.data.lock().insert(key.into(), value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, keys: Option<&[String]>) -> Result<Map<String, Value>, BackendError> {
        let data = self.data.lock();
        Ok(match keys {
            None => data.clone(),
            Some(keys) => keys
                .iter()
                .filter_map(|k| data.get(k).map(|v| (k.clone(), v.clone())))
                .collect(),
        })
    }

    async fn set(&self, items: Map<String, Value>) -> Result<(), BackendError> {
        self.data.lock().extend(items);
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<(), BackendError> {
        let mut data = self.data.lock();
        for key in keys {
            data.remove(key);
        }
        Ok(())
    }
}

/// `WrappingKeyStore` holding the key bytes in memory.
#[derive(Default)]
pub struct MemoryKeyStore {
    key: Mutex<Option<Zeroizing<Vec<u8>>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WrappingKeyStore for MemoryKeyStore {
    async fn get(&self) -> Result<Option<WrappingKey>, KeyStoreError> {
        match self.key.lock().as_ref() {
            None => Ok(None),
            Some(bytes) => WrappingKey::from_bytes(bytes).map(Some).ok_or_else(|| {
                KeyStoreError::Read("stored wrapping key has invalid length".into())
            }),
        }
    }

    async fn set(&self, key: &WrappingKey) -> Result<(), KeyStoreError> {
        *self.key.lock() = Some(Zeroizing::new(key.as_bytes().to_vec()));
        Ok(())
    }

    async fn delete(&self) -> Result<(), KeyStoreError> {
        *self.key.lock() = None;
        Ok(())
    }
}
