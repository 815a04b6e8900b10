//! Domain-A slot holding the wrapped data key as a hex string.

use serde_json::{Map, Value};

use crate::error::{BackendError, MalformedError, WrappedKeyError};
use crate::types::{WRAPPED_KEY_LENGTH, WRAPPED_KEY_SLOT};

use super::traits::KvBackend;

/// Reads and writes the single wrapped-key slot of a domain-A backend.
pub struct WrappedKeyStore<'a, A: ?Sized> {
    backend: &'a A,
}

impl<'a, A: KvBackend + ?Sized> WrappedKeyStore<'a, A> {
    pub fn new(backend: &'a A) -> Self {
        Self { backend }
    }

    /// `Ok(None)` when the slot is empty; `Malformed` when it holds anything
    /// other than a hex string of the expected length.
    pub async fn get(&self) -> Result<Option<Vec<u8>>, WrappedKeyError> {
        let slot = [WRAPPED_KEY_SLOT.to_string()];
        let mut found = self.backend.get(Some(&slot[..])).await?;
        match found.remove(WRAPPED_KEY_SLOT) {
            None => Ok(None),
            Some(value) => decode_blob(&value).map(Some).map_err(Into::into),
        }
    }

    pub async fn set(&self, blob: &[u8]) -> Result<(), BackendError> {
        let mut items = Map::new();
        items.insert(WRAPPED_KEY_SLOT.to_string(), Value::String(hex::encode(blob)));
        self.backend.set(items).await
    }
}

fn decode_blob(value: &Value) -> Result<Vec<u8>, MalformedError> {
    let text = value
        .as_str()
        .ok_or_else(|| MalformedError::new("wrapped data key", "expected a hex string"))?;
    let blob =
        hex::decode(text).map_err(|e| MalformedError::new("wrapped data key", e.to_string()))?;
    if blob.len() != WRAPPED_KEY_LENGTH {
        return Err(MalformedError::new(
            "wrapped data key",
            format!("expected {WRAPPED_KEY_LENGTH} bytes, got {}", blob.len()),
        ));
    }
    Ok(blob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryBackend;
    use serde_json::json;

    #[tokio::test]
    async fn absent_slot_is_none() {
        let backend = MemoryBackend::new();
        backend.raw_set("unrelated", json!("value"));
        assert!(WrappedKeyStore::new(&backend).get().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_then_get() {
        let backend = MemoryBackend::new();
        let store = WrappedKeyStore::new(&backend);
        let blob = [0xABu8; WRAPPED_KEY_LENGTH];
        store.set(&blob).await.unwrap();

        assert_eq!(
            backend.raw_get(WRAPPED_KEY_SLOT),
            Some(json!("ab".repeat(WRAPPED_KEY_LENGTH)))
        );
        assert_eq!(store.get().await.unwrap().unwrap(), blob.to_vec());
    }

    #[tokio::test]
    async fn malformed_values_are_not_absent() {
        let backend = MemoryBackend::new();
        let store = WrappedKeyStore::new(&backend);
        let cases = [
            json!(42),
            json!({ "blob": "00" }),
            json!("not hex at all"),
            json!("abc"),
            json!("00".repeat(WRAPPED_KEY_LENGTH - 1)),
        ];
        for case in cases {
            backend.raw_set(WRAPPED_KEY_SLOT, case.clone());
            assert!(
                matches!(store.get().await, Err(WrappedKeyError::Malformed(_))),
                "expected malformed: {case}"
            );
        }
    }
}
