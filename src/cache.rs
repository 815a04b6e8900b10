//! SplitTrustCache: encrypted get/set/remove over a domain-A backend.
//!
//! Values are JSON. Each is serialized, encrypted under the handle's data key
//! with (namespace, record key) as associated data, and stored under the
//! caller's key as `{"iv", "ciphertext"}`.
//!
//! Batches are fail-fast: the first key that cannot be read (or encrypted)
//! aborts the whole call, and a failed `set` writes nothing. With
//! `tolerate_unreadable`, unreadable records are logged and treated as absent
//! instead.
//!
//! The cache keeps the list of record keys it has written at a fixed slot,
//! stamped with the epoch that wrote them. Every open compares that stamp with
//! the current epoch and removes the listed records when they differ, so
//! records from a previous epoch go away without listing the backend, and a
//! clear that failed is retried by the next open. Concurrent writers through
//! different handles can lose index updates; a record missing from the index
//! is simply not cleared on the next epoch and then fails authentication.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::codec::{AesGcmCodec, EncryptedRecord, RecordCodec};
use crate::error::{CacheError, ProvisionError, Result};
use crate::provision::KeyProvisioner;
use crate::storage::traits::{KvBackend, WrappingKeyStore};
use crate::types::{RECORD_INDEX_SLOT, WRAPPED_KEY_SLOT};

/// Options for opening a cache handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Logical cache instance. Bound into every record's associated data.
    pub namespace: String,
    /// Regenerate keys (and delete a broken domain-B store) instead of failing.
    pub allow_recovery_on_error: bool,
    /// Treat records that fail to parse, decrypt or deserialize as absent.
    pub tolerate_unreadable: bool,
    /// Deadline for provisioning the data key.
    pub provision_timeout: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            allow_recovery_on_error: true,
            tolerate_unreadable: false,
            provision_timeout: Duration::from_secs(1),
        }
    }
}

impl CacheOptions {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }
}

/// Record keys written by the cache and the epoch they were written under.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RecordIndex {
    epoch: Option<String>,
    keys: BTreeSet<String>,
}

fn is_reserved(key: &str) -> bool {
    key == WRAPPED_KEY_SLOT || key == RECORD_INDEX_SLOT
}

fn check_key(key: &str) -> Result<()> {
    if is_reserved(key) {
        return Err(CacheError::ReservedKey(key.to_string()));
    }
    Ok(())
}

/// Handle over one namespace. Owns the unwrapped data key for its lifetime.
pub struct SplitTrustCache<A: KvBackend> {
    backend: A,
    codec: Box<dyn RecordCodec>,
    namespace: String,
    tolerate_unreadable: bool,
    created: bool,
    epoch_id: String,
}

impl<A: KvBackend> SplitTrustCache<A> {
    /// Provision the data key from both domains and open a handle.
    ///
    /// Provisioning is bounded by `options.provision_timeout`; on expiry this
    /// returns `ProvisionError::Timeout` and a later call starts over.
    pub async fn open<B>(backend: A, key_store: &B, options: CacheOptions) -> Result<Self>
    where
        B: WrappingKeyStore + ?Sized,
    {
        let provisioned = {
            let provisioner = KeyProvisioner::new(&backend, key_store);
            tokio::time::timeout(
                options.provision_timeout,
                provisioner.get_or_create_data_key(options.allow_recovery_on_error),
            )
            .await
            .map_err(|_| ProvisionError::Timeout)??
        };

        let cache = Self {
            backend,
            codec: Box::new(AesGcmCodec::new(provisioned.data_key)),
            namespace: options.namespace,
            tolerate_unreadable: options.tolerate_unreadable,
            created: provisioned.created,
            epoch_id: provisioned.epoch_id,
        };

        cache.clear_previous_epoch().await?;
        Ok(cache)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Whether opening this handle minted a new key epoch.
    pub fn created(&self) -> bool {
        self.created
    }

    /// The underlying domain-A backend.
    pub fn backend(&self) -> &A {
        &self.backend
    }

    /// Read and decrypt `keys`. Absent keys are missing from the result.
    pub async fn get(&self, keys: &[&str]) -> Result<Map<String, Value>> {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        self.read(&keys).await
    }

    /// Read the keys of `defaults`, filling in the default for every key
    /// that is absent (or unreadable, when tolerated).
    pub async fn get_with_defaults(
        &self,
        defaults: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let keys: Vec<String> = defaults.keys().cloned().collect();
        let mut found = self.read(&keys).await?;
        for (key, default) in defaults {
            found.entry(key).or_insert(default);
        }
        Ok(found)
    }

    /// Encrypt and write every `Some` value. `None` leaves the stored value
    /// untouched.
    pub async fn set(&self, items: BTreeMap<String, Option<Value>>) -> Result<()> {
        let mut encrypted = Map::new();
        for (key, value) in items {
            let Some(value) = value else {
                continue;
            };
            check_key(&key)?;
            let record = self.seal_record(&key, &value)?;
            encrypted.insert(key, record.to_value());
        }
        if encrypted.is_empty() {
            return Ok(());
        }

        let mut index = self.read_index().await?;
        let before = index.keys.len();
        index.keys.extend(encrypted.keys().cloned());
        if index.keys.len() != before || !self.owns(&index) {
            index.epoch = Some(self.epoch_id.clone());
            self.write_index(&index).await?;
        }

        self.backend.set(encrypted).await?;
        Ok(())
    }

    pub async fn remove(&self, keys: &[&str]) -> Result<()> {
        for key in keys {
            check_key(key)?;
        }
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        self.backend.remove(&keys).await?;

        let mut index = self.read_index().await?;
        let before = index.keys.len();
        for key in &keys {
            index.keys.remove(key);
        }
        if index.keys.len() != before {
            self.write_index(&index).await?;
        }
        Ok(())
    }

    /// Typed read of a single key.
    pub async fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut found = self.get(&[key]).await?;
        match found.remove(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|source| CacheError::Serialization {
                    key: key.to_string(),
                    source,
                }),
        }
    }

    /// Typed write of a single key.
    pub async fn set_value<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value).map_err(|source| CacheError::Serialization {
            key: key.to_string(),
            source,
        })?;
        self.set(BTreeMap::from([(key.to_string(), Some(value))])).await
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    async fn read(&self, keys: &[String]) -> Result<Map<String, Value>> {
        for key in keys {
            check_key(key)?;
        }
        let stored = self.backend.get(Some(keys)).await?;

        let mut out = Map::new();
        for key in keys {
            let Some(raw) = stored.get(key) else {
                continue;
            };
            match self.open_record(key, raw) {
                Ok(value) => {
                    out.insert(key.clone(), value);
                }
                Err(e) if self.tolerate_unreadable => {
                    warn!(key = %key, error = %e, "Treating unreadable record as absent");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    fn open_record(&self, key: &str, raw: &Value) -> Result<Value> {
        let record =
            EncryptedRecord::from_value(raw).map_err(|source| CacheError::InvalidStoredRecord {
                key: key.to_string(),
                source,
            })?;
        let plaintext = Zeroizing::new(
            self.codec
                .decrypt(&self.namespace, key, &record)
                .map_err(|source| CacheError::DecryptionFailure {
                    key: key.to_string(),
                    source,
                })?,
        );
        serde_json::from_slice(&plaintext).map_err(|source| CacheError::Serialization {
            key: key.to_string(),
            source,
        })
    }

    fn seal_record(&self, key: &str, value: &Value) -> Result<EncryptedRecord> {
        let plaintext = serde_json::to_vec(value).map_err(|source| CacheError::Serialization {
            key: key.to_string(),
            source,
        })?;
        let plaintext = Zeroizing::new(plaintext);
        self.codec
            .encrypt(&self.namespace, key, &plaintext)
            .map_err(|source| CacheError::EncryptionFailure {
                key: key.to_string(),
                source,
            })
    }

    fn owns(&self, index: &RecordIndex) -> bool {
        index.epoch.as_deref() == Some(self.epoch_id.as_str())
    }

    async fn read_index(&self) -> Result<RecordIndex> {
        let slot = [RECORD_INDEX_SLOT.to_string()];
        let mut found = self.backend.get(Some(&slot[..])).await?;
        let Some(value) = found.remove(RECORD_INDEX_SLOT) else {
            return Ok(RecordIndex::default());
        };
        match serde_json::from_value(value) {
            Ok(index) => Ok(index),
            Err(e) => {
                warn!(error = %e, "Record index is malformed, starting a new one");
                Ok(RecordIndex::default())
            }
        }
    }

    async fn write_index(&self, index: &RecordIndex) -> Result<()> {
        let value = serde_json::to_value(index).map_err(|source| CacheError::Serialization {
            key: RECORD_INDEX_SLOT.to_string(),
            source,
        })?;
        let mut items = Map::new();
        items.insert(RECORD_INDEX_SLOT.to_string(), value);
        self.backend.set(items).await?;
        Ok(())
    }

    /// Remove every indexed record written under another epoch.
    ///
    /// Records and index go in one `remove`; if it fails the stamp still
    /// names the old epoch and the next open tries again.
    async fn clear_previous_epoch(&self) -> Result<()> {
        let index = self.read_index().await?;
        if self.owns(&index) || (index.epoch.is_none() && index.keys.is_empty()) {
            return Ok(());
        }
        debug!(
            records = index.keys.len(),
            "Clearing records from previous key epoch"
        );
        let mut stale: Vec<String> = index.keys.into_iter().collect();
        stale.push(RECORD_INDEX_SLOT.to_string());
        self.backend.remove(&stale).await?;
        Ok(())
    }
}
