//! End-to-end properties of the cache facade over in-memory backends.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use split_cache::{
    CacheError, CacheOptions, CodecError, KeyStoreError, MemoryBackend, MemoryKeyStore,
    ProvisionError, SplitTrustCache, WrappingKey, WrappingKeyStore,
};

type Handle = SplitTrustCache<Arc<MemoryBackend>>;

async fn open(backend: &Arc<MemoryBackend>, keys: &MemoryKeyStore, namespace: &str) -> Handle {
    SplitTrustCache::open(Arc::clone(backend), keys, CacheOptions::new(namespace))
        .await
        .expect("open cache")
}

fn flip_hex_bit(hex_str: &str, bit: usize) -> String {
    let mut bytes = hex::decode(hex_str).unwrap();
    bytes[bit / 8] ^= 1 << (bit % 8);
    hex::encode(bytes)
}

fn assert_authentication_failure(result: split_cache::Result<Map<String, Value>>, key: &str) {
    match result {
        Err(CacheError::DecryptionFailure { key: k, source }) => {
            assert_eq!(k, key);
            assert!(matches!(source, CodecError::Authentication));
        }
        other => panic!("expected DecryptionFailure for {key}, got {other:?}"),
    }
}

// ============================================================================
// Round trip
// ============================================================================

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Session {
    user: String,
    token: String,
    expires_at: u64,
}

#[tokio::test]
async fn round_trips_assorted_json_values() {
    let backend = Arc::new(MemoryBackend::new());
    let keys = MemoryKeyStore::new();
    let cache = open(&backend, &keys, "auth-tokens").await;

    let values = [
        ("null", json!(null)),
        ("bool", json!(false)),
        ("number", json!(-12.5)),
        ("string", json!("ünïcødé ✓")),
        ("empty-string", json!("")),
        ("array", json!([1, "two", { "three": 3 }])),
        ("object", json!({ "nested": { "deep": [true, null] } })),
    ];
    let items: BTreeMap<String, Option<Value>> = values
        .iter()
        .map(|(k, v)| (k.to_string(), Some(v.clone())))
        .collect();
    cache.set(items).await.unwrap();

    let names: Vec<&str> = values.iter().map(|(k, _)| *k).collect();
    let got = cache.get(&names).await.unwrap();
    for (key, value) in values {
        assert_eq!(got[key], value, "value for {key}");
    }
}

#[tokio::test]
async fn typed_values_round_trip() {
    let backend = Arc::new(MemoryBackend::new());
    let keys = MemoryKeyStore::new();
    let cache = open(&backend, &keys, "auth-tokens").await;

    let session = Session {
        user: "alice".into(),
        token: "tok_123".into(),
        expires_at: 1_900_000_000,
    };
    cache.set_value("session", &session).await.unwrap();
    assert_eq!(cache.get_value::<Session>("session").await.unwrap(), Some(session));
    assert_eq!(cache.get_value::<Session>("nobody").await.unwrap(), None);
}

#[tokio::test]
async fn typed_read_of_wrong_shape_is_serialization_error() {
    let backend = Arc::new(MemoryBackend::new());
    let keys = MemoryKeyStore::new();
    let cache = open(&backend, &keys, "ns").await;
    cache.set_value("n", &7).await.unwrap();

    assert!(matches!(
        cache.get_value::<Session>("n").await,
        Err(CacheError::Serialization { .. })
    ));
}

// ============================================================================
// Isolation and tamper detection
// ============================================================================

#[tokio::test]
async fn record_copied_to_another_key_does_not_decrypt() {
    let backend = Arc::new(MemoryBackend::new());
    let keys = MemoryKeyStore::new();
    let cache = open(&backend, &keys, "ns").await;
    cache.set_value("k1", "k1's value").await.unwrap();
    cache.set_value("k2", "k2's value").await.unwrap();

    backend.raw_set("k2", backend.raw_get("k1").unwrap());
    assert_authentication_failure(cache.get(&["k2"]).await, "k2");
}

#[tokio::test]
async fn namespaces_sharing_a_data_key_are_isolated() {
    let backend = Arc::new(MemoryBackend::new());
    let keys = MemoryKeyStore::new();
    let tokens = open(&backend, &keys, "auth-tokens").await;
    let prefs = open(&backend, &keys, "preferences").await;
    assert!(!prefs.created(), "second handle shares the epoch");

    tokens.set_value("shared-key", "token data").await.unwrap();
    assert_authentication_failure(prefs.get(&["shared-key"]).await, "shared-key");
    assert_eq!(
        tokens.get_value::<String>("shared-key").await.unwrap().as_deref(),
        Some("token data")
    );
}

#[tokio::test]
async fn any_flipped_bit_fails_authentication() {
    let backend = Arc::new(MemoryBackend::new());
    let keys = MemoryKeyStore::new();
    let cache = open(&backend, &keys, "ns").await;
    cache.set_value("k", &json!({ "a": 1 })).await.unwrap();
    let original = backend.raw_get("k").unwrap();

    let iv = original["iv"].as_str().unwrap().to_string();
    let ct = original["ciphertext"].as_str().unwrap().to_string();

    for bit in 0..iv.len() * 4 {
        backend.raw_set("k", json!({ "iv": flip_hex_bit(&iv, bit), "ciphertext": ct }));
        assert_authentication_failure(cache.get(&["k"]).await, "k");
    }
    for bit in 0..ct.len() * 4 {
        backend.raw_set("k", json!({ "iv": iv, "ciphertext": flip_hex_bit(&ct, bit) }));
        assert_authentication_failure(cache.get(&["k"]).await, "k");
    }

    backend.raw_set("k", original);
    assert!(cache.get(&["k"]).await.is_ok());
}

#[tokio::test]
async fn malformed_record_is_invalid_stored_record() {
    let backend = Arc::new(MemoryBackend::new());
    let keys = MemoryKeyStore::new();
    let cache = open(&backend, &keys, "ns").await;
    backend.raw_set("k", json!({ "iv": "00", "ciphertext": "00" }));

    match cache.get(&["k"]).await {
        Err(CacheError::InvalidStoredRecord { key, .. }) => assert_eq!(key, "k"),
        other => panic!("expected InvalidStoredRecord, got {other:?}"),
    }
}

// ============================================================================
// Defaults and overwrite-skip
// ============================================================================

#[tokio::test]
async fn defaults_apply_to_absent_keys() {
    let backend = Arc::new(MemoryBackend::new());
    let keys = MemoryKeyStore::new();
    let cache = open(&backend, &keys, "ns").await;

    let mut defaults = Map::new();
    defaults.insert("theme".into(), json!("dark"));
    let got = cache.get_with_defaults(defaults).await.unwrap();
    assert_eq!(got["theme"], json!("dark"));
    assert!(!backend.contains("theme"), "defaults are never written");
}

#[tokio::test]
async fn none_value_keeps_previous_value() {
    let backend = Arc::new(MemoryBackend::new());
    let keys = MemoryKeyStore::new();
    let cache = open(&backend, &keys, "ns").await;
    cache.set_value("k", "kept").await.unwrap();
    let stored = backend.raw_get("k");

    cache
        .set(BTreeMap::from([("k".to_string(), None)]))
        .await
        .unwrap();
    assert_eq!(backend.raw_get("k"), stored);
    assert_eq!(cache.get_value::<String>("k").await.unwrap().as_deref(), Some("kept"));
}

// ============================================================================
// Provisioning through the facade
// ============================================================================

#[tokio::test]
async fn recovery_disallowed_surfaces_key_read_failure() {
    let backend = Arc::new(MemoryBackend::new());
    let keys = MemoryKeyStore::new();
    open(&backend, &keys, "ns").await;
    keys.set(&WrappingKey::generate().unwrap()).await.unwrap();

    let options = CacheOptions {
        allow_recovery_on_error: false,
        ..CacheOptions::new("ns")
    };
    let result = SplitTrustCache::open(Arc::clone(&backend), &keys, options).await;
    assert!(matches!(
        result,
        Err(CacheError::Provision(ProvisionError::KeyReadFailure { .. }))
    ));
}

/// Key store that stalls the first `stalls` reads.
struct SlowKeyStore {
    inner: MemoryKeyStore,
    stalls: parking_lot::Mutex<usize>,
}

#[async_trait]
impl WrappingKeyStore for SlowKeyStore {
    async fn get(&self) -> Result<Option<WrappingKey>, KeyStoreError> {
        let stall = {
            let mut stalls = self.stalls.lock();
            let stall = *stalls > 0;
            *stalls = stalls.saturating_sub(1);
            stall
        };
        if stall {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        self.inner.get().await
    }

    async fn set(&self, key: &WrappingKey) -> Result<(), KeyStoreError> {
        self.inner.set(key).await
    }

    async fn delete(&self) -> Result<(), KeyStoreError> {
        self.inner.delete().await
    }
}

#[tokio::test]
async fn timed_out_provisioning_is_not_corruption() {
    let backend = Arc::new(MemoryBackend::new());
    let keys = SlowKeyStore {
        inner: MemoryKeyStore::new(),
        stalls: parking_lot::Mutex::new(1),
    };
    let options = CacheOptions {
        provision_timeout: Duration::from_millis(50),
        ..CacheOptions::new("ns")
    };

    let result = SplitTrustCache::open(Arc::clone(&backend), &keys, options.clone()).await;
    assert!(matches!(
        result,
        Err(CacheError::Provision(ProvisionError::Timeout))
    ));
    assert!(backend.is_empty(), "abandoned attempt wrote nothing");

    let cache = SplitTrustCache::open(Arc::clone(&backend), &keys, options)
        .await
        .unwrap();
    assert!(cache.created());
    cache.set_value("k", &1).await.unwrap();
    assert_eq!(cache.get_value::<i32>("k").await.unwrap(), Some(1));
}

/// Key store whose first `set` persists the key and then stalls, as if the
/// process were suspended between the two epoch writes.
struct StallAfterSetKeyStore {
    inner: MemoryKeyStore,
    stall_next_set: parking_lot::Mutex<bool>,
}

#[async_trait]
impl WrappingKeyStore for StallAfterSetKeyStore {
    async fn get(&self) -> Result<Option<WrappingKey>, KeyStoreError> {
        self.inner.get().await
    }

    async fn set(&self, key: &WrappingKey) -> Result<(), KeyStoreError> {
        self.inner.set(key).await?;
        let stall = std::mem::replace(&mut *self.stall_next_set.lock(), false);
        if stall {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        Ok(())
    }

    async fn delete(&self) -> Result<(), KeyStoreError> {
        self.inner.delete().await
    }
}

#[tokio::test]
async fn mint_interrupted_between_domains_completes_without_recovery() {
    let backend = Arc::new(MemoryBackend::new());
    let keys = StallAfterSetKeyStore {
        inner: MemoryKeyStore::new(),
        stall_next_set: parking_lot::Mutex::new(true),
    };
    let options = CacheOptions {
        allow_recovery_on_error: false,
        provision_timeout: Duration::from_millis(50),
        ..CacheOptions::new("ns")
    };

    let result = SplitTrustCache::open(Arc::clone(&backend), &keys, options.clone()).await;
    assert!(matches!(
        result,
        Err(CacheError::Provision(ProvisionError::Timeout))
    ));
    assert!(keys.get().await.unwrap().is_some(), "domain B was written");
    assert!(backend.is_empty(), "domain A was not");

    let cache = SplitTrustCache::open(Arc::clone(&backend), &keys, options.clone())
        .await
        .unwrap();
    assert!(cache.created());
    cache.set_value("k", "after").await.unwrap();

    let reopened = SplitTrustCache::open(Arc::clone(&backend), &keys, options)
        .await
        .unwrap();
    assert!(!reopened.created());
    assert_eq!(
        reopened.get_value::<String>("k").await.unwrap().as_deref(),
        Some("after")
    );
}
