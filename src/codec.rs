//! Per-record authenticated encryption.
//!
//! Stored format (domain A, under the caller's record key):
//! `{"iv": "<24 hex chars>", "ciphertext": "<hex, includes 16-byte tag>"}`

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::Nonce;
use serde_json::{json, Value};

use crate::aad;
use crate::error::{CodecError, MalformedError};
use crate::keys::DataKey;
use crate::types::{AES_GCM_IV_LENGTH, AES_GCM_TAG_LENGTH};

/// One encrypted cache value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedRecord {
    pub iv: [u8; AES_GCM_IV_LENGTH],
    /// Ciphertext with the AEAD tag appended.
    pub ciphertext: Vec<u8>,
}

impl EncryptedRecord {
    pub fn to_value(&self) -> Value {
        json!({
            "iv": hex::encode(self.iv),
            "ciphertext": hex::encode(&self.ciphertext),
        })
    }

    /// Validate and decode a stored record. Unknown extra fields are ignored.
    pub fn from_value(value: &Value) -> Result<Self, MalformedError> {
        let obj = value
            .as_object()
            .ok_or_else(|| MalformedError::new("encrypted record", "expected an object"))?;

        let iv_hex = hex_field(obj, "iv")?;
        let iv: [u8; AES_GCM_IV_LENGTH] = hex::decode(iv_hex)
            .map_err(|e| MalformedError::new("encrypted record", format!("iv: {e}")))?
            .try_into()
            .map_err(|v: Vec<u8>| {
                MalformedError::new(
                    "encrypted record",
                    format!("iv: expected {AES_GCM_IV_LENGTH} bytes, got {}", v.len()),
                )
            })?;

        let ciphertext = hex::decode(hex_field(obj, "ciphertext")?)
            .map_err(|e| MalformedError::new("encrypted record", format!("ciphertext: {e}")))?;
        if ciphertext.len() < AES_GCM_TAG_LENGTH {
            return Err(MalformedError::new(
                "encrypted record",
                "ciphertext shorter than authentication tag",
            ));
        }

        Ok(Self { iv, ciphertext })
    }
}

fn hex_field<'a>(
    obj: &'a serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, MalformedError> {
    obj.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            MalformedError::new("encrypted record", format!("missing string field {field}"))
        })
}

/// Encrypts and decrypts record values bound to (namespace, record key).
///
/// New algorithms add new implementers; the cache only sees this trait.
pub trait RecordCodec: Send + Sync {
    fn encrypt(
        &self,
        namespace: &str,
        record_key: &str,
        plaintext: &[u8],
    ) -> Result<EncryptedRecord, CodecError>;

    fn decrypt(
        &self,
        namespace: &str,
        record_key: &str,
        record: &EncryptedRecord,
    ) -> Result<Vec<u8>, CodecError>;
}

/// AES-256-GCM with a fresh random 12-byte IV per record.
#[derive(Debug)]
pub struct AesGcmCodec {
    key: DataKey,
}

impl AesGcmCodec {
    pub fn new(key: DataKey) -> Self {
        Self { key }
    }
}

fn generate_iv() -> Result<[u8; AES_GCM_IV_LENGTH], CodecError> {
    let mut iv = [0u8; AES_GCM_IV_LENGTH];
    getrandom::getrandom(&mut iv).map_err(|e| CodecError::Encryption(e.to_string()))?;
    Ok(iv)
}

impl RecordCodec for AesGcmCodec {
    fn encrypt(
        &self,
        namespace: &str,
        record_key: &str,
        plaintext: &[u8],
    ) -> Result<EncryptedRecord, CodecError> {
        let iv = generate_iv()?;
        let aad = aad::bind(namespace, record_key);
        let ciphertext = self
            .key
            .cipher()
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| CodecError::Encryption(e.to_string()))?;
        Ok(EncryptedRecord { iv, ciphertext })
    }

    fn decrypt(
        &self,
        namespace: &str,
        record_key: &str,
        record: &EncryptedRecord,
    ) -> Result<Vec<u8>, CodecError> {
        let aad = aad::bind(namespace, record_key);
        self.key
            .cipher()
            .decrypt(
                Nonce::from_slice(&record.iv),
                Payload {
                    msg: &record.ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| CodecError::Authentication)
    }
}
