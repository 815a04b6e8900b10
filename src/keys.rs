//! Wrapping key and data key primitives.
//!
//! An epoch is one (wrapping key, data key) pair. The data key is generated as
//! raw bytes only long enough to wrap it with AES-KW, then lives on as an
//! AES-256-GCM cipher instance; its bytes are never handed out again.
//!
//! Wrapped key wire format: AES-KW(wrapping key, data key) = 40 bytes.

use std::fmt;

use aes_gcm::aead::KeyInit;
use aes_gcm::{Aes256Gcm, Key};
use aes_gcm::aead::generic_array::GenericArray;
use aes_kw::KekAes256;
use zeroize::Zeroizing;

use crate::error::KeyError;
use crate::types::{AES_KEY_LENGTH, WRAPPED_KEY_LENGTH};

fn random_key_bytes() -> Result<Zeroizing<[u8; AES_KEY_LENGTH]>, KeyError> {
    let mut bytes = Zeroizing::new([0u8; AES_KEY_LENGTH]);
    getrandom::getrandom(&mut *bytes).map_err(|e| KeyError::Rng(e.to_string()))?;
    Ok(bytes)
}

/// AES-KW key encryption key. Lives only in the domain-B key store.
pub struct WrappingKey(Zeroizing<[u8; AES_KEY_LENGTH]>);

impl WrappingKey {
    /// Generate a random 256-bit wrapping key.
    pub fn generate() -> Result<Self, KeyError> {
        random_key_bytes().map(Self)
    }

    /// Rebuild a wrapping key read back from a key store.
    /// Returns `None` if `bytes` is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let array: [u8; AES_KEY_LENGTH] = bytes.try_into().ok()?;
        Some(Self(Zeroizing::new(array)))
    }

    /// Raw key bytes, for persisting into a domain-B store only.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }

    /// Key schedule built straight from the zeroizing buffer; no loose copy of
    /// the key bytes is made.
    fn kek(&self) -> KekAes256 {
        KekAes256::new(GenericArray::from_slice(&self.0[..]))
    }

    fn wrap(
        &self,
        raw_data_key: &[u8; AES_KEY_LENGTH],
    ) -> Result<[u8; WRAPPED_KEY_LENGTH], KeyError> {
        let kek = self.kek();
        let mut wrapped = [0u8; WRAPPED_KEY_LENGTH];
        kek.wrap(raw_data_key, &mut wrapped)
            .map_err(|e| KeyError::Wrap(format!("{:?}", e)))?;
        Ok(wrapped)
    }

    fn unwrap_into(
        &self,
        wrapped: &[u8],
        out: &mut [u8; AES_KEY_LENGTH],
    ) -> Result<(), KeyError> {
        if wrapped.len() != WRAPPED_KEY_LENGTH {
            return Err(KeyError::Unwrap);
        }
        let kek = self.kek();
        kek.unwrap(wrapped, out).map_err(|_| KeyError::Unwrap)
    }
}

impl fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WrappingKey(..)")
    }
}

/// AES-256-GCM record key in non-extractable form.
pub struct DataKey {
    cipher: Aes256Gcm,
}

impl DataKey {
    fn from_raw(raw: &[u8; AES_KEY_LENGTH]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(raw);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub(crate) fn cipher(&self) -> &Aes256Gcm {
        &self.cipher
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey(..)")
    }
}

/// A freshly minted key generation.
pub struct Epoch {
    pub wrapping_key: WrappingKey,
    pub data_key: DataKey,
    /// The data key wrapped under `wrapping_key`.
    pub wrapped: [u8; WRAPPED_KEY_LENGTH],
}

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Epoch").finish_non_exhaustive()
    }
}

/// Generate a new wrapping key and data key, and wrap the latter.
pub fn generate_epoch() -> Result<Epoch, KeyError> {
    let wrapping_key = WrappingKey::generate()?;
    let raw = random_key_bytes()?;
    let wrapped = wrapping_key.wrap(&raw)?;
    Ok(Epoch {
        wrapping_key,
        data_key: DataKey::from_raw(&raw),
        wrapped,
    })
}

/// Unwrap a data key blob with the given wrapping key.
///
/// Any failure (wrong length, wrong key, tampered blob) is `KeyError::Unwrap`.
pub fn unwrap_data_key(wrapped: &[u8], wrapping_key: &WrappingKey) -> Result<DataKey, KeyError> {
    let mut raw = Zeroizing::new([0u8; AES_KEY_LENGTH]);
    wrapping_key.unwrap_into(wrapped, &mut *raw)?;
    Ok(DataKey::from_raw(&raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes_gcm::aead::Aead;
    use aes_gcm::Nonce;

    fn seal(key: &DataKey, msg: &[u8]) -> Vec<u8> {
        key.cipher()
            .encrypt(Nonce::from_slice(&[7u8; 12]), msg)
            .unwrap()
    }

    fn open(key: &DataKey, ct: &[u8]) -> Option<Vec<u8>> {
        key.cipher().decrypt(Nonce::from_slice(&[7u8; 12]), ct).ok()
    }

    #[test]
    fn wrapping_key_is_unique() {
        let a = WrappingKey::generate().unwrap();
        let b = WrappingKey::generate().unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.as_bytes().len(), 32);
    }

    #[test]
    fn from_bytes_rejects_wrong_length() {
        assert!(WrappingKey::from_bytes(&[0u8; 16]).is_none());
        assert!(WrappingKey::from_bytes(&[0u8; 33]).is_none());
        assert!(WrappingKey::from_bytes(&[0u8; 32]).is_some());
    }

    #[test]
    fn wrapped_key_is_40_bytes() {
        let epoch = generate_epoch().unwrap();
        assert_eq!(epoch.wrapped.len(), WRAPPED_KEY_LENGTH);
    }

    #[test]
    fn unwrap_recovers_same_data_key() {
        let epoch = generate_epoch().unwrap();
        let unwrapped = unwrap_data_key(&epoch.wrapped, &epoch.wrapping_key).unwrap();
        let ct = seal(&epoch.data_key, b"hello");
        assert_eq!(open(&unwrapped, &ct).unwrap(), b"hello");
    }

    #[test]
    fn unwrap_survives_store_round_trip_of_wrapping_key() {
        let epoch = generate_epoch().unwrap();
        let restored = WrappingKey::from_bytes(epoch.wrapping_key.as_bytes()).unwrap();
        assert!(unwrap_data_key(&epoch.wrapped, &restored).is_ok());
    }

    #[test]
    fn wrap_is_deterministic_for_a_restored_key() {
        let key = WrappingKey::generate().unwrap();
        let restored = WrappingKey::from_bytes(key.as_bytes()).unwrap();
        let raw = [0x42u8; AES_KEY_LENGTH];
        assert_eq!(key.wrap(&raw).unwrap(), restored.wrap(&raw).unwrap());

        let mut out = [0u8; AES_KEY_LENGTH];
        restored
            .unwrap_into(&key.wrap(&raw).unwrap(), &mut out)
            .unwrap();
        assert_eq!(out, raw);
    }

    #[test]
    fn wrong_wrapping_key_fails() {
        let first = generate_epoch().unwrap();
        let second = generate_epoch().unwrap();
        assert!(matches!(
            unwrap_data_key(&first.wrapped, &second.wrapping_key),
            Err(KeyError::Unwrap)
        ));
    }

    #[test]
    fn tampered_blob_fails() {
        let epoch = generate_epoch().unwrap();
        let mut wrapped = epoch.wrapped;
        wrapped[10] ^= 0x01;
        assert!(unwrap_data_key(&wrapped, &epoch.wrapping_key).is_err());
    }

    #[test]
    fn wrong_length_fails() {
        let epoch = generate_epoch().unwrap();
        assert!(unwrap_data_key(&epoch.wrapped[..20], &epoch.wrapping_key).is_err());
        assert!(unwrap_data_key(&[0u8; 48], &epoch.wrapping_key).is_err());
    }

    #[test]
    fn debug_output_is_redacted() {
        let epoch = generate_epoch().unwrap();
        assert_eq!(format!("{:?}", epoch.wrapping_key), "WrappingKey(..)");
        assert_eq!(format!("{:?}", epoch.data_key), "DataKey(..)");
    }
}
