//! Split-trust encrypted cache.
//!
//! Values are encrypted with an AES-256-GCM data key. The data key is stored
//! wrapped (AES-KW) in domain A next to the records; the wrapping key lives
//! in domain B. Neither domain's storage alone yields plaintext.

pub mod aad;
pub mod cache;
pub mod codec;
pub mod error;
pub mod keys;
pub mod provision;
pub mod storage;
pub mod types;

pub use cache::{CacheOptions, SplitTrustCache};
pub use codec::{AesGcmCodec, EncryptedRecord, RecordCodec};
pub use error::{
    BackendError, CacheError, CodecError, KeyError, KeyStoreError, MalformedError, ProvisionError,
    Result, WrappedKeyError,
};
pub use keys::{DataKey, WrappingKey};
pub use provision::{KeyProvisioner, ProvisionedKey};
pub use storage::memory::{MemoryBackend, MemoryKeyStore};
#[cfg(feature = "sqlite")]
pub use storage::sqlite::{SqliteKeyStore, SqliteKeyStoreConfig};
pub use storage::traits::{KvBackend, WrappingKeyStore};
pub use storage::wrapped_key::WrappedKeyStore;
