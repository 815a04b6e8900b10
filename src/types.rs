//! Sizes, fixed storage slots, and schema constants.

/// AES key length in bytes (256 bits). Used for both the wrapping key and the data key.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-GCM IV length in bytes (96 bits per NIST recommendation).
pub const AES_GCM_IV_LENGTH: usize = 12;

/// AES-GCM tag length in bytes (128 bits).
pub const AES_GCM_TAG_LENGTH: usize = 16;

/// AES-KW output size for a 32-byte key: 32 + 8 = 40 bytes.
pub const WRAPPED_KEY_LENGTH: usize = 40;

/// Domain-A slot holding the hex-encoded wrapped data key.
pub const WRAPPED_KEY_SLOT: &str = "split-cache#wrapped-data-key";

/// Domain-A slot holding the JSON array of record keys written by the cache.
pub const RECORD_INDEX_SLOT: &str = "split-cache#record-index";

/// Domain-B database name (file stem of the SQLite database).
pub const KEY_DB_NAME: &str = "split-cache-keys";

/// Domain-B schema version. Stored in `PRAGMA user_version`.
pub const KEY_DB_SCHEMA_VERSION: i64 = 1;

/// Domain-B object store (table) holding the wrapping key.
pub const KEY_DB_STORE: &str = "wrapping_keys";

/// Record key of the single wrapping key row.
pub const KEY_DB_RECORD: &str = "wrapping-key";
