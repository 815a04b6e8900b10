use thiserror::Error;

/// Structural failure of the domain-B key database.
///
/// Always distinct from "no key stored": a `get` that returns `Ok(None)` means
/// the database is healthy and empty.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("Failed to open key database: {0}")]
    Open(String),

    #[error("Failed to read key database: {0}")]
    Read(String),

    #[error("Failed to write key database: {0}")]
    Write(String),

    #[error("Failed to delete key database: {0}")]
    Delete(String),
}

/// A stored value is present but does not have the expected shape.
#[derive(Debug, Error)]
#[error("Malformed {what}: {reason}")]
pub struct MalformedError {
    pub what: &'static str,
    pub reason: String,
}

impl MalformedError {
    pub fn new(what: &'static str, reason: impl Into<String>) -> Self {
        Self {
            what,
            reason: reason.into(),
        }
    }
}

/// Key generation and AES-KW wrap/unwrap failures.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Random number generation failed: {0}")]
    Rng(String),

    #[error("AES-KW wrap failed: {0}")]
    Wrap(String),

    #[error("AES-KW unwrap failed")]
    Unwrap,
}

/// Record encryption/decryption failures.
///
/// `Authentication` deliberately carries no cause: a wrong key, a wrong
/// context and a tampered record all look the same to the caller.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Record authentication failed")]
    Authentication,

    #[error("Record encryption failed: {0}")]
    Encryption(String),
}

/// Opaque failure reported by a domain-A key/value backend.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure reading the wrapped data key slot in domain A.
#[derive(Debug, Error)]
pub enum WrappedKeyError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Malformed(#[from] MalformedError),
}

/// Failure to obtain a usable data key.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Could not read data key: {cause}")]
    KeyReadFailure { cause: String },

    #[error("Key store is unrecoverable: {cause}")]
    UnrecoverableKeyStore { cause: String },

    #[error("Key provisioning timed out")]
    Timeout,
}

/// Errors surfaced by the cache facade. Record-level variants name the
/// offending key.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Invalid stored record for key \"{key}\": {source}")]
    InvalidStoredRecord {
        key: String,
        #[source]
        source: MalformedError,
    },

    #[error("Decryption failed for key \"{key}\": {source}")]
    DecryptionFailure {
        key: String,
        #[source]
        source: CodecError,
    },

    #[error("Encryption failed for key \"{key}\": {source}")]
    EncryptionFailure {
        key: String,
        #[source]
        source: CodecError,
    },

    #[error("JSON error for key \"{key}\": {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Key \"{0}\" is reserved for cache bookkeeping")]
    ReservedKey(String),

    #[error("Storage backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Provisioning error: {0}")]
    Provision(#[from] ProvisionError),
}

pub type Result<T> = std::result::Result<T, CacheError>;
