//! Associated data binding records to their namespace and key.
//!
//! Format: "split-cache:record:v1\0" ++ [4 bytes: namespace length (u32 BE)]
//! ++ [namespace UTF-8] ++ [record key UTF-8]
//!
//! The length prefix makes the encoding injective: ("ab", "c") and ("a", "bc")
//! bind to different bytes.

const RECORD_AAD_PREFIX: &[u8] = b"split-cache:record:v1\0";

/// Build AAD for a record stored under `record_key` in cache `namespace`.
pub fn bind(namespace: &str, record_key: &str) -> Vec<u8> {
    let ns_bytes = namespace.as_bytes();
    let key_bytes = record_key.as_bytes();
    let mut aad =
        Vec::with_capacity(RECORD_AAD_PREFIX.len() + 4 + ns_bytes.len() + key_bytes.len());
    aad.extend_from_slice(RECORD_AAD_PREFIX);
    aad.extend_from_slice(&(ns_bytes.len() as u32).to_be_bytes());
    aad.extend_from_slice(ns_bytes);
    aad.extend_from_slice(key_bytes);
    aad
}
