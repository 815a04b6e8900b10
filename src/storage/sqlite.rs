//! SQLite-backed domain-B key store.
//!
//! One database file per store, `PRAGMA user_version` as the schema version,
//! one table (`wrapping_keys`) holding at most one row. A connection is
//! opened per operation, so a deleted or replaced file is picked up on the
//! next call.
//!
//! Every operation runs on tokio's blocking pool. A caller that times out
//! stops waiting, but the SQLite call itself runs to completion.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::KeyStoreError;
use crate::keys::WrappingKey;
use crate::types::{KEY_DB_NAME, KEY_DB_RECORD, KEY_DB_SCHEMA_VERSION, KEY_DB_STORE};

use super::traits::WrappingKeyStore;

/// Where the key database lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteKeyStoreConfig {
    /// Directory holding `split-cache-keys.sqlite3`.
    pub dir: PathBuf,
}

pub struct SqliteKeyStore {
    path: PathBuf,
}

impl SqliteKeyStore {
    pub fn new(config: SqliteKeyStoreConfig) -> Self {
        Self {
            path: config.dir.join(format!("{KEY_DB_NAME}.sqlite3")),
        }
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Open the database, creating or upgrading the schema when it is fresh.
fn open_db(path: &Path) -> Result<Connection, KeyStoreError> {
    let conn = Connection::open(path).map_err(|e| KeyStoreError::Open(e.to_string()))?;

    let version: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| KeyStoreError::Open(e.to_string()))?;

    if version > KEY_DB_SCHEMA_VERSION {
        return Err(KeyStoreError::Open(format!(
            "schema version {version} is newer than supported version {KEY_DB_SCHEMA_VERSION}"
        )));
    }

    if version < KEY_DB_SCHEMA_VERSION {
        tracing::debug!(path = %path.display(), "Creating key database schema");
        conn.execute_batch(&format!(
            "BEGIN;
             CREATE TABLE IF NOT EXISTS {KEY_DB_STORE} (
                 id  TEXT PRIMARY KEY NOT NULL,
                 key BLOB NOT NULL
             );
             PRAGMA user_version = {KEY_DB_SCHEMA_VERSION};
             COMMIT;"
        ))
        .map_err(|e| KeyStoreError::Open(e.to_string()))?;
        return Ok(conn);
    }

    let has_store: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![KEY_DB_STORE],
            |row| row.get(0),
        )
        .map_err(|e| KeyStoreError::Open(e.to_string()))?;
    if !has_store {
        return Err(KeyStoreError::Open(format!(
            "object store {KEY_DB_STORE} is missing"
        )));
    }

    Ok(conn)
}

fn read_key(path: &Path) -> Result<Option<WrappingKey>, KeyStoreError> {
    let conn = open_db(path)?;
    let bytes: Option<Zeroizing<Vec<u8>>> = conn
        .query_row(
            &format!("SELECT key FROM {KEY_DB_STORE} WHERE id = ?1"),
            params![KEY_DB_RECORD],
            |row| row.get::<_, Vec<u8>>(0).map(Zeroizing::new),
        )
        .optional()
        .map_err(|e| KeyStoreError::Read(e.to_string()))?;

    match bytes {
        None => Ok(None),
        Some(bytes) => WrappingKey::from_bytes(&bytes).map(Some).ok_or_else(|| {
            KeyStoreError::Read(format!(
                "stored wrapping key has invalid length {}",
                bytes.len()
            ))
        }),
    }
}

fn write_key(path: &Path, key: &[u8]) -> Result<(), KeyStoreError> {
    let conn = open_db(path)?;
    conn.execute(
        &format!("INSERT OR REPLACE INTO {KEY_DB_STORE} (id, key) VALUES (?1, ?2)"),
        params![KEY_DB_RECORD, key],
    )
    .map_err(|e| KeyStoreError::Write(e.to_string()))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn delete_db(path: &Path) -> Result<(), KeyStoreError> {
    let mut siblings = Vec::with_capacity(4);
    siblings.push(path.to_path_buf());
    for suffix in ["-journal", "-wal", "-shm"] {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        siblings.push(PathBuf::from(name));
    }
    for file in &siblings {
        remove_if_exists(file)
            .map_err(|e| KeyStoreError::Delete(format!("{}: {e}", file.display())))?;
    }
    tracing::warn!(path = %path.display(), "Key database deleted");
    Ok(())
}

/// Run `op` on the blocking pool. A failed join is reported through `on_join`.
async fn run_blocking<T, F>(
    op: F,
    on_join: fn(String) -> KeyStoreError,
) -> Result<T, KeyStoreError>
where
    F: FnOnce() -> Result<T, KeyStoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| on_join(e.to_string()))?
}

#[async_trait]
impl WrappingKeyStore for SqliteKeyStore {
    async fn get(&self) -> Result<Option<WrappingKey>, KeyStoreError> {
        let path = self.path.clone();
        run_blocking(move || read_key(&path), KeyStoreError::Read).await
    }

    async fn set(&self, key: &WrappingKey) -> Result<(), KeyStoreError> {
        let path = self.path.clone();
        let bytes = Zeroizing::new(key.as_bytes().to_vec());
        run_blocking(move || write_key(&path, &bytes), KeyStoreError::Write).await
    }

    async fn delete(&self) -> Result<(), KeyStoreError> {
        let path = self.path.clone();
        run_blocking(move || delete_db(&path), KeyStoreError::Delete).await
    }
}
