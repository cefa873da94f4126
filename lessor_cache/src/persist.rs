//! Encrypted on-disk backing for the cache
//!
//! Records are kept in a single SQLite database under a caller-chosen
//! directory. Each record belongs to a bucket named for its
//! [`EntryType`], and buckets return records in the order they were first
//! written, so a token is always read back before the leases created with
//! it. Every record is sealed by a [`Wrapper`] bound to host-supplied
//! additional data.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::{entry::EntryType, error::StorageError};

mod crypto;

pub use crypto::{AeadWrapper, KeyManager, Wrapper};

/// Name of the database file within the persistence directory
pub const DB_FILE_NAME: &str = "lessor-cache.db";

const RETRIEVAL_TOKEN_KEY: &str = "retrieval-token";
const AUTO_AUTH_TOKEN_KEY: &str = "auto-auth-token";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    seq     INTEGER PRIMARY KEY AUTOINCREMENT,
    bucket  TEXT NOT NULL,
    id      TEXT NOT NULL,
    value   BLOB NOT NULL,
    UNIQUE (bucket, id)
);

CREATE TABLE IF NOT EXISTS meta (
    key     TEXT PRIMARY KEY,
    value   BLOB NOT NULL
);
"#;

/// The persistent store
pub struct PersistentStorage {
    conn: Mutex<Connection>,
    wrapper: Arc<dyn Wrapper>,
    aad: Vec<u8>,
    path: PathBuf,
}

impl fmt::Debug for PersistentStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentStorage")
            .field("path", &self.path)
            .field("wrapper", &self.wrapper)
            .finish_non_exhaustive()
    }
}

impl PersistentStorage {
    /// Whether a database exists in `dir`
    pub fn exists(dir: &Path) -> bool {
        dir.join(DB_FILE_NAME).is_file()
    }

    /// Creates a new database in `dir` with a freshly generated key
    ///
    /// Any database already there is replaced.
    pub fn create(dir: &Path, aad: Vec<u8>) -> Result<Self, StorageError> {
        let path = dir.join(DB_FILE_NAME);
        if path.exists() {
            Self::remove(dir)?;
        }

        let keys = KeyManager::generate()?;
        let storage = Self::open_with_wrapper(&path, Arc::new(keys.wrapper()?), aad)?;
        storage.put_meta(RETRIEVAL_TOKEN_KEY, keys.retrieval_token())?;

        tracing::debug!(path = %storage.path.display(), "created persistent cache");
        Ok(storage)
    }

    /// Opens the existing database in `dir`, recovering its key
    pub fn open(dir: &Path, aad: Vec<u8>) -> Result<Self, StorageError> {
        let path = dir.join(DB_FILE_NAME);
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;

        let token: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![RETRIEVAL_TOKEN_KEY],
                |row| row.get(0),
            )
            .optional()?;
        let keys = KeyManager::from_retrieval_token(&token.ok_or(StorageError::InvalidKey)?)?;

        tracing::debug!(path = %path.display(), "opened persistent cache");
        Ok(Self {
            conn: Mutex::new(conn),
            wrapper: Arc::new(keys.wrapper()?),
            aad,
            path,
        })
    }

    /// Opens the database at `path` using the given wrapper
    pub fn open_with_wrapper(
        path: &Path,
        wrapper: Arc<dyn Wrapper>,
        aad: Vec<u8>,
    ) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
            wrapper,
            aad,
            path: path.to_owned(),
        })
    }

    /// Deletes the database in `dir`
    pub fn remove(dir: &Path) -> Result<(), StorageError> {
        let path = dir.join(DB_FILE_NAME);
        std::fs::remove_file(&path).map_err(|source| StorageError::Remove { path, source })
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inserts or updates the record `id` in the bucket for `kind`
    ///
    /// An updated record keeps its original position in the bucket.
    pub fn set(&self, id: &str, plaintext: &[u8], kind: EntryType) -> Result<(), StorageError> {
        let sealed = self.wrapper.encrypt(plaintext, &self.aad)?;
        self.conn.lock().execute(
            "INSERT INTO entries (bucket, id, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (bucket, id) DO UPDATE SET value = excluded.value",
            params![kind.as_str(), id, sealed],
        )?;
        tracing::trace!(%id, bucket = %kind, "persisted cache record");
        Ok(())
    }

    /// Deletes the record `id` from the bucket for `kind`
    pub fn delete(&self, id: &str, kind: EntryType) -> Result<(), StorageError> {
        self.conn.lock().execute(
            "DELETE FROM entries WHERE bucket = ?1 AND id = ?2",
            params![kind.as_str(), id],
        )?;
        tracing::trace!(%id, bucket = %kind, "deleted persisted cache record");
        Ok(())
    }

    /// Every record in the bucket for `kind`, oldest first
    pub fn get_by_type(&self, kind: EntryType) -> Result<Vec<Vec<u8>>, StorageError> {
        let sealed: Vec<Vec<u8>> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare("SELECT value FROM entries WHERE bucket = ?1 ORDER BY seq")?;
            let rows = stmt.query_map(params![kind.as_str()], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };

        sealed
            .iter()
            .map(|record| self.wrapper.decrypt(record, &self.aad))
            .collect()
    }

    /// Remembers the most recently active auto-auth token
    pub fn set_auto_auth_token(&self, token: &str) -> Result<(), StorageError> {
        let sealed = self.wrapper.encrypt(token.as_bytes(), &self.aad)?;
        self.put_meta(AUTO_AUTH_TOKEN_KEY, &sealed)
    }

    /// The most recently active auto-auth token, if one was stored
    pub fn get_auto_auth_token(&self) -> Result<Option<String>, StorageError> {
        let Some(sealed) = self.get_meta(AUTO_AUTH_TOKEN_KEY)? else {
            return Ok(None);
        };

        let token = self.wrapper.decrypt(&sealed, &self.aad)?;
        Ok(Some(String::from_utf8_lossy(&token).into_owned()))
    }

    /// The retrieval token for the store's key
    pub fn get_retrieval_token(&self) -> Result<Option<Vec<u8>>, StorageError> {
        self.get_meta(RETRIEVAL_TOKEN_KEY)
    }

    /// Removes every record and the remembered auto-auth token
    ///
    /// The key's retrieval token is kept.
    pub fn clear(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM entries", [])?;
        conn.execute("DELETE FROM meta WHERE key = ?1", params![AUTO_AUTH_TOKEN_KEY])?;
        tracing::debug!("cleared persistent cache");
        Ok(())
    }

    /// Closes the database
    pub fn close(self) -> Result<(), StorageError> {
        self.conn
            .into_inner()
            .close()
            .map_err(|(_, err)| StorageError::Database(err))
    }

    fn put_meta(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.conn.lock().execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let value = self
            .conn
            .lock()
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }
}

/// Reads the additional data binding the store to a workload identity
///
/// The file holds the workload's service-account token; surrounding
/// whitespace is ignored.
pub fn read_service_account_aad(path: &Path) -> std::io::Result<Vec<u8>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents.trim().as_bytes().to_vec())
}
