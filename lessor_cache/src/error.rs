use std::{fmt, path::PathBuf};

use thiserror::Error;

/// An error from the in-memory cache store
#[derive(Debug, Error)]
pub enum MemDbError {
    /// No entry matched the lookup
    #[error("cache entry not found")]
    NotFound,
    /// The index name is not known to the store
    #[error("unknown index `{0}`")]
    InvalidIndex(String),
    /// The index was given the wrong number of values
    #[error("index `{index}` expects {expected} value(s), got {got}")]
    InvalidArguments {
        /// The index being queried
        index: &'static str,
        /// Number of values the index expects
        expected: usize,
        /// Number of values supplied
        got: usize,
    },
    /// An entry without an ID cannot be stored
    #[error("cache entry has no id")]
    MissingId,
    /// Another entry already holds the value of a unique index
    #[error("another cache entry has the same {0}")]
    Conflict(&'static str),
}

/// An error from the persistent store
#[derive(Debug, Error)]
pub enum StorageError {
    /// The database rejected an operation
    #[error("persistent store operation failed")]
    Database(#[from] rusqlite::Error),
    /// A record could not be encrypted
    #[error("failed to encrypt record")]
    Encrypt,
    /// A record could not be decrypted or authenticated
    #[error("failed to decrypt record; the key or additional data does not match")]
    Decrypt,
    /// The key material is not usable
    #[error("invalid key material")]
    InvalidKey,
    /// The database file could not be removed
    #[error("failed to remove persistent store at {}", .path.display())]
    Remove {
        /// Path of the database file
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
    /// The bucket name is not known
    #[error("unknown bucket `{0}`")]
    UnknownBucket(String),
}

/// An error raised while caching a request
#[derive(Debug, Error)]
pub enum CacheError {
    /// The in-memory store failed
    #[error(transparent)]
    MemDb(#[from] MemDbError),
    /// The persistent store failed
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// An entry could not be encoded for persistence
    #[error("failed to encode cache entry")]
    Encode(#[from] rmp_serde::encode::Error),
    /// A persisted entry could not be decoded
    #[error("failed to decode cache entry")]
    Decode(#[from] rmp_serde::decode::Error),
    /// A response body was not the JSON expected
    #[error("failed to parse response body")]
    Json(#[from] serde_json::Error),
    /// The request body was missing a required field
    #[error("request body has no string field `{0}`")]
    MissingField(&'static str),
    /// A cache-clear request named an unknown selector
    #[error("invalid cache-clear type `{0}`")]
    InvalidClearType(String),
    /// A cache-clear request omitted the value to match
    #[error("cache-clear type `{0}` requires a value")]
    MissingClearValue(String),
    /// The parent needed to restore an entry is not cached
    #[error("parent token of entry {id} is not cached")]
    ParentNotFound {
        /// ID of the entry being restored
        id: String,
    },
    /// A persisted renewable entry has no cached response
    #[error("entry {id} has no cached response")]
    MissingResponse {
        /// ID of the entry
        id: String,
    },
    /// A persisted renewable entry carries neither a lease nor a token
    #[error("entry {id} has neither a lease nor a token to renew")]
    NotRenewable {
        /// ID of the entry
        id: String,
    },
    /// Forwarding to the upstream failed
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

impl CacheError {
    /// Whether the error was caused by a malformed caller request
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self,
            Self::InvalidClearType(_) | Self::MissingClearValue(_) | Self::MissingField(_)
        )
    }
}

/// An error forwarding a request upstream
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The upstream could not be reached or answered unreadably
    #[error("failed to forward request upstream")]
    Upstream(#[from] lessor_api::Error),
}

/// Errors collected while restoring the cache from persistent storage
///
/// A failure restoring one entry does not stop the others being restored.
#[derive(Debug, Default)]
pub struct RestoreErrors {
    errors: Vec<CacheError>,
}

impl RestoreErrors {
    pub(crate) fn push(&mut self, err: impl Into<CacheError>) {
        self.errors.push(err.into());
    }

    /// Whether no errors were recorded
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of errors recorded
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// The recorded errors, in the order they occurred
    pub fn errors(&self) -> &[CacheError] {
        &self.errors
    }

    pub(crate) fn into_result(self) -> Result<(), Self> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for RestoreErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred restoring the cache", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n\t* {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for RestoreErrors {}
