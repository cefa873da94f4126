//! The in-memory store with its optional persistent mirror

use std::{
    collections::{hash_map::DefaultHasher, BTreeSet},
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use parking_lot::{Mutex, MutexGuard};
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::{
    entry::{CapabilitiesEntry, Entry, EntryType, RenewCtx},
    error::{CacheError, MemDbError},
    memdb::{IndexName, MemDb},
    persist::PersistentStorage,
};

const LOCK_STRIPES: usize = 256;

/// A fixed set of locks shared by all IDs hashing to the same stripe
struct IdLocks {
    stripes: Vec<Mutex<()>>,
}

impl IdLocks {
    fn new() -> Self {
        Self {
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn lock(&self, id: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let stripe = (hasher.finish() % LOCK_STRIPES as u64) as usize;
        self.stripes[stripe].lock()
    }
}

/// Writes to the in-memory store, mirrored to disk when persistence is on
///
/// Mutations of a single entry are serialized through [`Store::lock`]. At
/// most one ID lock may be held at a time.
#[derive(Clone)]
pub(crate) struct Store {
    pub(crate) db: MemDb,
    pub(crate) storage: Option<Arc<PersistentStorage>>,
    locks: Arc<IdLocks>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("db", &self.db)
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

impl Store {
    pub(crate) fn new(storage: Option<Arc<PersistentStorage>>) -> Self {
        Self {
            db: MemDb::new(),
            storage,
            locks: Arc::new(IdLocks::new()),
        }
    }

    pub(crate) fn lock(&self, id: &str) -> MutexGuard<'_, ()> {
        self.locks.lock(id)
    }

    /// Runs `f` against the disk mirror, if there is one
    ///
    /// SQLite calls block. On a multi-threaded runtime the calling worker
    /// hands its other tasks to the rest of the pool while `f` runs.
    pub(crate) fn on_disk(
        &self,
        f: impl FnOnce(&PersistentStorage) -> Result<(), CacheError>,
    ) -> Result<(), CacheError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };

        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| f(storage))
            }
            _ => f(storage),
        }
    }

    /// Stores an entry; the caller holds its ID lock
    ///
    /// Entries the in-memory store rejects never reach the disk.
    pub(crate) fn set(&self, entry: Entry) -> Result<(), CacheError> {
        let mirrored = match &self.storage {
            Some(_) => Some((entry.id.clone(), entry.kind, entry.serialize()?)),
            None => None,
        };
        self.db.set(entry)?;

        if let Some((id, kind, bytes)) = mirrored {
            self.on_disk(|storage| Ok(storage.set(&id, &bytes, kind)?))?;
        }
        Ok(())
    }

    /// Removes an entry; the caller holds its ID lock
    pub(crate) fn evict(&self, entry: &Entry) -> Result<(), CacheError> {
        self.db.evict(IndexName::Id, &[&entry.id])?;
        self.on_disk(|storage| Ok(storage.delete(&entry.id, entry.kind)?))
    }

    /// Removes the entry `id` if it still carries the renewal context `ctx`
    ///
    /// An entry replaced since `ctx` was handed out is left alone.
    pub(crate) fn evict_if_current(&self, id: &str, ctx: Option<&RenewCtx>) -> Result<bool, CacheError> {
        let _lock = self.lock(id);
        let current = match self.db.get(IndexName::Id, &[id]) {
            Ok(entry) => entry,
            Err(MemDbError::NotFound) => return Ok(false),
            Err(err) => return Err(err.into()),
        };

        let same = match (current.renew_ctx.as_ref(), ctx) {
            (Some(a), Some(b)) => a.same(b),
            (None, None) => true,
            _ => false,
        };
        if !same {
            return Ok(false);
        }

        tracing::debug!(%id, kind = %current.kind, path = %current.request_path, "evicting entry from cache");
        self.evict(&current)?;
        Ok(true)
    }

    /// Applies `f` to the entry `id` and stores the result
    ///
    /// Returns `false` if there is no such entry.
    pub(crate) fn modify(&self, id: &str, f: impl FnOnce(&mut Entry)) -> Result<bool, CacheError> {
        let _lock = self.lock(id);
        let mut entry = match self.db.get(IndexName::Id, &[id]) {
            Ok(entry) => (*entry).clone(),
            Err(MemDbError::NotFound) => return Ok(false),
            Err(err) => return Err(err.into()),
        };

        f(&mut entry);
        self.set(entry)?;
        Ok(true)
    }

    /// Stores a capabilities entry; the caller holds its ID lock
    pub(crate) fn set_capabilities(&self, entry: CapabilitiesEntry) -> Result<(), CacheError> {
        if self.storage.is_some() {
            let bytes = entry.serialize()?;
            self.on_disk(|storage| Ok(storage.set(&entry.id, &bytes, EntryType::TokenCapabilities)?))?;
        }
        self.db.set_capabilities(entry)?;
        Ok(())
    }

    /// Removes a capabilities entry; the caller holds its ID lock
    pub(crate) fn evict_capabilities(&self, id: &str) -> Result<(), CacheError> {
        self.db.evict_capabilities(id);
        self.on_disk(|storage| Ok(storage.delete(id, EntryType::TokenCapabilities)?))
    }

    /// Drops `paths` from the readable paths of the capabilities entry `id`
    ///
    /// Paths recorded since the caller last read the entry are kept. An
    /// entry left with no readable paths is evicted. Returns whether the
    /// entry is still cached.
    pub(crate) fn drop_readable_paths(&self, id: &str, paths: &BTreeSet<String>) -> Result<bool, CacheError> {
        let _lock = self.lock(id);
        let mut entry = match self.db.get_capabilities(id) {
            Ok(entry) => entry,
            Err(MemDbError::NotFound) => return Ok(false),
            Err(err) => return Err(err.into()),
        };

        let before = entry.readable_paths.len();
        entry.readable_paths.retain(|path| !paths.contains(path));

        if entry.readable_paths.is_empty() {
            self.evict_capabilities(id)?;
            return Ok(false);
        }
        if entry.readable_paths.len() != before {
            self.set_capabilities(entry)?;
        }
        Ok(true)
    }

    /// Empties memory and disk
    pub(crate) fn flush(&self) -> Result<(), CacheError> {
        self.db.flush();
        self.on_disk(|storage| Ok(storage.clear()?))
    }
}
