//! Reloading the cache from persistent storage

use lessor_api::Secret;
use lessor_clock::{DurationSecs, UnixTime};

use super::LeaseCache;
use crate::{
    entry::{CapabilitiesEntry, Entry, EntryType, RenewCtx},
    error::{CacheError, MemDbError, RestoreErrors},
    memdb::IndexName,
    persist::PersistentStorage,
};

fn parse_secret(entry: &Entry) -> Result<Secret, CacheError> {
    let response = entry.response.as_ref().ok_or_else(|| CacheError::MissingResponse {
        id: entry.id.clone(),
    })?;

    Secret::parse(&response.body)?.ok_or_else(|| CacheError::NotRenewable {
        id: entry.id.clone(),
    })
}

fn lifetime(entry: &Entry, secret: &Secret) -> Result<DurationSecs, CacheError> {
    if !secret.lease_id.is_empty() {
        Ok(DurationSecs(secret.lease_duration))
    } else if let Some(auth) = &secret.auth {
        Ok(DurationSecs(auth.lease_duration))
    } else {
        Err(CacheError::NotRenewable {
            id: entry.id.clone(),
        })
    }
}

impl LeaseCache {
    /// Loads the cache from `source`
    ///
    /// Auto-auth tokens are loaded first, then leases and proxied tokens in
    /// the order they were created, each resuming renewal under its parent.
    /// Leases that expired while the proxy was down are dropped from
    /// `source`. Static secrets and token capabilities are loaded when
    /// static-secret caching is enabled.
    ///
    /// Entries are loaded into memory only. A failure restoring one entry
    /// skips that entry; all failures are reported together.
    #[tracing::instrument(level = "debug", skip_all, fields(path = %source.path().display()))]
    pub fn restore(&self, source: &PersistentStorage) -> Result<(), RestoreErrors> {
        let mut errors = RestoreErrors::default();

        self.restore_tokens(source, &mut errors);
        self.restore_leases(source, &mut errors);

        if self.inner.cache_static_secrets {
            self.restore_static_secrets(source, &mut errors);
            self.restore_capabilities(source, &mut errors);
        }

        tracing::info!(
            entries = self.inner.store.db.len(),
            errors = errors.len(),
            "restored cache from persistent storage"
        );
        errors.into_result()
    }

    fn restore_tokens(&self, source: &PersistentStorage, errors: &mut RestoreErrors) {
        let records = match source.get_by_type(EntryType::Token) {
            Ok(records) => records,
            Err(err) => return errors.push(err),
        };

        for record in records {
            let mut entry = match Entry::deserialize(&record) {
                Ok(entry) => entry,
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            };

            entry.renew_ctx = Some(self.base_ctx().derive());
            let id = entry.id.clone();
            match self.inner.store.db.set(entry) {
                Ok(()) => tracing::trace!(%id, "restored token"),
                Err(err) => errors.push(err),
            }
        }
    }

    fn restore_leases(&self, source: &PersistentStorage, errors: &mut RestoreErrors) {
        let records = match source.get_by_type(EntryType::Lease) {
            Ok(records) => records,
            Err(err) => return errors.push(err),
        };

        let now = self.now();
        for record in records {
            let result = Entry::deserialize(&record)
                .map_err(CacheError::from)
                .and_then(|entry| self.restore_lease(source, entry, now));
            if let Err(err) = result {
                errors.push(err);
            }
        }
    }

    fn restore_lease(
        &self,
        source: &PersistentStorage,
        mut entry: Entry,
        now: UnixTime,
    ) -> Result<(), CacheError> {
        tracing::trace!(id = %entry.id, path = %entry.request_path, "restoring lease");

        let secret = parse_secret(&entry)?;
        if now.saturating_since(entry.last_renewed) > lifetime(&entry, &secret)? {
            tracing::debug!(id = %entry.id, path = %entry.request_path, "dropping expired lease");
            source.delete(&entry.id, EntryType::Lease)?;
            return Ok(());
        }

        let ctx = self.restored_ctx(&entry, &secret)?;
        entry.renew_ctx = Some(ctx);
        self.inner.store.db.set(entry.clone())?;
        self.start_renewing(&entry, secret);

        tracing::trace!(id = %entry.id, path = %entry.request_path, "restored lease");
        Ok(())
    }

    fn restored_ctx(&self, entry: &Entry, secret: &Secret) -> Result<RenewCtx, CacheError> {
        let orphan = match &secret.auth {
            _ if !secret.lease_id.is_empty() => false,
            Some(auth) => auth.orphan,
            None => {
                return Err(CacheError::NotRenewable {
                    id: entry.id.clone(),
                })
            }
        };

        if orphan {
            return Ok(self.base_ctx().derive());
        }

        let parent = match self.inner.store.db.get(IndexName::Token, &[&entry.request_token]) {
            Ok(parent) => parent,
            Err(MemDbError::NotFound) => {
                return Err(CacheError::ParentNotFound {
                    id: entry.id.clone(),
                })
            }
            Err(err) => return Err(err.into()),
        };

        parent.renew_ctx.as_ref().map(RenewCtx::derive).ok_or_else(|| {
            CacheError::ParentNotFound {
                id: entry.id.clone(),
            }
        })
    }

    fn restore_static_secrets(&self, source: &PersistentStorage, errors: &mut RestoreErrors) {
        let records = match source.get_by_type(EntryType::StaticSecret) {
            Ok(records) => records,
            Err(err) => return errors.push(err),
        };

        for record in records {
            let result = Entry::deserialize(&record)
                .map_err(CacheError::from)
                .and_then(|entry| Ok(self.inner.store.db.set(entry)?));
            if let Err(err) = result {
                errors.push(err);
            }
        }
    }

    fn restore_capabilities(&self, source: &PersistentStorage, errors: &mut RestoreErrors) {
        let records = match source.get_by_type(EntryType::TokenCapabilities) {
            Ok(records) => records,
            Err(err) => return errors.push(err),
        };

        for record in records {
            let entry = match CapabilitiesEntry::deserialize(&record) {
                Ok(entry) => entry,
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            };

            if let Err(err) = self.inner.store.db.set_capabilities(entry.clone()) {
                errors.push(err);
                continue;
            }

            if let Some(capabilities) = &self.inner.capabilities {
                capabilities.start_renewing(&entry);
            }
        }
    }
}
