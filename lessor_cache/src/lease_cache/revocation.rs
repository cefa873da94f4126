//! Cache cleanup after revocations observed through the proxy
//!
//! A successful revocation is answered with `204 No Content`. When the proxy
//! sees one on a revocation endpoint, the revoked token or lease is removed
//! from the cache along with everything derived from it before the response
//! is returned, so a caller that revokes and then reads sees a miss.

use lessor_api::namespace;
use serde_json::Value;

use super::LeaseCache;
use crate::{entry::Entry, error::CacheError, memdb::IndexName, proxy::SendRequest};

const TOKEN_REVOKE: &str = "/v1/auth/token/revoke";
const TOKEN_REVOKE_SELF: &str = "/v1/auth/token/revoke-self";
const TOKEN_REVOKE_ACCESSOR: &str = "/v1/auth/token/revoke-accessor";
const TOKEN_REVOKE_ORPHAN: &str = "/v1/auth/token/revoke-orphan";
const LEASE_REVOKE: &str = "/v1/sys/leases/revoke";
const LEASE_REVOKE_FORCE: &str = "/v1/sys/leases/revoke-force";
const LEASE_REVOKE_PREFIX: &str = "/v1/sys/leases/revoke-prefix";

/// Revocation endpoints, checked in order
const REVOCATION_PATHS: [&str; 7] = [
    TOKEN_REVOKE,
    TOKEN_REVOKE_SELF,
    TOKEN_REVOKE_ACCESSOR,
    TOKEN_REVOKE_ORPHAN,
    LEASE_REVOKE,
    LEASE_REVOKE_FORCE,
    LEASE_REVOKE_PREFIX,
];

/// Splits a namespace embedded in a revocation path from the path itself
///
/// Returns the effective namespace and the path with the namespace removed.
/// A namespace in the path is appended to the namespace header, or replaces
/// the root namespace when there is no header. Paths that are not
/// revocations are returned unchanged, since there is no telling where a
/// namespace would end.
pub(crate) fn namespace_and_revocation_path(req: &SendRequest) -> (String, String) {
    let mut ns = match req.namespace() {
        Some(header) => namespace::canonicalize_or_root(header),
        None => namespace::ROOT.to_owned(),
    };

    let unversioned = req.path.strip_prefix("/v1").unwrap_or(&req.path);

    for candidate in REVOCATION_PATHS {
        let candidate = &candidate["/v1".len()..];
        let Some(at) = unversioned.find(candidate) else {
            continue;
        };

        if at == 0 {
            break;
        }

        let in_path = namespace::canonicalize(&unversioned[..at]);
        if ns == namespace::ROOT {
            ns = in_path;
        } else {
            ns.push_str(&in_path);
        }

        return (ns, format!("/v1{}", &unversioned[at..]));
    }

    (ns, format!("/v1{}", unversioned))
}

fn body_field(body: &[u8], field: &'static str) -> Result<String, CacheError> {
    let body: Value = serde_json::from_slice(body)?;
    body.get(field)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(CacheError::MissingField(field))
}

impl LeaseCache {
    /// Cleans up after a revocation, returning whether `req` was one
    pub(super) fn handle_revocation(&self, req: &SendRequest) -> Result<bool, CacheError> {
        let (_, path) = namespace_and_revocation_path(req);

        match path.as_str() {
            TOKEN_REVOKE => {
                let token = body_field(&req.body, "token")?;
                self.cancel_matching(IndexName::Token, &token)?;
            }
            TOKEN_REVOKE_SELF => {
                self.cancel_matching(IndexName::Token, &req.token)?;
            }
            TOKEN_REVOKE_ACCESSOR => {
                let accessor = body_field(&req.body, "accessor")?;
                self.cancel_matching(IndexName::TokenAccessor, &accessor)?;
            }
            TOKEN_REVOKE_ORPHAN => {
                let token = body_field(&req.body, "token")?;
                self.revoke_orphan(&token)?;
            }
            LEASE_REVOKE => {
                let lease = body_field(&req.body, "lease_id")?;
                self.cancel_matching(IndexName::Lease, &lease)?;
            }
            p => {
                let prefix = p
                    .strip_prefix(LEASE_REVOKE_FORCE)
                    .or_else(|| p.strip_prefix(LEASE_REVOKE_PREFIX));
                match prefix {
                    Some(prefix) => self.revoke_lease_prefix(prefix, &req.token)?,
                    None => return Ok(false),
                }
            }
        }

        tracing::debug!(%path, "evicted cache entries after revocation");
        Ok(true)
    }

    /// Cancels the entry found by `value` on `index`, if there is one
    pub(super) fn cancel_matching(&self, index: IndexName, value: &str) -> Result<(), CacheError> {
        match self.inner.store.db.get(index, &[value]) {
            Ok(entry) => self.cancel_entry(&entry),
            Err(crate::error::MemDbError::NotFound) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Cancels an entry's renewal and evicts it with everything derived from it
    ///
    /// Cancelling stops the background renewals of the entry and its
    /// descendants. The entries themselves are evicted here, so the cache no
    /// longer holds them when this returns.
    pub(super) fn cancel_entry(&self, entry: &Entry) -> Result<(), CacheError> {
        if let Some(ctx) = &entry.renew_ctx {
            ctx.cancel();
        }

        let db = &self.inner.store.db;
        let mut pending = vec![entry.clone()];
        while let Some(next) = pending.pop() {
            if !next.token.is_empty() {
                for index in [IndexName::LeaseToken, IndexName::TokenParent] {
                    pending.extend(db.get_all(index, &[&next.token])?.iter().map(|e| (**e).clone()));
                }
            }

            self.inner
                .store
                .evict_if_current(&next.id, next.renew_ctx.as_ref())?;
        }

        Ok(())
    }

    /// Revokes a token without revoking its children
    ///
    /// The token's leases are cancelled. The token's own renewal is closed
    /// rather than cancelled, which leaves child tokens running; the
    /// children are then detached from it.
    fn revoke_orphan(&self, token: &str) -> Result<(), CacheError> {
        let db = &self.inner.store.db;
        for lease in db.get_all(IndexName::LeaseToken, &[token])? {
            self.cancel_entry(&lease)?;
        }

        let entry = match db.get(IndexName::Token, &[token]) {
            Ok(entry) => entry,
            Err(crate::error::MemDbError::NotFound) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        if let Some(ctx) = &entry.renew_ctx {
            ctx.close();
        }
        self.inner
            .store
            .evict_if_current(&entry.id, entry.renew_ctx.as_ref())?;

        for child in db.get_all(IndexName::TokenParent, &[token])? {
            self.inner.store.modify(&child.id, |child| child.token_parent.clear())?;
        }

        Ok(())
    }

    /// Cancels every lease under `prefix` issued in the caller's namespace
    fn revoke_lease_prefix(&self, prefix: &str, token: &str) -> Result<(), CacheError> {
        let prefix = prefix.trim_start_matches('/');
        let (_, token_ns) = namespace::split_id_from_string(token);

        for entry in self.inner.store.db.get_by_prefix(IndexName::Lease, &[prefix])? {
            let (_, lease_ns) = namespace::split_id_from_string(&entry.lease);
            if lease_ns == token_ns {
                self.cancel_entry(&entry)?;
            }
        }

        Ok(())
    }
}
