//! The in-memory multi-index store
//!
//! Entries are held once, keyed by ID, and referenced from a set of
//! secondary indices. Secondary indices are ordered so that prefix queries
//! over them are range scans. Readers share a read lock and never block each
//! other; writers serialize on the write lock and keep every index consistent
//! with the primary table.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    str::FromStr,
    sync::Arc,
};

use parking_lot::RwLock;

use crate::{
    entry::{CapabilitiesEntry, Entry},
    error::MemDbError,
};

/// The indices an entry can be looked up by
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexName {
    /// The entry ID; unique
    Id,
    /// Namespace and request path together
    RequestPath,
    /// The minted token; unique
    Token,
    /// The minted token's accessor; unique
    TokenAccessor,
    /// The token the minted token was created from
    TokenParent,
    /// The lease; unique
    Lease,
    /// The token the lease was created with
    LeaseToken,
}

impl IndexName {
    const SECONDARY: [IndexName; 6] = [
        Self::RequestPath,
        Self::Token,
        Self::TokenAccessor,
        Self::TokenParent,
        Self::Lease,
        Self::LeaseToken,
    ];

    const UNIQUE: [IndexName; 3] = [Self::Token, Self::TokenAccessor, Self::Lease];

    /// The name of the index
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::RequestPath => "request_path",
            Self::Token => "token",
            Self::TokenAccessor => "token_accessor",
            Self::TokenParent => "token_parent",
            Self::Lease => "lease",
            Self::LeaseToken => "lease_token",
        }
    }

    fn arity(self) -> usize {
        match self {
            Self::RequestPath => 2,
            _ => 1,
        }
    }

    fn key_of(self, entry: &Entry) -> Option<String> {
        let value = match self {
            Self::Id => &entry.id,
            Self::RequestPath => return Some(compound(&entry.namespace, &entry.request_path)),
            Self::Token => &entry.token,
            Self::TokenAccessor => &entry.token_accessor,
            Self::TokenParent => &entry.token_parent,
            Self::Lease => &entry.lease,
            Self::LeaseToken => &entry.lease_token,
        };

        Some(value.clone()).filter(|v| !v.is_empty())
    }

    fn key_for(self, values: &[&str]) -> Result<String, MemDbError> {
        if values.len() != self.arity() {
            return Err(MemDbError::InvalidArguments {
                index: self.as_str(),
                expected: self.arity(),
                got: values.len(),
            });
        }

        Ok(match self {
            Self::RequestPath => compound(values[0], values[1]),
            _ => values[0].to_owned(),
        })
    }
}

impl fmt::Display for IndexName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexName {
    type Err = MemDbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        std::iter::once(Self::Id)
            .chain(Self::SECONDARY)
            .find(|i| i.as_str() == s)
            .ok_or_else(|| MemDbError::InvalidIndex(s.to_owned()))
    }
}

fn compound(namespace: &str, path: &str) -> String {
    format!("{}\u{0}{}", namespace, path)
}

#[derive(Default)]
struct Tables {
    entries: HashMap<String, Arc<Entry>>,
    secondary: HashMap<IndexName, BTreeSet<(String, String)>>,
    capabilities: HashMap<String, CapabilitiesEntry>,
}

impl Tables {
    fn find(&self, index: IndexName, key: &str) -> Option<&Arc<Entry>> {
        if index == IndexName::Id {
            return self.entries.get(key);
        }

        self.secondary
            .get(&index)?
            .range((key.to_owned(), String::new())..)
            .next()
            .filter(|(k, _)| k == key)
            .and_then(|(_, id)| self.entries.get(id))
    }

    fn scan<'a>(
        &'a self,
        index: IndexName,
        key: &'a str,
        exact: bool,
    ) -> Box<dyn Iterator<Item = &'a Arc<Entry>> + 'a> {
        if index == IndexName::Id {
            let mut ids: Vec<_> = self
                .entries
                .iter()
                .filter(move |(id, _)| if exact { *id == key } else { id.starts_with(key) })
                .map(|(_, e)| e)
                .collect();
            ids.sort_by(|a, b| a.id.cmp(&b.id));
            return Box::new(ids.into_iter());
        }

        let Some(set) = self.secondary.get(&index) else {
            return Box::new(std::iter::empty());
        };

        Box::new(
            set.range((key.to_owned(), String::new())..)
                .take_while(move |(k, _)| if exact { k == key } else { k.starts_with(key) })
                .filter_map(|(_, id)| self.entries.get(id)),
        )
    }

    /// The first unique index whose value `entry` shares with another entry
    fn conflict(&self, entry: &Entry) -> Option<IndexName> {
        IndexName::UNIQUE.into_iter().find(|index| {
            index
                .key_of(entry)
                .and_then(|key| self.find(*index, &key))
                .map_or(false, |held| held.id != entry.id)
        })
    }

    fn insert(&mut self, entry: Entry) {
        self.remove(&entry.id);
        for index in IndexName::SECONDARY {
            if let Some(key) = index.key_of(&entry) {
                self.secondary
                    .entry(index)
                    .or_default()
                    .insert((key, entry.id.clone()));
            }
        }
        self.entries.insert(entry.id.clone(), Arc::new(entry));
    }

    fn remove(&mut self, id: &str) -> Option<Arc<Entry>> {
        let old = self.entries.remove(id)?;
        for index in IndexName::SECONDARY {
            if let (Some(key), Some(set)) = (index.key_of(&old), self.secondary.get_mut(&index)) {
                set.remove(&(key, old.id.clone()));
            }
        }
        Some(old)
    }
}

/// A transactional, multi-indexed table of cache entries
///
/// Clones share the same tables.
#[derive(Clone, Default)]
pub struct MemDb {
    tables: Arc<RwLock<Tables>>,
}

impl fmt::Debug for MemDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables = self.tables.read();
        f.debug_struct("MemDb")
            .field("entries", &tables.entries.len())
            .field("capabilities", &tables.capabilities.len())
            .finish()
    }
}

impl MemDb {
    /// Constructs an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a single entry
    pub fn get(&self, index: IndexName, values: &[&str]) -> Result<Arc<Entry>, MemDbError> {
        let key = index.key_for(values)?;
        self.tables
            .read()
            .find(index, &key)
            .cloned()
            .ok_or(MemDbError::NotFound)
    }

    /// Every entry whose indexed value begins with `values`
    ///
    /// For [`IndexName::RequestPath`], the namespace must match exactly and
    /// the path is matched by prefix.
    pub fn get_by_prefix(
        &self,
        index: IndexName,
        values: &[&str],
    ) -> Result<Vec<Arc<Entry>>, MemDbError> {
        let key = index.key_for(values)?;
        let tables = self.tables.read();
        let found = tables.scan(index, &key, false).cloned().collect();
        Ok(found)
    }

    /// Every entry whose indexed value equals `values`
    pub fn get_all(&self, index: IndexName, values: &[&str]) -> Result<Vec<Arc<Entry>>, MemDbError> {
        let key = index.key_for(values)?;
        let tables = self.tables.read();
        let found = tables.scan(index, &key, true).cloned().collect();
        Ok(found)
    }

    /// Inserts or replaces an entry
    ///
    /// An entry whose token, token accessor or lease is already held by an
    /// entry with a different ID is rejected.
    pub fn set(&self, entry: Entry) -> Result<(), MemDbError> {
        if entry.id.is_empty() {
            return Err(MemDbError::MissingId);
        }

        let mut tables = self.tables.write();
        if let Some(index) = tables.conflict(&entry) {
            return Err(MemDbError::Conflict(index.as_str()));
        }

        tracing::trace!(id = %entry.id, kind = %entry.kind, "storing cache entry");
        tables.insert(entry);
        Ok(())
    }

    /// Removes the entry matching the lookup, if any
    pub fn evict(&self, index: IndexName, values: &[&str]) -> Result<Option<Arc<Entry>>, MemDbError> {
        let key = index.key_for(values)?;
        let mut tables = self.tables.write();
        let Some(id) = tables.find(index, &key).map(|e| e.id.clone()) else {
            return Ok(None);
        };

        tracing::trace!(%id, "evicting cache entry");
        Ok(tables.remove(&id))
    }

    /// Empties both tables
    ///
    /// Entries already handed out remain valid; later lookups see nothing.
    pub fn flush(&self) {
        *self.tables.write() = Tables::default();
    }

    /// Number of entries in the primary table
    pub fn len(&self) -> usize {
        self.tables.read().entries.len()
    }

    /// Whether the primary table is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up the capabilities recorded under `id`
    pub fn get_capabilities(&self, id: &str) -> Result<CapabilitiesEntry, MemDbError> {
        self.tables
            .read()
            .capabilities
            .get(id)
            .cloned()
            .ok_or(MemDbError::NotFound)
    }

    /// Inserts or replaces a capabilities entry
    pub fn set_capabilities(&self, entry: CapabilitiesEntry) -> Result<(), MemDbError> {
        if entry.id.is_empty() {
            return Err(MemDbError::MissingId);
        }

        self.tables
            .write()
            .capabilities
            .insert(entry.id.clone(), entry);
        Ok(())
    }

    /// Removes the capabilities entry `id`, if any
    pub fn evict_capabilities(&self, id: &str) -> Option<CapabilitiesEntry> {
        self.tables.write().capabilities.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryType;

    fn lease(id: &str, lease: &str, token: &str) -> Entry {
        Entry {
            id: id.into(),
            kind: EntryType::Lease,
            namespace: "root/".into(),
            request_path: format!("/v1/{}", lease),
            lease: lease.into(),
            lease_token: token.into(),
            ..Entry::default()
        }
    }

    fn token(id: &str, token: &str, parent: &str) -> Entry {
        Entry {
            id: id.into(),
            kind: EntryType::Lease,
            namespace: "root/".into(),
            request_path: "/v1/auth/token/create".into(),
            token: token.into(),
            token_accessor: format!("{}-accessor", token),
            token_parent: parent.into(),
            ..Entry::default()
        }
    }

    #[test]
    fn entries_are_found_by_every_index() {
        let db = MemDb::new();
        db.set(token("t1-id", "t1", "root-token")).unwrap();
        db.set(lease("l1-id", "db/creds/1", "t1")).unwrap();

        assert_eq!(db.get(IndexName::Id, &["t1-id"]).unwrap().token, "t1");
        assert_eq!(db.get(IndexName::Token, &["t1"]).unwrap().id, "t1-id");
        assert_eq!(db.get(IndexName::TokenAccessor, &["t1-accessor"]).unwrap().id, "t1-id");
        assert_eq!(db.get(IndexName::TokenParent, &["root-token"]).unwrap().id, "t1-id");
        assert_eq!(db.get(IndexName::Lease, &["db/creds/1"]).unwrap().id, "l1-id");
        assert_eq!(db.get(IndexName::LeaseToken, &["t1"]).unwrap().id, "l1-id");
        assert_eq!(
            db.get(IndexName::RequestPath, &["root/", "/v1/db/creds/1"]).unwrap().id,
            "l1-id"
        );
    }

    #[test]
    fn missing_entries_are_not_found() {
        let db = MemDb::new();

        assert!(matches!(
            db.get(IndexName::Token, &["nope"]),
            Err(MemDbError::NotFound)
        ));
    }

    #[test]
    fn wrong_arity_is_a_caller_error() {
        let db = MemDb::new();

        assert!(matches!(
            db.get(IndexName::RequestPath, &["root/"]),
            Err(MemDbError::InvalidArguments { expected: 2, got: 1, .. })
        ));
    }

    #[test]
    fn unknown_index_names_are_rejected() {
        assert!(matches!(
            "tokens".parse::<IndexName>(),
            Err(MemDbError::InvalidIndex(_))
        ));
        assert_eq!("lease_token".parse::<IndexName>().unwrap(), IndexName::LeaseToken);
    }

    #[test]
    fn entries_without_ids_are_rejected() {
        let db = MemDb::new();

        assert!(matches!(db.set(Entry::default()), Err(MemDbError::MissingId)));
    }

    #[test]
    fn replacing_an_entry_reindexes_it() {
        let db = MemDb::new();
        db.set(token("t2-id", "t2", "t1")).unwrap();

        let mut orphaned = (*db.get(IndexName::Id, &["t2-id"]).unwrap()).clone();
        orphaned.token_parent.clear();
        db.set(orphaned).unwrap();

        assert!(db.get_all(IndexName::TokenParent, &["t1"]).unwrap().is_empty());
        assert_eq!(db.len(), 1);
    }

    mod when_a_unique_value_is_taken {
        use super::*;

        #[test]
        fn a_second_entry_with_the_same_token_is_rejected() {
            let db = MemDb::new();
            db.set(token("t1-id", "t1", "")).unwrap();

            let mut other = token("other-id", "t1", "");
            other.token_accessor = "fresh-accessor".into();

            assert!(matches!(db.set(other), Err(MemDbError::Conflict("token"))));
            assert_eq!(db.len(), 1);
            assert_eq!(db.get(IndexName::Token, &["t1"]).unwrap().id, "t1-id");
        }

        #[test]
        fn a_second_entry_with_the_same_accessor_is_rejected() {
            let db = MemDb::new();
            db.set(token("t1-id", "t1", "")).unwrap();

            let mut other = token("other-id", "t2", "");
            other.token_accessor = "t1-accessor".into();

            assert!(matches!(db.set(other), Err(MemDbError::Conflict("token_accessor"))));
            assert!(db.get(IndexName::Token, &["t2"]).is_err());
        }

        #[test]
        fn a_second_entry_with_the_same_lease_is_rejected() {
            let db = MemDb::new();
            db.set(lease("l1-id", "db/creds/1", "t1")).unwrap();

            assert!(matches!(
                db.set(lease("l2-id", "db/creds/1", "t2")),
                Err(MemDbError::Conflict("lease"))
            ));
            assert!(db.get_all(IndexName::LeaseToken, &["t2"]).unwrap().is_empty());
        }

        #[test]
        fn the_holder_may_replace_itself() {
            let db = MemDb::new();
            db.set(lease("l1-id", "db/creds/1", "t1")).unwrap();

            db.set(lease("l1-id", "db/creds/1", "t9")).unwrap();

            assert_eq!(db.get(IndexName::Lease, &["db/creds/1"]).unwrap().lease_token, "t9");
        }

        #[test]
        fn shared_non_unique_values_are_allowed() {
            let db = MemDb::new();
            db.set(lease("a", "db/creds/1", "t1")).unwrap();
            db.set(lease("b", "db/creds/2", "t1")).unwrap();

            assert_eq!(db.get_all(IndexName::LeaseToken, &["t1"]).unwrap().len(), 2);
        }
    }

    #[test]
    fn evicting_unknown_entries_is_not_an_error() {
        let db = MemDb::new();

        assert!(db.evict(IndexName::Lease, &["nope"]).unwrap().is_none());
    }

    #[test]
    fn evicting_clears_secondary_indices() {
        let db = MemDb::new();
        db.set(lease("l1-id", "db/creds/1", "t1")).unwrap();

        let evicted = db.evict(IndexName::Lease, &["db/creds/1"]).unwrap();

        assert_eq!(evicted.unwrap().id, "l1-id");
        assert!(db.get(IndexName::LeaseToken, &["t1"]).is_err());
        assert!(db.is_empty());
    }

    mod when_scanning {
        use super::*;

        fn db() -> MemDb {
            let db = MemDb::new();
            db.set(lease("a", "db/creds/role/1", "t1")).unwrap();
            db.set(lease("b", "db/creds/role/2", "t1")).unwrap();
            db.set(lease("c", "db/creds/other/1", "t10")).unwrap();
            db
        }

        #[test]
        fn prefix_scans_match_leading_values() {
            let found = db().get_by_prefix(IndexName::Lease, &["db/creds/role/"]).unwrap();

            let ids: Vec<_> = found.iter().map(|e| e.id.as_str()).collect();
            assert_eq!(ids, ["a", "b"]);
        }

        #[test]
        fn exact_scans_do_not_match_longer_values() {
            let found = db().get_all(IndexName::LeaseToken, &["t1"]).unwrap();

            let ids: Vec<_> = found.iter().map(|e| e.id.as_str()).collect();
            assert_eq!(ids, ["a", "b"]);
        }

        #[test]
        fn request_path_scans_require_the_namespace() {
            let db = db();

            assert_eq!(
                db.get_by_prefix(IndexName::RequestPath, &["root/", "/v1/db/creds"])
                    .unwrap()
                    .len(),
                3
            );
            assert!(db
                .get_by_prefix(IndexName::RequestPath, &["ns1/", "/v1/db/creds"])
                .unwrap()
                .is_empty());
        }

        #[test]
        fn id_prefix_scans_return_everything() {
            assert_eq!(db().get_by_prefix(IndexName::Id, &[""]).unwrap().len(), 3);
        }
    }

    #[test]
    fn flush_empties_both_tables_but_not_outstanding_handles() {
        let db = MemDb::new();
        db.set(lease("l1-id", "db/creds/1", "t1")).unwrap();
        db.set_capabilities(CapabilitiesEntry {
            id: "cap".into(),
            token: "t1".into(),
            readable_paths: ["secret/foo".to_owned()].into(),
        })
        .unwrap();
        let held = db.get(IndexName::Id, &["l1-id"]).unwrap();

        db.flush();

        assert!(db.get_by_prefix(IndexName::Id, &[""]).unwrap().is_empty());
        assert!(db.get_capabilities("cap").is_err());
        assert_eq!(held.lease, "db/creds/1");
    }
}
