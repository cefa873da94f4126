//! The lease-aware response cache
//!
//! [`LeaseCache`] sits in front of another [`Proxier`] and caches the
//! responses that are worth keeping:
//!
//! * leases, when the token that created them is itself cached;
//! * tokens minted through the proxy, when their parent is cached or they
//!   are orphans;
//! * KV secrets, shared between every token seen to read them, when
//!   static-secret caching is enabled.
//!
//! Every cached lease and token is kept alive by a background renewal tied
//! to a [`RenewCtx`] derived from its parent's. Revoking a token cancels its
//! context, which stops the renewal of everything created under it. Entries
//! leave the cache when their renewal ends, when a revocation is observed,
//! or when a cache-clear request selects them.
//!
//! Concurrent identical requests are coalesced: while one is answered by the
//! upstream, the others wait and are then served from the cache.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use http::{Method, StatusCode};
use lessor_api::{
    namespace, Client, Secret, UpstreamResponse, DEFAULT_USER_AGENT, TOKEN_HEADER,
};
use lessor_clock::{Clock, System, UnixTime};
use lessor_tokens::{LifetimeWatcher, WatcherEvent};
use metrics::counter;
use parking_lot::RwLock;
use rand::{distributions::Alphanumeric, Rng};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::{
    capabilities::{CapabilityManager, CapabilityRefreshConfig},
    entry::{CapabilitiesEntry, Entry, EntryType, RenewCtx, StoredResponse},
    error::{CacheError, MemDbError, ProxyError},
    fingerprint,
    memdb::{IndexName, MemDb},
    persist::PersistentStorage,
    proxy::{CacheMeta, Proxier, SendRequest, SendResponse},
    store::Store,
};

mod inflight;
mod restore;
mod revocation;

use inflight::Inflight;

/// Configures a [`LeaseCache`]
pub struct LeaseCacheConfig {
    /// Client used for renewals; its token is replaced per entry
    pub client: Client,
    /// Answers requests the cache cannot
    pub proxier: Arc<dyn Proxier>,
    /// Where cached entries are persisted, if anywhere
    pub storage: Option<Arc<PersistentStorage>>,
    /// Cancelled when the process shuts down
    pub shutdown: CancellationToken,
    /// Cache KV secrets
    pub cache_static_secrets: bool,
    /// Cache leases and tokens
    pub cache_dynamic_secrets: bool,
    /// User agent sent with renewals
    pub user_agent: String,
    /// Re-checking of static-secret read access
    pub capability_refresh: CapabilityRefreshConfig,
    /// Source of the current time
    pub clock: Arc<dyn Clock + Send + Sync>,
}

impl LeaseCacheConfig {
    /// A configuration caching dynamic secrets only, without persistence
    pub fn new(client: Client, proxier: Arc<dyn Proxier>) -> Self {
        Self {
            client,
            proxier,
            storage: None,
            shutdown: CancellationToken::new(),
            cache_static_secrets: false,
            cache_dynamic_secrets: true,
            user_agent: format!("{}; lease cache", DEFAULT_USER_AGENT),
            capability_refresh: CapabilityRefreshConfig::default(),
            clock: Arc::new(System),
        }
    }
}

impl fmt::Debug for LeaseCacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseCacheConfig")
            .field("client", &self.client)
            .field("storage", &self.storage)
            .field("cache_static_secrets", &self.cache_static_secrets)
            .field("cache_dynamic_secrets", &self.cache_dynamic_secrets)
            .field("user_agent", &self.user_agent)
            .field("capability_refresh", &self.capability_refresh)
            .finish_non_exhaustive()
    }
}

/// A request to remove entries from the cache
///
/// `kind` selects what `value` is matched against: `request_path`, `token`,
/// `token_accessor` or `lease`. The kind `all` empties the cache and takes
/// no value.
#[derive(Clone, Default, Deserialize)]
pub struct CacheClearInput {
    /// What to match
    #[serde(rename = "type")]
    pub kind: String,
    /// The value to match
    #[serde(default)]
    pub value: Option<String>,
    /// Namespace of a `request_path` match; the root namespace if absent
    #[serde(default)]
    pub namespace: Option<String>,
}

impl fmt::Debug for CacheClearInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheClearInput")
            .field("kind", &self.kind)
            .field("has_value", &self.value.is_some())
            .field("namespace", &self.namespace)
            .finish()
    }
}

/// The lease-aware response cache
///
/// Cheaply cloneable; clones share the same cache.
#[derive(Clone)]
pub struct LeaseCache {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    proxier: Arc<dyn Proxier>,
    store: Store,
    base: RwLock<RenewCtx>,
    shutdown: CancellationToken,
    shutting_down: AtomicBool,
    inflight: Inflight,
    cache_static_secrets: bool,
    cache_dynamic_secrets: bool,
    capabilities: Option<CapabilityManager>,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl fmt::Debug for LeaseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseCache")
            .field("store", &self.inner.store)
            .field("cache_static_secrets", &self.inner.cache_static_secrets)
            .field("cache_dynamic_secrets", &self.inner.cache_dynamic_secrets)
            .field("shutting_down", &self.inner.shutting_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn entry_namespace(req: &SendRequest) -> String {
    req.namespace()
        .map(namespace::canonicalize_or_root)
        .unwrap_or_else(|| namespace::ROOT.to_owned())
}

fn request_headers(req: &SendRequest) -> Vec<(String, String)> {
    req.headers
        .iter()
        .filter(|(name, _)| *name != TOKEN_HEADER)
        .filter_map(|(name, value)| Some((name.as_str().to_owned(), value.to_str().ok()?.to_owned())))
        .collect()
}

fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(char::from)
        .collect()
}

/// Also files the latest version of a KV v2 secret under its version number
fn record_current_version(entry: &mut Entry, secret: &Secret) {
    if !entry.request_path.contains("/data/") {
        return;
    }

    let version = secret
        .data
        .as_ref()
        .and_then(|data| data.get("metadata"))
        .and_then(|metadata| metadata.get("version"))
        .and_then(serde_json::Value::as_u64);

    if let (Some(version), Some(response)) = (version, &entry.response) {
        tracing::trace!(path = %entry.request_path, version, "recording current version of secret");
        entry.versions.insert(version, response.clone());
    }
}

impl LeaseCache {
    /// Constructs a cache
    ///
    /// Must be called within a Tokio runtime when static-secret caching is
    /// enabled, as capability refreshes are started immediately.
    pub fn new(config: LeaseCacheConfig) -> Self {
        let mut client = config.client;
        if let Err(error) = client.set_user_agent(&config.user_agent) {
            tracing::warn!(%error, "invalid lease cache user agent; using the client default");
        }

        let store = Store::new(config.storage);
        let capabilities = config.cache_static_secrets.then(|| {
            CapabilityManager::new(client.clone(), store.clone(), config.capability_refresh)
        });

        Self {
            inner: Arc::new(Inner {
                client,
                proxier: config.proxier,
                store,
                base: RwLock::new(RenewCtx::child_of(&config.shutdown)),
                shutdown: config.shutdown,
                shutting_down: AtomicBool::new(false),
                inflight: Inflight::default(),
                cache_static_secrets: config.cache_static_secrets,
                cache_dynamic_secrets: config.cache_dynamic_secrets,
                capabilities,
                clock: config.clock,
            }),
        }
    }

    /// The in-memory store
    pub fn db(&self) -> &MemDb {
        &self.inner.store.db
    }

    /// The persistent store the cache writes through to, if any
    pub fn storage(&self) -> Option<&Arc<PersistentStorage>> {
        self.inner.store.storage.as_ref()
    }

    fn base_ctx(&self) -> RenewCtx {
        self.inner.base.read().clone()
    }

    fn now(&self) -> UnixTime {
        self.inner.clock.now()
    }

    /// Marks the process as shutting down, or not
    ///
    /// While shutting down, entries whose renewal stops are left in the
    /// cache and in persistent storage so they can be restored later, and
    /// capability refreshes are stopped.
    pub async fn set_shutting_down(&self, shutting_down: bool) {
        self.inner.shutting_down.store(shutting_down, Ordering::Release);
        if shutting_down {
            if let Some(capabilities) = &self.inner.capabilities {
                capabilities.stop().await;
            }
        }
    }

    /// Makes leases and tokens created with the auto-auth token cacheable
    ///
    /// The token gets an entry that can never be served, as its ID, path
    /// and namespace are random. Registering a cached token does nothing.
    pub fn register_auto_auth_token(&self, token: &str) -> Result<(), CacheError> {
        match self.inner.store.db.get(IndexName::Token, &[token]) {
            Ok(_) => {
                tracing::trace!("auto-auth token is already cached");
                return Ok(());
            }
            Err(MemDbError::NotFound) => {}
            Err(err) => return Err(err.into()),
        }

        let entry = Entry {
            id: random_id(),
            kind: EntryType::Token,
            namespace: random_id(),
            request_path: random_id(),
            token: token.to_owned(),
            last_renewed: self.now(),
            renew_ctx: Some(self.base_ctx().derive()),
            ..Entry::default()
        };

        {
            let _lock = self.inner.store.lock(&entry.id);
            self.inner.store.set(entry)?;
        }

        self.inner
            .store
            .on_disk(|storage| Ok(storage.set_auto_auth_token(token)?))?;

        tracing::debug!("cached auto-auth token");
        Ok(())
    }

    /// Removes the entries selected by `input`
    ///
    /// Removing a lease or token also removes everything derived from it.
    #[tracing::instrument(level = "debug", err, skip(self))]
    pub fn handle_cache_clear(&self, input: CacheClearInput) -> Result<(), CacheError> {
        let index = match input.kind.as_str() {
            "request_path" => IndexName::RequestPath,
            "token" => IndexName::Token,
            "token_accessor" => IndexName::TokenAccessor,
            "lease" => IndexName::Lease,
            "all" => {
                {
                    let mut base = self.inner.base.write();
                    base.cancel();
                    *base = RenewCtx::child_of(&self.inner.shutdown);
                }
                self.inner.store.flush()?;
                tracing::debug!("cleared the cache");
                return Ok(());
            }
            other => return Err(CacheError::InvalidClearType(other.to_owned())),
        };

        let value = input
            .value
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| CacheError::MissingClearValue(input.kind.clone()))?;

        if index != IndexName::RequestPath {
            return self.cancel_matching(index, value);
        }

        let ns = input
            .namespace
            .as_deref()
            .map(namespace::canonicalize_or_root)
            .unwrap_or_else(|| namespace::ROOT.to_owned());

        for entry in self.inner.store.db.get_by_prefix(IndexName::RequestPath, &[&ns, value])? {
            if entry.kind == EntryType::StaticSecret {
                self.inner.store.evict_if_current(&entry.id, None)?;
            } else {
                self.cancel_entry(&entry)?;
            }
        }

        Ok(())
    }

    fn hit(&self, stored: &StoredResponse) -> SendResponse {
        let age = stored
            .date()
            .map(|date| Duration::from(self.now().saturating_since(UnixTime::from(date))))
            .unwrap_or_default();

        counter!("cache.hit").increment(1);
        SendResponse {
            response: stored.to_upstream(),
            cache_meta: Some(CacheMeta { hit: true, age }),
        }
    }

    fn check_dynamic(&self, id: &str) -> Option<SendResponse> {
        let entry = self.inner.store.db.get(IndexName::Id, &[id]).ok()?;
        let response = entry.response.as_ref()?;
        tracing::debug!(path = %entry.request_path, "returning cached dynamic secret response");
        Some(self.hit(response))
    }

    fn check_static(&self, id: &str, req: &SendRequest) -> Option<SendResponse> {
        // Anything but a read may change the secret
        if req.method != Method::GET {
            match self.inner.store.evict_if_current(id, None) {
                Ok(true) => tracing::debug!(method = %req.method, path = %req.path, "evicted static secret"),
                Ok(false) => {}
                Err(error) => tracing::warn!(%error, "failed to evict static secret"),
            }
            return None;
        }

        if req.token.is_empty() {
            return None;
        }

        let entry = self.inner.store.db.get(IndexName::Id, &[id]).ok()?;
        if entry.kind != EntryType::StaticSecret || !entry.tokens.contains(&req.token) {
            return None;
        }

        let response = match fingerprint::requested_version(req) {
            0 => entry.response.as_ref()?,
            version => entry.versions.get(&version)?,
        };

        tracing::debug!(path = %entry.request_path, "returning cached static secret response");
        Some(self.hit(response))
    }

    fn cache_response(
        &self,
        req: &SendRequest,
        dynamic_id: &str,
        static_id: Option<&str>,
        resp: &UpstreamResponse,
    ) -> Result<(), CacheError> {
        if resp.status == StatusCode::NO_CONTENT {
            self.handle_revocation(req)?;
            return Ok(());
        }

        if resp.status.as_u16() >= 300 || !resp.is_json() {
            return Ok(());
        }

        let Some(secret) = Secret::parse(&resp.body)? else {
            tracing::debug!(method = %req.method, path = %req.path, "pass-through response; no secret in response");
            return Ok(());
        };

        let ns = entry_namespace(req);

        if self.inner.cache_static_secrets
            && secret.mount_type == "kv"
            && req.method == Method::GET
            && !req.token.is_empty()
        {
            if let Some(static_id) = static_id {
                return self.cache_static_secret(req, static_id, ns, resp, &secret);
            }
        }

        if !self.inner.cache_dynamic_secrets {
            return Ok(());
        }

        if !secret.renewable && !secret.token_is_renewable() {
            tracing::debug!(method = %req.method, path = %req.path, "pass-through response; secret not renewable");
            return Ok(());
        }

        self.cache_dynamic_secret(req, dynamic_id, ns, resp, secret)
    }

    fn parent_ctx(&self, token: &str) -> Result<Option<RenewCtx>, CacheError> {
        match self.inner.store.db.get(IndexName::Token, &[token]) {
            Ok(parent) => Ok(parent.renew_ctx.clone()),
            Err(MemDbError::NotFound) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn cache_dynamic_secret(
        &self,
        req: &SendRequest,
        id: &str,
        ns: String,
        resp: &UpstreamResponse,
        secret: Secret,
    ) -> Result<(), CacheError> {
        let now = self.now();
        let mut entry = Entry {
            id: id.to_owned(),
            kind: EntryType::Lease,
            namespace: ns,
            request_path: req.path.clone(),
            request_method: req.method.to_string(),
            request_headers: request_headers(req),
            request_token: req.token.clone(),
            response: Some(StoredResponse::capture(resp, SystemTime::from(now))),
            last_renewed: now,
            ..Entry::default()
        };

        let ctx = if !secret.lease_id.is_empty() {
            let Some(parent) = self.parent_ctx(&req.token)? else {
                tracing::debug!(path = %req.path, "pass-through lease response; token not managed by the cache");
                return Ok(());
            };

            entry.lease = secret.lease_id.clone();
            entry.lease_token = req.token.clone();
            parent.derive()
        } else if let Some(auth) = &secret.auth {
            let ctx = if auth.orphan {
                self.base_ctx().derive()
            } else {
                let Some(parent) = self.parent_ctx(&req.token)? else {
                    tracing::debug!(path = %req.path, "pass-through token response; parent token not managed by the cache");
                    return Ok(());
                };

                entry.token_parent = req.token.clone();
                parent.derive()
            };

            entry.token = auth.client_token.clone();
            entry.token_accessor = auth.accessor.clone();
            ctx
        } else {
            tracing::debug!(path = %req.path, "pass-through response; secret without lease or token");
            return Ok(());
        };

        entry.renew_ctx = Some(ctx);

        {
            let _lock = self.inner.store.lock(&entry.id);
            self.inner.store.set(entry.clone())?;
        }

        tracing::debug!(id = %entry.id, method = %req.method, path = %req.path, "cached dynamic secret response");
        self.start_renewing(&entry, secret);
        Ok(())
    }

    fn cache_static_secret(
        &self,
        req: &SendRequest,
        id: &str,
        ns: String,
        resp: &UpstreamResponse,
        secret: &Secret,
    ) -> Result<(), CacheError> {
        let path = fingerprint::static_secret_path(req).unwrap_or_default();
        let version = fingerprint::requested_version(req);
        let now = self.now();
        let captured = StoredResponse::capture(resp, SystemTime::from(now));

        {
            let _lock = self.inner.store.lock(id);
            let mut entry = match self.inner.store.db.get(IndexName::Id, &[id]) {
                Ok(existing) => (*existing).clone(),
                Err(MemDbError::NotFound) => Entry {
                    id: id.to_owned(),
                    kind: EntryType::StaticSecret,
                    namespace: ns,
                    request_path: path.clone(),
                    request_method: req.method.to_string(),
                    request_headers: request_headers(req),
                    request_token: req.token.clone(),
                    last_renewed: now,
                    ..Entry::default()
                },
                Err(err) => return Err(err.into()),
            };

            entry.tokens.insert(req.token.clone());

            let held = match version {
                0 => entry.response.is_some(),
                v => entry.versions.contains_key(&v),
            };
            if !held {
                if version == 0 {
                    entry.response = Some(captured);
                    record_current_version(&mut entry, secret);
                } else {
                    entry.versions.insert(version, captured);
                }
            }

            tracing::debug!(%id, %path, version, "cached static secret response");
            self.inner.store.set(entry)?;
        }

        self.record_capability(&req.token, path)
    }

    fn record_capability(&self, token: &str, path: String) -> Result<(), CacheError> {
        let id = fingerprint::hash(token);

        let (entry, created) = {
            let _lock = self.inner.store.lock(&id);
            let (mut entry, created) = match self.inner.store.db.get_capabilities(&id) {
                Ok(existing) => (existing, false),
                Err(MemDbError::NotFound) => (
                    CapabilitiesEntry {
                        id: id.clone(),
                        token: token.to_owned(),
                        ..CapabilitiesEntry::default()
                    },
                    true,
                ),
                Err(err) => return Err(err.into()),
            };

            entry.readable_paths.insert(path);
            self.inner.store.set_capabilities(entry.clone())?;
            (entry, created)
        };

        if created {
            if let Some(capabilities) = &self.inner.capabilities {
                capabilities.start_renewing(&entry);
            }
        }

        Ok(())
    }

    /// Keeps `entry` alive in the background until its context ends
    ///
    /// The entry is evicted when renewal stops, unless the process is
    /// shutting down.
    pub(crate) fn start_renewing(&self, entry: &Entry, secret: Secret) {
        let Some(ctx) = entry.renew_ctx.clone() else {
            return;
        };

        let client = self.inner.client.clone().with_token(&entry.request_token);
        let cache = self.clone();
        let id = entry.id.clone();
        let path = entry.request_path.clone();

        tokio::spawn(async move {
            tracing::debug!(%path, "starting renewal");
            let mut watcher = LifetimeWatcher::start(client, secret, 0);

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        tracing::debug!(%path, "context cancelled; stopping renewal");
                        break;
                    }
                    _ = ctx.closed() => {
                        tracing::debug!(%path, "renewal closed");
                        break;
                    }
                    event = watcher.next() => match event {
                        WatcherEvent::Renewed(_) => {
                            tracing::debug!(%path, "secret renewed");
                            cache.update_last_renewed(&id);
                        }
                        WatcherEvent::Done(Ok(())) => {
                            tracing::debug!(%path, "renewal halted");
                            break;
                        }
                        WatcherEvent::Done(Err(error)) => {
                            tracing::error!(%error, %path, "failed to renew secret");
                            break;
                        }
                    },
                }
            }

            watcher.stop();

            if cache.inner.shutting_down.load(Ordering::Acquire) {
                tracing::trace!(%id, %path, "not evicting entry during shutdown");
                return;
            }

            if let Err(error) = cache.inner.store.evict_if_current(&id, Some(&ctx)) {
                tracing::error!(%error, %id, "failed to evict entry");
            }
        });
    }

    fn update_last_renewed(&self, id: &str) {
        if self.inner.store.storage.is_none() {
            return;
        }

        let now = self.now();
        if let Err(error) = self.inner.store.modify(id, |entry| entry.last_renewed = now) {
            tracing::warn!(%error, %id, "failed to update last renewal time");
        }
    }
}

#[async_trait]
impl Proxier for LeaseCache {
    #[tracing::instrument(
        level = "debug",
        err,
        skip(self, req),
        fields(method = %req.method, path = %req.path)
    )]
    async fn send(&self, req: &SendRequest) -> Result<SendResponse, ProxyError> {
        let dynamic_id = fingerprint::dynamic_id(req);
        let static_id = fingerprint::static_id(req);

        let _dynamic_claim = self.inner.inflight.claim(&dynamic_id).await;
        let _static_claim = match &static_id {
            Some(id) => self.inner.inflight.claim(id).await,
            None => None,
        };

        if let Some(hit) = self.check_dynamic(&dynamic_id) {
            return Ok(hit);
        }

        if let Some(static_id) = &static_id {
            if let Some(hit) = self.check_static(static_id, req) {
                return Ok(hit);
            }
        }

        counter!("cache.miss").increment(1);
        tracing::debug!("forwarding request");

        let mut resp = self.inner.proxier.send(req).await?;
        if let Err(error) = self.cache_response(req, &dynamic_id, static_id.as_deref(), &resp.response) {
            tracing::warn!(%error, "failed to cache response; returning it uncached");
        }

        resp.cache_meta = Some(CacheMeta::default());
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        sync::atomic::AtomicUsize,
    };

    use bytes::Bytes;
    use http::{header, HeaderMap, HeaderValue};
    use lessor_api::testing::{json_response, MockUpstream};
    use lessor_clock::TestClock;
    use serde_json::{json, Value};

    use super::*;

    type Responder = dyn Fn(&SendRequest) -> UpstreamResponse + Send + Sync;

    struct CannedProxier {
        respond: Box<Responder>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl CannedProxier {
        fn new(respond: impl Fn(&SendRequest) -> UpstreamResponse + Send + Sync + 'static) -> Self {
            Self {
                respond: Box::new(respond),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Proxier for CannedProxier {
        async fn send(&self, req: &SendRequest) -> Result<SendResponse, ProxyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(SendResponse::uncached((self.respond)(req)))
        }
    }

    fn json_body(status: u16, body: Value) -> UpstreamResponse {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        UpstreamResponse {
            status: StatusCode::from_u16(status).unwrap(),
            headers,
            body: Bytes::from(serde_json::to_vec(&body).unwrap()),
        }
    }

    fn no_content() -> UpstreamResponse {
        UpstreamResponse {
            status: StatusCode::NO_CONTENT,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    fn lease_response(lease_id: &str) -> UpstreamResponse {
        json_body(
            200,
            json!({
                "lease_id": lease_id,
                "lease_duration": 3600,
                "renewable": true,
                "data": { "username": "v-user", "password": "hunter2" },
            }),
        )
    }

    fn token_response(token: &str, orphan: bool) -> UpstreamResponse {
        json_body(
            200,
            json!({
                "auth": {
                    "client_token": token,
                    "accessor": format!("accessor-{}", token),
                    "lease_duration": 3600,
                    "renewable": true,
                    "orphan": orphan,
                },
            }),
        )
    }

    fn kv_response(value: &str, version: u64) -> UpstreamResponse {
        json_body(
            200,
            json!({
                "mount_type": "kv",
                "lease_duration": 0,
                "renewable": false,
                "data": { "data": { "value": value }, "metadata": { "version": version } },
            }),
        )
    }

    /// Answers every renewal with a fresh hour-long lifetime
    fn renewals() -> Arc<MockUpstream> {
        Arc::new(MockUpstream::new(|_| {
            json_response(200, json!({ "lease_duration": 3600, "renewable": true }))
        }))
    }

    /// Never answers renewals, so entries keep the time they were created
    fn stalled_renewals() -> Arc<MockUpstream> {
        Arc::new(
            MockUpstream::new(|_| json_response(200, json!({}))).with_delay(Duration::from_secs(3600)),
        )
    }

    struct Fixture {
        cache: LeaseCache,
        proxier: Arc<CannedProxier>,
        upstream: Arc<MockUpstream>,
        shutdown: CancellationToken,
    }

    fn fixture(proxier: CannedProxier, configure: impl FnOnce(&mut LeaseCacheConfig)) -> Fixture {
        fixture_with(proxier, renewals(), configure)
    }

    fn fixture_with(
        proxier: CannedProxier,
        upstream: Arc<MockUpstream>,
        configure: impl FnOnce(&mut LeaseCacheConfig),
    ) -> Fixture {
        let proxier = Arc::new(proxier);
        let mut config = LeaseCacheConfig::new(upstream.client(), proxier.clone());
        configure(&mut config);
        let shutdown = config.shutdown.clone();

        Fixture {
            cache: LeaseCache::new(config),
            proxier,
            upstream,
            shutdown,
        }
    }

    fn request(method: Method, path: &str, token: &str) -> SendRequest {
        let mut req = SendRequest::new(method, path);
        req.token = token.to_owned();
        req
    }

    fn with_body(mut req: SendRequest, body: Value) -> SendRequest {
        req.body = Bytes::from(serde_json::to_vec(&body).unwrap());
        req
    }

    fn has_token(cache: &LeaseCache, token: &str) -> bool {
        cache.db().get(IndexName::Token, &[token]).is_ok()
    }

    fn has_lease(cache: &LeaseCache, lease: &str) -> bool {
        cache.db().get(IndexName::Lease, &[lease]).is_ok()
    }

    async fn eventually(condition: impl Fn() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    /// Answers token creation with a child of the caller and credential reads
    /// with a lease named for the caller
    fn token_tree_proxier() -> CannedProxier {
        CannedProxier::new(|req| match req.path.as_str() {
            "/v1/auth/token/create" => {
                let child = match req.token.as_str() {
                    "t1" => "t2",
                    "t2" => "t3",
                    _ => "tx",
                };
                token_response(child, false)
            }
            "/v1/auth/token/create-orphan" => token_response("o1", true),
            "/v1/db/creds/role" => lease_response(&format!("db/creds/role/l-{}", req.token)),
            _ => no_content(),
        })
    }

    /// Caches t1 → t2 → t3, each with one lease
    async fn build_token_tree(cache: &LeaseCache) {
        cache.register_auto_auth_token("t1").unwrap();
        for token in ["t1", "t2"] {
            cache
                .send(&request(Method::POST, "/v1/auth/token/create", token))
                .await
                .unwrap();
        }
        for token in ["t1", "t2", "t3"] {
            cache
                .send(&request(Method::GET, "/v1/db/creds/role", token))
                .await
                .unwrap();
        }
        assert_eq!(cache.db().len(), 6);
    }

    mod when_coalescing {
        use super::*;

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn concurrent_identical_requests_reach_the_upstream_once() {
            let mut proxier = CannedProxier::new(|_| lease_response("sample/api/lease"));
            proxier.delay = Duration::from_millis(50);
            let f = fixture(proxier, |_| {});
            f.cache.register_auto_auth_token("autoauthtoken").unwrap();

            let tasks: Vec<_> = (0..100)
                .map(|_| {
                    let cache = f.cache.clone();
                    tokio::spawn(async move {
                        let req = request(Method::GET, "/v1/sample/api", "autoauthtoken");
                        cache.send(&req).await.unwrap()
                    })
                })
                .collect();

            let mut hits = 0;
            let mut bodies = Vec::new();
            for task in tasks {
                let resp = task.await.unwrap();
                if resp.cache_meta.unwrap().hit {
                    hits += 1;
                }
                bodies.push(resp.response.body);
            }

            assert_eq!(f.proxier.calls(), 1);
            assert_eq!(hits, 99);
            assert!(bodies.windows(2).all(|w| w[0] == w[1]));
        }

        #[tokio::test]
        async fn different_tokens_are_not_coalesced() {
            let f = fixture(token_tree_proxier(), |_| {});
            build_token_tree(&f.cache).await;

            assert_eq!(f.proxier.calls(), 5);
        }
    }

    mod when_classifying_responses {
        use super::*;

        #[tokio::test]
        async fn leases_of_unknown_tokens_are_passed_through() {
            let f = fixture(token_tree_proxier(), |_| {});

            let first = f.cache.send(&request(Method::GET, "/v1/db/creds/role", "stranger")).await.unwrap();
            let second = f.cache.send(&request(Method::GET, "/v1/db/creds/role", "stranger")).await.unwrap();

            assert!(!first.cache_meta.unwrap().hit);
            assert!(!second.cache_meta.unwrap().hit);
            assert_eq!(f.proxier.calls(), 2);
            assert!(f.cache.db().is_empty());
        }

        #[tokio::test]
        async fn non_renewable_secrets_are_passed_through() {
            let f = fixture(
                CannedProxier::new(|_| {
                    json_body(200, json!({ "lease_id": "x/1", "lease_duration": 60, "renewable": false }))
                }),
                |_| {},
            );
            f.cache.register_auto_auth_token("t1").unwrap();

            f.cache.send(&request(Method::GET, "/v1/x", "t1")).await.unwrap();

            assert!(!has_lease(&f.cache, "x/1"));
        }

        #[tokio::test]
        async fn error_responses_are_passed_through() {
            let f = fixture(
                CannedProxier::new(|_| json_body(403, json!({ "errors": ["permission denied"] }))),
                |_| {},
            );
            f.cache.register_auto_auth_token("t1").unwrap();

            let resp = f.cache.send(&request(Method::GET, "/v1/x", "t1")).await.unwrap();

            assert_eq!(resp.response.status, StatusCode::FORBIDDEN);
            assert_eq!(f.cache.db().len(), 1);
        }

        #[tokio::test]
        async fn dynamic_caching_can_be_disabled() {
            let f = fixture(token_tree_proxier(), |c| c.cache_dynamic_secrets = false);
            f.cache.register_auto_auth_token("t1").unwrap();

            f.cache.send(&request(Method::GET, "/v1/db/creds/role", "t1")).await.unwrap();

            assert!(!has_lease(&f.cache, "db/creds/role/l-t1"));
        }

        #[tokio::test]
        async fn cached_responses_report_their_age() {
            let clock = TestClock::new(UnixTime(1_700_000_000));
            let f = fixture(token_tree_proxier(), |c| c.clock = Arc::new(clock.clone()));
            f.cache.register_auto_auth_token("t1").unwrap();
            let req = request(Method::GET, "/v1/db/creds/role", "t1");

            f.cache.send(&req).await.unwrap();
            clock.inc(42);
            let resp = f.cache.send(&req).await.unwrap();

            assert_eq!(
                resp.cache_meta,
                Some(CacheMeta { hit: true, age: Duration::from_secs(42) })
            );
            assert_eq!(f.proxier.calls(), 1);
        }

        #[tokio::test]
        async fn cached_tokens_record_their_parent() {
            let f = fixture(token_tree_proxier(), |_| {});
            build_token_tree(&f.cache).await;

            let t3 = f.cache.db().get(IndexName::Token, &["t3"]).unwrap();

            assert_eq!(t3.token_parent, "t2");
            assert_eq!(t3.token_accessor, "accessor-t3");
            assert_eq!(t3.request_token, "t2");
            assert_eq!(t3.namespace, "root/");
        }

        #[tokio::test]
        async fn a_slash_namespace_header_caches_under_root() {
            let f = fixture(token_tree_proxier(), |_| {});
            f.cache.register_auto_auth_token("t1").unwrap();
            let mut req = request(Method::GET, "/v1/db/creds/role", "t1");
            req.headers
                .insert(lessor_api::NAMESPACE_HEADER, HeaderValue::from_static("/"));

            f.cache.send(&req).await.unwrap();

            let lease = f.cache.db().get(IndexName::Lease, &["db/creds/role/l-t1"]).unwrap();
            assert_eq!(lease.namespace, namespace::ROOT);
        }

        #[tokio::test]
        async fn orphans_are_cached_without_a_parent() {
            let f = fixture(token_tree_proxier(), |_| {});
            f.cache.register_auto_auth_token("t1").unwrap();

            f.cache
                .send(&request(Method::POST, "/v1/auth/token/create-orphan", "t1"))
                .await
                .unwrap();

            let orphan = f.cache.db().get(IndexName::Token, &["o1"]).unwrap();
            assert!(orphan.token_parent.is_empty());
        }
    }

    mod when_revoking {
        use super::*;

        #[tokio::test]
        async fn revoking_a_token_evicts_its_descendants() {
            let f = fixture(token_tree_proxier(), |_| {});
            build_token_tree(&f.cache).await;

            f.cache
                .send(&request(Method::PUT, "/v1/auth/token/revoke-self", "t2"))
                .await
                .unwrap();

            assert!(has_token(&f.cache, "t1"));
            assert!(has_lease(&f.cache, "db/creds/role/l-t1"));
            for token in ["t2", "t3"] {
                assert!(!has_token(&f.cache, token));
                assert!(!has_lease(&f.cache, &format!("db/creds/role/l-{}", token)));
            }
            assert_eq!(f.cache.db().len(), 2);
        }

        #[tokio::test]
        async fn orphan_revocation_spares_children() {
            let f = fixture(token_tree_proxier(), |_| {});
            build_token_tree(&f.cache).await;

            let req = with_body(
                request(Method::PUT, "/v1/auth/token/revoke-orphan", "t1"),
                json!({ "token": "t2" }),
            );
            f.cache.send(&req).await.unwrap();

            assert!(!has_token(&f.cache, "t2"));
            assert!(!has_lease(&f.cache, "db/creds/role/l-t2"));
            assert!(has_lease(&f.cache, "db/creds/role/l-t3"));
            let t3 = f.cache.db().get(IndexName::Token, &["t3"]).unwrap();
            assert!(t3.token_parent.is_empty());
            assert_eq!(f.cache.db().len(), 4);
        }

        #[tokio::test]
        async fn revoking_by_accessor_and_lease() {
            let f = fixture(token_tree_proxier(), |_| {});
            build_token_tree(&f.cache).await;

            let by_lease = with_body(
                request(Method::PUT, "/v1/sys/leases/revoke", "t1"),
                json!({ "lease_id": "db/creds/role/l-t1" }),
            );
            f.cache.send(&by_lease).await.unwrap();
            assert!(!has_lease(&f.cache, "db/creds/role/l-t1"));
            assert!(has_token(&f.cache, "t2"));

            let by_accessor = with_body(
                request(Method::PUT, "/v1/auth/token/revoke-accessor", "t1"),
                json!({ "accessor": "accessor-t3" }),
            );
            f.cache.send(&by_accessor).await.unwrap();
            assert!(!has_token(&f.cache, "t3"));
            assert!(!has_lease(&f.cache, "db/creds/role/l-t3"));
            assert!(has_lease(&f.cache, "db/creds/role/l-t2"));
        }

        #[tokio::test]
        async fn prefix_revocation_matches_leases_by_prefix() {
            let f = fixture(token_tree_proxier(), |_| {});
            build_token_tree(&f.cache).await;

            f.cache
                .send(&request(Method::PUT, "/v1/sys/leases/revoke-prefix/db/creds", "t1"))
                .await
                .unwrap();

            for token in ["t1", "t2", "t3"] {
                assert!(!has_lease(&f.cache, &format!("db/creds/role/l-{}", token)));
                assert!(has_token(&f.cache, token));
            }
        }

        #[tokio::test]
        async fn failed_revocations_leave_the_cache_alone() {
            let f = fixture(
                CannedProxier::new(|req| match req.path.as_str() {
                    "/v1/auth/token/create" => token_response("t2", false),
                    _ => json_body(400, json!({ "errors": ["bad request"] })),
                }),
                |_| {},
            );
            f.cache.register_auto_auth_token("t1").unwrap();
            f.cache
                .send(&request(Method::POST, "/v1/auth/token/create", "t1"))
                .await
                .unwrap();

            f.cache
                .send(&request(Method::PUT, "/v1/auth/token/revoke-self", "t2"))
                .await
                .unwrap();

            assert!(has_token(&f.cache, "t2"));
        }

        #[tokio::test]
        async fn refused_renewals_evict_the_entry() {
            let upstream = Arc::new(MockUpstream::new(|_| {
                json_response(400, json!({ "errors": ["lease not found"] }))
            }));
            let f = fixture_with(token_tree_proxier(), upstream, |_| {});
            f.cache.register_auto_auth_token("t1").unwrap();

            f.cache.send(&request(Method::GET, "/v1/db/creds/role", "t1")).await.unwrap();

            eventually(|| !has_lease(&f.cache, "db/creds/role/l-t1")).await;
            assert!(has_token(&f.cache, "t1"));
            assert!(f.upstream.calls_to("/v1/sys/leases/renew") >= 1);
        }
    }

    mod when_caching_static_secrets {
        use super::*;

        fn kv_proxier() -> CannedProxier {
            CannedProxier::new(|req| match (req.method.clone(), req.path.as_str()) {
                (Method::GET, "/v1/secret/foo") => kv_response("bar", 1),
                (Method::GET, "/v1/secret/data/app") => {
                    if req.query.as_deref() == Some("version=1") {
                        kv_response("old", 1)
                    } else {
                        kv_response("new", 2)
                    }
                }
                _ => no_content(),
            })
        }

        fn static_fixture() -> Fixture {
            fixture(kv_proxier(), |c| c.cache_static_secrets = true)
        }

        async fn get(f: &Fixture, path: &str, token: &str) -> SendResponse {
            let mut req = request(Method::GET, path, token);
            if let Some((path, query)) = path.split_once('?') {
                req.path = path.to_owned();
                req.query = Some(query.to_owned());
            }
            f.cache.send(&req).await.unwrap()
        }

        #[tokio::test]
        async fn tokens_must_have_read_the_secret_before_being_served() {
            let f = static_fixture();

            assert!(!get(&f, "/v1/secret/foo", "ta").await.cache_meta.unwrap().hit);
            assert!(get(&f, "/v1/secret/foo", "ta").await.cache_meta.unwrap().hit);
            assert_eq!(f.proxier.calls(), 1);

            assert!(!get(&f, "/v1/secret/foo", "tb").await.cache_meta.unwrap().hit);
            assert_eq!(f.proxier.calls(), 2);

            let caps = f.cache.db().get_capabilities(&fingerprint::hash("tb")).unwrap();
            assert!(caps.readable_paths.contains("secret/foo"));

            assert!(get(&f, "/v1/secret/foo", "tb").await.cache_meta.unwrap().hit);
            assert_eq!(f.proxier.calls(), 2);
        }

        #[tokio::test]
        async fn writes_evict_the_cached_secret() {
            let f = static_fixture();
            get(&f, "/v1/secret/foo", "ta").await;
            let id = fingerprint::hash("secret/foo");
            assert!(f.cache.db().get(IndexName::Id, &[&id]).is_ok());

            f.cache
                .send(&request(Method::PUT, "/v1/secret/foo", "ta"))
                .await
                .unwrap();

            assert!(f.cache.db().get(IndexName::Id, &[&id]).is_err());
            assert!(!get(&f, "/v1/secret/foo", "ta").await.cache_meta.unwrap().hit);
        }

        #[tokio::test]
        async fn any_method_but_get_evicts_the_cached_secret() {
            for method in [Method::HEAD, Method::from_bytes(b"LIST").unwrap()] {
                let f = static_fixture();
                get(&f, "/v1/secret/foo", "ta").await;
                let id = fingerprint::hash("secret/foo");

                f.cache
                    .send(&request(method.clone(), "/v1/secret/foo", "ta"))
                    .await
                    .unwrap();

                assert!(f.cache.db().get(IndexName::Id, &[&id]).is_err(), "{method} kept the secret");
            }
        }

        #[tokio::test]
        async fn versions_are_served_from_their_own_slots() {
            let f = static_fixture();

            get(&f, "/v1/secret/data/app", "ta").await;
            let current = get(&f, "/v1/secret/data/app?version=2", "ta").await;
            assert!(current.cache_meta.unwrap().hit);
            assert_eq!(f.proxier.calls(), 1);

            let old = get(&f, "/v1/secret/data/app?version=1", "ta").await;
            assert!(!old.cache_meta.unwrap().hit);
            let old = get(&f, "/v1/secret/data/app?version=1", "ta").await;
            assert!(old.cache_meta.unwrap().hit);
            assert!(std::str::from_utf8(&old.response.body).unwrap().contains("old"));

            let latest = get(&f, "/v1/secret/data/app", "ta").await;
            assert!(std::str::from_utf8(&latest.response.body).unwrap().contains("new"));
            assert_eq!(f.proxier.calls(), 2);
        }

        #[tokio::test]
        async fn kv_responses_are_not_shared_when_disabled() {
            let f = fixture(kv_proxier(), |_| {});

            get(&f, "/v1/secret/foo", "ta").await;
            get(&f, "/v1/secret/foo", "ta").await;

            assert_eq!(f.proxier.calls(), 2);
        }

        #[tokio::test]
        async fn clearing_by_request_path_removes_static_secrets() {
            let f = static_fixture();
            get(&f, "/v1/secret/foo", "ta").await;

            f.cache
                .handle_cache_clear(CacheClearInput {
                    kind: "request_path".into(),
                    value: Some("secret/".into()),
                    namespace: None,
                })
                .unwrap();

            assert!(!get(&f, "/v1/secret/foo", "ta").await.cache_meta.unwrap().hit);
        }
    }

    mod when_clearing {
        use super::*;

        fn clear(kind: &str, value: Option<&str>) -> CacheClearInput {
            CacheClearInput {
                kind: kind.to_owned(),
                value: value.map(str::to_owned),
                namespace: None,
            }
        }

        #[tokio::test]
        async fn clearing_everything_empties_memory_and_disk() {
            let dir = tempfile::tempdir().unwrap();
            let storage = Arc::new(PersistentStorage::create(dir.path(), Vec::new()).unwrap());
            let f = fixture(token_tree_proxier(), |c| c.storage = Some(storage.clone()));
            build_token_tree(&f.cache).await;

            f.cache.handle_cache_clear(clear("all", None)).unwrap();

            assert!(f.cache.db().is_empty());
            for kind in EntryType::ALL {
                assert!(storage.get_by_type(kind).unwrap().is_empty());
            }
        }

        #[tokio::test]
        async fn the_cache_is_usable_after_clearing_everything() {
            let f = fixture(token_tree_proxier(), |_| {});
            build_token_tree(&f.cache).await;
            f.cache.handle_cache_clear(clear("all", None)).unwrap();

            build_token_tree(&f.cache).await;

            assert!(has_lease(&f.cache, "db/creds/role/l-t3"));
        }

        #[tokio::test]
        async fn clearing_a_token_clears_its_descendants() {
            let f = fixture(token_tree_proxier(), |_| {});
            build_token_tree(&f.cache).await;

            f.cache.handle_cache_clear(clear("token", Some("t2"))).unwrap();

            assert!(!has_token(&f.cache, "t3"));
            assert_eq!(f.cache.db().len(), 2);
        }

        #[tokio::test]
        async fn clearing_unknown_values_succeeds() {
            let f = fixture(token_tree_proxier(), |_| {});

            f.cache.handle_cache_clear(clear("lease", Some("nope"))).unwrap();
            f.cache.handle_cache_clear(clear("token_accessor", Some("nope"))).unwrap();
        }

        #[tokio::test]
        async fn malformed_requests_are_rejected() {
            let f = fixture(token_tree_proxier(), |_| {});

            let err = f.cache.handle_cache_clear(clear("everything", None)).unwrap_err();
            assert!(matches!(err, CacheError::InvalidClearType(_)));
            assert!(err.is_bad_request());

            let err = f.cache.handle_cache_clear(clear("token", None)).unwrap_err();
            assert!(matches!(err, CacheError::MissingClearValue(_)));
            assert!(err.is_bad_request());
        }

        #[test]
        fn inputs_parse_from_json() {
            let input: CacheClearInput =
                serde_json::from_value(json!({ "type": "request_path", "value": "/v1/a", "namespace": "ns1" }))
                    .unwrap();

            assert_eq!(input.kind, "request_path");
            assert_eq!(input.value.as_deref(), Some("/v1/a"));
            assert_eq!(input.namespace.as_deref(), Some("ns1"));
        }
    }

    mod when_persisting {
        use super::*;

        fn storage(dir: &Path) -> Arc<PersistentStorage> {
            Arc::new(PersistentStorage::create(dir, b"workload".to_vec()).unwrap())
        }

        /// Caches t1 with a lease, and an orphan o1 with a lease
        async fn populate(cache: &LeaseCache) {
            cache.register_auto_auth_token("t1").unwrap();
            cache
                .send(&request(Method::GET, "/v1/db/creds/role", "t1"))
                .await
                .unwrap();
            cache
                .send(&request(Method::POST, "/v1/auth/token/create-orphan", "t1"))
                .await
                .unwrap();
            cache
                .send(&request(Method::GET, "/v1/db/creds/role", "o1"))
                .await
                .unwrap();
            assert_eq!(cache.db().len(), 4);
        }

        async fn crash(f: &Fixture) {
            f.cache.set_shutting_down(true).await;
            f.shutdown.cancel();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        fn restarted(storage: &Arc<PersistentStorage>, clock: Option<TestClock>) -> Fixture {
            fixture_with(token_tree_proxier(), stalled_renewals(), |c| {
                c.storage = Some(storage.clone());
                if let Some(clock) = clock {
                    c.clock = Arc::new(clock);
                }
            })
        }

        #[tokio::test]
        async fn shutting_down_keeps_entries_on_disk() {
            let dir = tempfile::tempdir().unwrap();
            let storage = storage(dir.path());
            let f = fixture_with(token_tree_proxier(), stalled_renewals(), |c| {
                c.storage = Some(storage.clone())
            });
            populate(&f.cache).await;

            crash(&f).await;

            assert_eq!(storage.get_by_type(EntryType::Token).unwrap().len(), 1);
            assert_eq!(storage.get_by_type(EntryType::Lease).unwrap().len(), 3);
            assert_eq!(f.cache.db().len(), 4);
        }

        #[tokio::test]
        async fn entries_are_evicted_from_disk_when_not_shutting_down() {
            let dir = tempfile::tempdir().unwrap();
            let storage = storage(dir.path());
            let f = fixture_with(token_tree_proxier(), stalled_renewals(), |c| {
                c.storage = Some(storage.clone())
            });
            populate(&f.cache).await;

            f.shutdown.cancel();

            eventually(|| storage.get_by_type(EntryType::Lease).unwrap().is_empty()).await;
        }

        #[tokio::test]
        async fn restore_recreates_tokens_and_leases() {
            let dir = tempfile::tempdir().unwrap();
            let storage = storage(dir.path());
            let f = restarted(&storage, None);
            populate(&f.cache).await;
            crash(&f).await;

            let g = restarted(&storage, None);
            g.cache.restore(&storage).unwrap();

            assert_eq!(g.cache.db().len(), 4);
            assert!(has_token(&g.cache, "t1"));
            assert!(has_token(&g.cache, "o1"));
            assert!(has_lease(&g.cache, "db/creds/role/l-t1"));
            assert!(has_lease(&g.cache, "db/creds/role/l-o1"));

            g.cache.handle_cache_clear(CacheClearInput {
                kind: "token".into(),
                value: Some("t1".into()),
                namespace: None,
            })
            .unwrap();
            assert!(!has_lease(&g.cache, "db/creds/role/l-t1"));
            assert!(has_lease(&g.cache, "db/creds/role/l-o1"));
        }

        #[tokio::test]
        async fn leases_without_a_parent_are_skipped() {
            let dir = tempfile::tempdir().unwrap();
            let storage = storage(dir.path());
            let f = restarted(&storage, None);
            populate(&f.cache).await;
            let t1 = f.cache.db().get(IndexName::Token, &["t1"]).unwrap();
            crash(&f).await;
            storage.delete(&t1.id, EntryType::Token).unwrap();

            let g = restarted(&storage, None);
            let errors = g.cache.restore(&storage).unwrap_err();

            assert_eq!(errors.len(), 1);
            assert!(matches!(errors.errors()[0], CacheError::ParentNotFound { .. }));
            assert!(!has_lease(&g.cache, "db/creds/role/l-t1"));
            assert!(has_token(&g.cache, "o1"));
            assert!(has_lease(&g.cache, "db/creds/role/l-o1"));
        }

        #[tokio::test]
        async fn expired_leases_are_not_restored() {
            let dir = tempfile::tempdir().unwrap();
            let storage = storage(dir.path());
            let clock = TestClock::new(UnixTime(1_700_000_000));
            let f = restarted(&storage, Some(clock.clone()));
            populate(&f.cache).await;
            crash(&f).await;

            clock.inc(7200);
            let g = restarted(&storage, Some(clock));
            g.cache.restore(&storage).unwrap();

            assert_eq!(g.cache.db().len(), 1);
            assert!(has_token(&g.cache, "t1"));
            assert!(storage.get_by_type(EntryType::Lease).unwrap().is_empty());
        }

        #[tokio::test]
        async fn the_auto_auth_token_is_remembered() {
            let dir = tempfile::tempdir().unwrap();
            let storage = storage(dir.path());
            let f = restarted(&storage, None);

            f.cache.register_auto_auth_token("t1").unwrap();
            f.cache.register_auto_auth_token("t1").unwrap();

            assert_eq!(storage.get_auto_auth_token().unwrap().as_deref(), Some("t1"));
            assert_eq!(storage.get_by_type(EntryType::Token).unwrap().len(), 1);
        }

        #[tokio::test]
        async fn static_secrets_and_capabilities_are_restored() {
            let dir = tempfile::tempdir().unwrap();
            let storage = storage(dir.path());
            let proxier = CannedProxier::new(|_| kv_response("bar", 1));
            let f = fixture_with(proxier, stalled_renewals(), |c| {
                c.storage = Some(storage.clone());
                c.cache_static_secrets = true;
            });
            f.cache.send(&request(Method::GET, "/v1/secret/foo", "ta")).await.unwrap();
            crash(&f).await;

            let g = fixture_with(CannedProxier::new(|_| no_content()), stalled_renewals(), |c| {
                c.storage = Some(storage.clone());
                c.cache_static_secrets = true;
            });
            g.cache.restore(&storage).unwrap();

            let hit = g.cache.send(&request(Method::GET, "/v1/secret/foo", "ta")).await.unwrap();
            assert!(hit.cache_meta.unwrap().hit);
            assert!(g.cache.db().get_capabilities(&fingerprint::hash("ta")).is_ok());
            assert_eq!(g.proxier.calls(), 0);
        }
    }
}
