//! Caching and forwarding of requests to the upstream secret service
//!
//! The proxy answers callers through a chain of [`Proxier`]s. The innermost,
//! [`ApiProxy`], forwards each request to the upstream. A [`LeaseCache`] in
//! front of it keeps the responses that carry leases, tokens or KV secrets,
//! keeps them renewed, and serves them to later identical requests.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use lessor_api::Client;
//! use lessor_cache::{ApiProxy, ApiProxyConfig, LeaseCache, LeaseCacheConfig, Proxier, SendRequest};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new("https://127.0.0.1:8200".parse()?)?;
//! let api = ApiProxy::new(client.clone(), ApiProxyConfig::default());
//! let cache = LeaseCache::new(LeaseCacheConfig::new(client, Arc::new(api)));
//!
//! cache.register_auto_auth_token("s.auto")?;
//!
//! let mut req = SendRequest::new(http::Method::GET, "/v1/database/creds/app");
//! req.token = "s.auto".into();
//! let resp = cache.send(&req).await?;
//! tracing::info!(hit = resp.cache_meta.map_or(false, |m| m.hit), "answered");
//! # Ok(())
//! # }
//! ```
//!
//! With persistence enabled, every cached entry is also written, encrypted,
//! to a [`PersistentStorage`], from which a restarted proxy can
//! [restore](LeaseCache::restore) its cache.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod capabilities;
pub mod entry;
mod error;
pub mod fingerprint;
mod lease_cache;
pub mod memdb;
pub mod persist;
mod proxy;
mod store;

pub use capabilities::{CapabilityRefreshConfig, RefreshBehaviour};
pub use entry::{EntryType, StoredResponse};
pub use error::{CacheError, MemDbError, ProxyError, RestoreErrors, StorageError};
pub use lease_cache::{CacheClearInput, LeaseCache, LeaseCacheConfig};
pub use memdb::{IndexName, MemDb};
pub use persist::PersistentStorage;
pub use proxy::{
    proxy_user_agent, ApiProxy, ApiProxyConfig, CacheMeta, Proxier, SendRequest, SendResponse,
    UserAgentFn, WhenInconsistent,
};
