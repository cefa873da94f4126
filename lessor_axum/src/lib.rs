//! The inbound HTTP surface of the `lessor` secret proxy
//!
//! Every request is forwarded through a [`Proxier`], normally a
//! [`LeaseCache`] in front of an API proxy. The handler picks the token each
//! request is sent with, keeps the auto-auth token out of responses, and
//! marks responses that went through the cache with `X-Cache` and `Age`.
//! When a cache is attached, `/agent/v1/cache-clear` removes entries from it.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use lessor_api::Client;
//! use lessor_axum::{AutoAuthToken, ProxyState, UseAutoAuth};
//! use lessor_cache::{ApiProxy, ApiProxyConfig, LeaseCache, LeaseCacheConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new("https://127.0.0.1:8200".parse()?)?;
//!     let api = ApiProxy::new(client.clone(), ApiProxyConfig::default());
//!     let cache = LeaseCache::new(LeaseCacheConfig::new(client, Arc::new(api)));
//!
//!     let auto_auth = AutoAuthToken::new();
//!     let state = ProxyState::new(Arc::new(cache.clone()))
//!         .with_cache(cache)
//!         .with_auto_auth(auto_auth, UseAutoAuth::WhenMissing, None);
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8100").await?;
//!     axum::serve(listener, lessor_axum::router(state)).await?;
//!     Ok(())
//! }
//! ```

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

use std::{fmt, sync::Arc};

use axum::{
    extract::DefaultBodyLimit,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use http::{header, StatusCode};
use lessor_cache::{LeaseCache, Proxier};
use lessor_tokens::InvalidTokenNotifier;
use tower_http::trace::TraceLayer;

mod auto_auth;
mod clear;
mod proxy;
mod redact;

pub use auto_auth::{AutoAuthToken, UseAutoAuth};

/// Path of the cache-clear endpoint
pub const CACHE_CLEAR_PATH: &str = "/agent/v1/cache-clear";

/// Largest request body accepted, in bytes
pub const MAX_REQUEST_SIZE: usize = 32 * 1024 * 1024;

/// Shared state of the request handlers
#[derive(Clone)]
pub struct ProxyState {
    proxier: Arc<dyn Proxier>,
    cache: Option<LeaseCache>,
    auto_auth: AutoAuthToken,
    use_auto_auth: UseAutoAuth,
    invalid_token: Option<InvalidTokenNotifier>,
}

impl fmt::Debug for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyState")
            .field("cache", &self.cache)
            .field("auto_auth", &self.auto_auth)
            .field("use_auto_auth", &self.use_auto_auth)
            .finish_non_exhaustive()
    }
}

impl ProxyState {
    /// State forwarding every request through `proxier`
    pub fn new(proxier: Arc<dyn Proxier>) -> Self {
        Self {
            proxier,
            cache: None,
            auto_auth: AutoAuthToken::new(),
            use_auto_auth: UseAutoAuth::Never,
            invalid_token: None,
        }
    }

    /// Enables the cache-clear endpoint for `cache`
    pub fn with_cache(mut self, cache: LeaseCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Lets requests use the auto-auth token
    ///
    /// When `invalid_token` is given, an upstream rejecting the auto-auth
    /// token as invalid triggers re-authentication.
    pub fn with_auto_auth(
        mut self,
        token: AutoAuthToken,
        mode: UseAutoAuth,
        invalid_token: Option<InvalidTokenNotifier>,
    ) -> Self {
        self.auto_auth = token;
        self.use_auto_auth = mode;
        self.invalid_token = invalid_token;
        self
    }
}

/// Builds the proxy's router
pub fn router(state: ProxyState) -> Router {
    let mut router = Router::new();
    if state.cache.is_some() {
        router = router.route(
            CACHE_CLEAR_PATH,
            post(clear::cache_clear).put(clear::cache_clear),
        );
    }

    router
        .fallback(proxy::proxy)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_SIZE))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({ "errors": [message] }).to_string();
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}
