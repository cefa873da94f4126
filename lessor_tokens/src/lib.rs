//! Keeping upstream credentials alive in the background
//!
//! Two long-running pieces live here. The [`AuthHandler`] drives a pluggable
//! [`AuthMethod`] to obtain a token, delivers each new token to its
//! consumers over bounded channels, and keeps the token renewed until it can
//! no longer be, at which point it logs in again. The [`LifetimeWatcher`]
//! does the renewing, and is also used by the cache to keep every cached
//! token and lease alive.
//!
//! Failures are retried under an exponential [backoff][backoff] whose delays
//! are [jittered][jitter] so that many proxies restarting together do not
//! stampede the upstream.
//!
//! ```no_run
//! use lessor_tokens::{methods::TokenFileMethod, AuthConfig, AuthHandler};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(client: lessor_api::Client) -> Result<(), lessor_tokens::AuthError> {
//! let (handler, mut outputs) = AuthHandler::new(client, AuthConfig::default());
//! let method = TokenFileMethod::new("/run/secrets/token");
//! let shutdown = CancellationToken::new();
//!
//! tokio::spawn(async move {
//!     while let Some(token) = outputs.tokens.recv().await {
//!         tracing::info!(%token, "received new token");
//!     }
//! });
//!
//! handler.run(&method, shutdown).await
//! # }
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

use std::path::PathBuf;

use thiserror::Error;

mod auth;
pub mod backoff;
mod braids;
pub mod jitter;
pub mod methods;
mod watcher;

pub use auth::{AuthConfig, AuthHandler, AuthOutputs, InvalidTokenNotifier, DEFAULT_METRICS_SIGNIFIER};
pub use braids::*;
pub use methods::{AuthMethod, LoginRequest};
pub use watcher::{LifetimeWatcher, WatcherError, WatcherEvent};

/// An error obtaining a token
#[derive(Debug, Error)]
pub enum AuthError {
    /// The upstream rejected or failed the login
    #[error("upstream login failed")]
    Upstream(#[from] lessor_api::Error),
    /// The token file could not be read
    #[error("error reading token file {}", .path.display())]
    TokenFile {
        /// Path of the token file
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
    /// The token file contained no token
    #[error("token file {} is empty", .0.display())]
    EmptyTokenFile(PathBuf),
    /// A header value for the login could not be built
    #[error("invalid header value in login request")]
    Header(#[from] http::header::InvalidHeaderValue),
    /// Wrap information could not be encoded
    #[error("error encoding wrap info")]
    Encode(#[from] serde_json::Error),
    /// The login response contained no auth information
    #[error("login response contained no auth information")]
    NoAuth,
    /// The login response contained an empty token
    #[error("login response contained an empty token")]
    EmptyToken,
    /// Wrapping was requested but the response was not wrapped
    #[error("login response was not wrapped")]
    NotWrapped,
    /// The method failed for a reason of its own
    #[error("auth method failed")]
    Method(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    /// Authentication failed and no retries remain
    #[error("authentication failed and retries are exhausted")]
    RetriesExhausted(#[source] Box<AuthError>),
}
