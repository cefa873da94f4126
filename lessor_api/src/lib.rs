//! Access to the upstream secret service
//!
//! The proxy speaks the service's native HTTP API. This crate wraps a
//! [`reqwest_middleware::ClientWithMiddleware`] in a cheaply cloneable
//! [`Client`] that carries the per-caller state the service expects on every
//! request: the token, the namespace, and any extra headers. Cloning the client
//! and setting a token on the clone never affects other holders.
//!
//! ```no_run
//! use lessor_api::Client;
//!
//! # async fn run() -> Result<(), lessor_api::Error> {
//! let client = Client::new("https://127.0.0.1:8200".parse()?)?
//!     .with_token("s.example");
//!
//! let secret = client.lookup_self().await?;
//! tracing::info!(renewable = secret.token_is_renewable(), "looked up token");
//! # Ok(())
//! # }
//! ```
//!
//! Read-after-write consistency is handled by the [`consistency`] module. A
//! request carrying a [`consistency::ReplicationStates`] handle will assert
//! the states collected so far and record the state returned by the service.

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

mod client;
pub mod consistency;
mod error;
pub mod namespace;
mod secret;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::{api_path, Client, UpstreamRequest, UpstreamResponse, DEFAULT_USER_AGENT};
pub use error::Error;
pub use secret::{Secret, SecretAuth, WrapInfo};

/// Header carrying the caller's token
pub const TOKEN_HEADER: &str = "x-vault-token";
/// Header carrying the caller's namespace
pub const NAMESPACE_HEADER: &str = "x-vault-namespace";
/// Header carrying replication index state
pub const INDEX_HEADER: &str = "x-vault-index";
/// Header requesting that the request be forwarded to the active node
pub const FORWARD_HEADER: &str = "x-vault-forward";
/// Header selecting how the service handles inconsistent reads
pub const INCONSISTENT_HEADER: &str = "x-vault-inconsistent";
/// Header requesting response wrapping with the given TTL
pub const WRAP_TTL_HEADER: &str = "x-vault-wrap-ttl";
/// Value of [`INCONSISTENT_HEADER`] asking the service to forward to the active node
pub const FORWARD_ACTIVE_NODE: &str = "forward-active-node";
