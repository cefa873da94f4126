//! Authentication methods driven by the auto-auth loop

use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderMap;
use lessor_api::Client;
use tokio::sync::Notify;

use crate::AuthError;

pub mod constant;
pub mod token_file;

pub use constant::ConstAuthMethod;
pub use token_file::TokenFileMethod;

/// A login request produced by an [`AuthMethod`]
///
/// The path is relative to the API root, such as `auth/approle/login`.
#[derive(Clone, Debug, Default)]
pub struct LoginRequest {
    /// Path to send the login request to
    pub path: String,
    /// Additional headers to send with the login request
    pub headers: HeaderMap,
    /// The login request body
    pub body: serde_json::Value,
}

impl LoginRequest {
    /// Constructs a login request against `path` with the given body
    pub fn new(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            path: path.into(),
            headers: HeaderMap::new(),
            body,
        }
    }

    /// Whether the request looks up an existing token rather than logging in
    ///
    /// Such requests are sent as reads, and the token lookup response is
    /// treated as the login response.
    pub fn is_token_lookup(&self) -> bool {
        self.path.trim_matches('/').ends_with("token/lookup-self")
    }
}

/// A pluggable way of obtaining a token from the upstream
#[async_trait]
pub trait AuthMethod: Send + Sync {
    /// Prepares a login request
    async fn authenticate(&self, client: &Client) -> Result<LoginRequest, AuthError>;

    /// A signal raised whenever the method's credentials change
    ///
    /// Methods whose credentials never change return `None`.
    fn new_creds(&self) -> Option<Arc<Notify>> {
        None
    }

    /// Called after a login using this method's credentials succeeded
    fn cred_success(&self) {}

    /// Called once when the auto-auth loop exits
    async fn shutdown(&self) {}

    /// Derives the client used to log in
    ///
    /// Methods that need a specialized client, for instance one presenting a
    /// client certificate, override this.
    fn auth_client(&self, client: &Client) -> Client {
        client.clone()
    }
}

#[async_trait]
impl<M: AuthMethod + ?Sized> AuthMethod for Arc<M> {
    async fn authenticate(&self, client: &Client) -> Result<LoginRequest, AuthError> {
        (**self).authenticate(client).await
    }

    fn new_creds(&self) -> Option<Arc<Notify>> {
        (**self).new_creds()
    }

    fn cred_success(&self) {
        (**self).cred_success()
    }

    async fn shutdown(&self) {
        (**self).shutdown().await
    }

    fn auth_client(&self, client: &Client) -> Client {
        (**self).auth_client(client)
    }
}
