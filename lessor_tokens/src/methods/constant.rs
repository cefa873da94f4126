//! A method that always sends the same login request

use async_trait::async_trait;
use lessor_api::Client;

use super::{AuthMethod, LoginRequest};
use crate::AuthError;

/// A method that always produces the same login request
#[derive(Clone, Debug)]
pub struct ConstAuthMethod {
    login: LoginRequest,
}

impl ConstAuthMethod {
    /// Constructs a method that always sends `login`
    pub fn new(login: LoginRequest) -> Self {
        Self { login }
    }
}

#[async_trait]
impl AuthMethod for ConstAuthMethod {
    async fn authenticate(&self, _: &Client) -> Result<LoginRequest, AuthError> {
        Ok(self.login.clone())
    }
}
