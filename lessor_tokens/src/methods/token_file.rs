//! A method that reads an existing token from a file

use std::path::PathBuf;

use async_trait::async_trait;
use http::HeaderValue;
use lessor_api::{Client, TOKEN_HEADER};

use super::{AuthMethod, LoginRequest};
use crate::AuthError;

/// Default mount of the token auth backend
pub const DEFAULT_MOUNT_PATH: &str = "auth/token";

/// Authenticates with a token read from a local file
///
/// The file is re-read on every authentication, so replacing its contents
/// takes effect at the next login. The token is validated with a lookup of
/// itself.
#[derive(Debug)]
pub struct TokenFileMethod {
    path: PathBuf,
    mount_path: String,
}

impl TokenFileMethod {
    /// Constructs a new method reading the token at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mount_path: DEFAULT_MOUNT_PATH.to_owned(),
        }
    }

    /// Uses a token backend mounted at `mount_path`
    pub fn with_mount_path(mut self, mount_path: impl Into<String>) -> Self {
        let mount_path = mount_path.into();
        if !mount_path.trim_matches('/').is_empty() {
            self.mount_path = mount_path.trim_matches('/').to_owned();
        }
        self
    }

    async fn read_token(&self) -> Result<String, AuthError> {
        let data = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| AuthError::TokenFile {
                path: self.path.clone(),
                source,
            })?;

        let token = data.trim();
        if token.is_empty() {
            return Err(AuthError::EmptyTokenFile(self.path.clone()));
        }

        Ok(token.to_owned())
    }
}

#[async_trait]
impl AuthMethod for TokenFileMethod {
    async fn authenticate(&self, _: &Client) -> Result<LoginRequest, AuthError> {
        let token = self.read_token().await?;

        let mut value = HeaderValue::from_str(&token)?;
        value.set_sensitive(true);

        let mut login = LoginRequest::new(
            format!("{}/lookup-self", self.mount_path),
            serde_json::Value::Null,
        );
        login.headers.insert(TOKEN_HEADER, value);
        Ok(login)
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, sync::Arc};

    use lessor_api::testing::{json_response, MockUpstream};
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn token_is_read_and_trimmed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  s.from-file  ").unwrap();
        let upstream = Arc::new(MockUpstream::new(|_| json_response(200, json!({}))));

        let login = TokenFileMethod::new(file.path())
            .authenticate(&upstream.client())
            .await
            .unwrap();

        assert_eq!(login.path, "auth/token/lookup-self");
        assert!(login.is_token_lookup());
        assert_eq!(login.headers[TOKEN_HEADER], "s.from-file");
    }

    #[tokio::test]
    async fn empty_file_is_an_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let upstream = Arc::new(MockUpstream::new(|_| json_response(200, json!({}))));

        let err = TokenFileMethod::new(file.path())
            .authenticate(&upstream.client())
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::EmptyTokenFile(_)));
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = Arc::new(MockUpstream::new(|_| json_response(200, json!({}))));

        let err = TokenFileMethod::new(dir.path().join("missing"))
            .authenticate(&upstream.client())
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::TokenFile { .. }));
    }

    #[test]
    fn custom_mount_path_is_normalized() {
        let method = TokenFileMethod::new("/tmp/token").with_mount_path("/auth/other-token/");

        assert_eq!(method.mount_path, "auth/other-token");
    }
}
