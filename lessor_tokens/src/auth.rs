//! The auto-auth loop

use std::{future, time::Duration};

use http::{HeaderValue, Method};
use lessor_api::{api_path, Client, Secret, SecretAuth, WRAP_TTL_HEADER};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::{ErrorBackoffConfig, ErrorBackoffHandler},
    methods::{AuthMethod, LoginRequest},
    watcher::{LifetimeWatcher, WatcherEvent},
    AuthError, Token,
};

/// Default prefix for auth metrics
pub const DEFAULT_METRICS_SIGNIFIER: &str = "lessor";

/// Configuration of the auto-auth loop
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Backoff applied between failed attempts
    pub backoff: ErrorBackoffConfig,
    /// A token to validate and use before authenticating
    pub token: Option<Token>,
    /// Request response wrapping of the login with this TTL
    pub wrap_ttl: Option<Duration>,
    /// Namespace to log in against
    pub namespace: Option<String>,
    /// Re-authenticate when the method reports new credentials
    pub enable_reauth_on_new_credentials: bool,
    /// Also deliver tokens on the template channel
    pub enable_template_token_channel: bool,
    /// Also deliver tokens on the exec channel
    pub enable_exec_token_channel: bool,
    /// Prefix for `<signifier>.auth.success` and `<signifier>.auth.failure`
    pub metrics_signifier: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            backoff: ErrorBackoffConfig::default(),
            token: None,
            wrap_ttl: None,
            namespace: None,
            enable_reauth_on_new_credentials: true,
            enable_template_token_channel: false,
            enable_exec_token_channel: false,
            metrics_signifier: DEFAULT_METRICS_SIGNIFIER.to_owned(),
        }
    }
}

/// Receiving ends of the auto-auth loop
#[derive(Debug)]
pub struct AuthOutputs {
    /// Every newly obtained token
    pub tokens: mpsc::Receiver<Token>,
    /// Tokens for template rendering, if enabled
    pub template_tokens: Option<mpsc::Receiver<Token>>,
    /// Tokens for process supervision, if enabled
    pub exec_tokens: Option<mpsc::Receiver<Token>>,
    /// Handle used to report that the current token was rejected
    pub invalid_token: InvalidTokenNotifier,
}

/// Reports to the auto-auth loop that its token was rejected as invalid
///
/// At most one report is pending at a time; further reports made before the
/// loop reacts are dropped.
#[derive(Clone, Debug)]
pub struct InvalidTokenNotifier {
    tx: mpsc::Sender<()>,
}

impl InvalidTokenNotifier {
    /// Requests re-authentication
    pub fn notify(&self) {
        if self.tx.try_send(()).is_ok() {
            tracing::debug!("signalled auto-auth to re-authenticate");
        }
    }
}

/// Drives an [`AuthMethod`] to keep a valid token available
///
/// ```text
/// preloaded token -> lookup-self ----+
///                                    +-> authenticated -> renew -> ... -> expired/refused -> login
/// no token -------> login ----------+         ^                                              |
///                                             +----------------------------------------------+
/// ```
///
/// New credentials from the method, or a report on the
/// [`InvalidTokenNotifier`], force a fresh login.
#[derive(Debug)]
pub struct AuthHandler {
    client: Client,
    config: AuthConfig,
    output: mpsc::Sender<Token>,
    template: Option<mpsc::Sender<Token>>,
    exec: Option<mpsc::Sender<Token>>,
    invalid_token: mpsc::Receiver<()>,
}

impl AuthHandler {
    /// Constructs a new handler logging in through `client`
    pub fn new(client: Client, config: AuthConfig) -> (Self, AuthOutputs) {
        let (output, tokens) = mpsc::channel(1);
        let (template, template_tokens) = optional_channel(config.enable_template_token_channel);
        let (exec, exec_tokens) = optional_channel(config.enable_exec_token_channel);
        let (invalid_tx, invalid_token) = mpsc::channel(1);

        let handler = Self {
            client,
            config,
            output,
            template,
            exec,
            invalid_token,
        };

        let outputs = AuthOutputs {
            tokens,
            template_tokens,
            exec_tokens,
            invalid_token: InvalidTokenNotifier { tx: invalid_tx },
        };

        (handler, outputs)
    }

    /// Runs the loop until `shutdown` is cancelled
    ///
    /// Returns an error only when the retry budget is exhausted. The method's
    /// shutdown hook is invoked and all output channels are closed before
    /// this returns.
    pub async fn run<M>(mut self, method: &M, shutdown: CancellationToken) -> Result<(), AuthError>
    where
        M: AuthMethod + ?Sized,
    {
        tracing::info!("starting auto-auth");
        let result = self.run_loop(method, &shutdown).await;
        method.shutdown().await;
        tracing::info!("auto-auth stopped");
        result
    }

    async fn run_loop<M>(&mut self, method: &M, shutdown: &CancellationToken) -> Result<(), AuthError>
    where
        M: AuthMethod + ?Sized,
    {
        let mut backoff = ErrorBackoffHandler::new(self.config.backoff.clone());
        let new_creds = if self.config.enable_reauth_on_new_credentials {
            method.new_creds()
        } else {
            None
        };
        let mut preloaded = self.config.token.take();

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let mut client = method.auth_client(&self.client);
            if let Some(ns) = &self.config.namespace {
                client.set_namespace(ns)?;
            }

            let (secret, wrapped) = if let Some(token) = &preloaded {
                let token_client = client.clone().with_token(token.as_str());
                let lookup = tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    r = token_client.lookup_self() => r,
                };

                match lookup {
                    Ok(secret) => {
                        preloaded = None;
                        (lookup_as_auth(secret), false)
                    }
                    Err(err) if err.is_transient() => {
                        tracing::warn!(error = %err, "could not look up preloaded token, retrying");
                        self.record_failure();
                        self.backoff_sleep(&mut backoff, shutdown, err.into()).await?;
                        continue;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "preloaded token is not valid, authenticating");
                        self.record_failure();
                        preloaded = None;
                        continue;
                    }
                }
            } else {
                let login = tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    r = self.login(&client, method) => r,
                };

                match login {
                    Ok(result) => result,
                    Err(err) => {
                        tracing::error!(error = %err, "error authenticating");
                        self.record_failure();
                        self.backoff_sleep(&mut backoff, shutdown, err).await?;
                        continue;
                    }
                }
            };

            if wrapped {
                let Some(wrap_info) = &secret.wrap_info else {
                    tracing::error!("login response was not wrapped");
                    self.record_failure();
                    self.backoff_sleep(&mut backoff, shutdown, AuthError::NotWrapped)
                        .await?;
                    continue;
                };

                let encoded = serde_json::to_string(wrap_info)?;
                tracing::info!("authentication successful, sending wrapped token");
                if !self.distribute(Token::new(encoded), shutdown).await {
                    return Ok(());
                }
                method.cred_success();
                backoff.success();
                self.record_success();

                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = notified(new_creds.as_deref()) => {
                        tracing::info!("auth method found new credentials, re-authenticating");
                        continue;
                    }
                }
            }

            let token = match secret.auth.as_ref() {
                None => Err(AuthError::NoAuth),
                Some(auth) if auth.client_token.is_empty() => Err(AuthError::EmptyToken),
                Some(auth) => Ok(Token::new(auth.client_token.clone())),
            };

            let token = match token {
                Ok(token) => token,
                Err(err) => {
                    tracing::error!(error = %err, "authentication returned no usable token");
                    self.record_failure();
                    self.backoff_sleep(&mut backoff, shutdown, err).await?;
                    continue;
                }
            };

            tracing::info!("authentication successful, sending token");
            if !self.distribute(token.clone(), shutdown).await {
                return Ok(());
            }
            method.cred_success();
            backoff.success();
            self.record_success();

            let mut watcher = LifetimeWatcher::start(client.with_token(token.as_str()), secret, 0);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    event = watcher.next() => match event {
                        WatcherEvent::Renewed(_) => {
                            tracing::info!("renewed auth token");
                            self.record_success();
                        }
                        WatcherEvent::Done(Ok(())) => {
                            tracing::info!("auth token reached the end of its lifetime, re-authenticating");
                            break;
                        }
                        WatcherEvent::Done(Err(err)) => {
                            tracing::warn!(error = %err, "auth token could not be renewed, re-authenticating");
                            self.record_failure();
                            break;
                        }
                    },
                    _ = notified(new_creds.as_deref()) => {
                        tracing::info!("auth method found new credentials, re-authenticating");
                        break;
                    }
                    Some(()) = self.invalid_token.recv() => {
                        tracing::info!("auth token was rejected as invalid, re-authenticating");
                        break;
                    }
                }
            }
        }
    }

    /// Logs in, returning the login response and whether it was wrapped
    #[tracing::instrument(level = "debug", err, skip(self, client, method))]
    async fn login<M>(&self, client: &Client, method: &M) -> Result<(Secret, bool), AuthError>
    where
        M: AuthMethod + ?Sized,
    {
        let login = method.authenticate(client).await?;
        let LoginRequest {
            path,
            headers,
            body,
        } = login.clone();

        if login.is_token_lookup() {
            let mut req = client.new_request(Method::GET, &api_path(&path));
            req.headers.extend(headers);

            let secret = client
                .send_checked(req)
                .await?
                .secret()?
                .ok_or(AuthError::NoAuth)?;

            return Ok((lookup_as_auth(secret), false));
        }

        let mut req = client
            .new_request(Method::PUT, &api_path(&path))
            .with_json(&body)?;
        req.headers.extend(headers);

        let wrapped = match self.config.wrap_ttl {
            Some(ttl) if !ttl.is_zero() => {
                req.headers.insert(
                    WRAP_TTL_HEADER,
                    HeaderValue::from_str(&format!("{}s", ttl.as_secs()))?,
                );
                true
            }
            _ => false,
        };

        let secret = client
            .send_checked(req)
            .await?
            .secret()?
            .ok_or(AuthError::NoAuth)?;

        Ok((secret, wrapped))
    }

    /// Sends a token to every enabled output; `false` if shut down meanwhile
    async fn distribute(&self, token: Token, shutdown: &CancellationToken) -> bool {
        let outputs = [Some(&self.output), self.template.as_ref(), self.exec.as_ref()];

        for tx in outputs.into_iter().flatten() {
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                sent = tx.send(token.clone()) => {
                    if sent.is_err() {
                        tracing::debug!("token receiver has gone away");
                    }
                }
            }
        }

        true
    }

    async fn backoff_sleep(
        &self,
        backoff: &mut ErrorBackoffHandler,
        shutdown: &CancellationToken,
        err: AuthError,
    ) -> Result<(), AuthError> {
        let Some(delay) = backoff.error() else {
            tracing::error!("retries exhausted, stopping auto-auth");
            return Err(AuthError::RetriesExhausted(Box::new(err)));
        };

        tracing::debug!(delay_ms = delay.as_millis() as u64, "backing off");
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }

        Ok(())
    }

    fn record_success(&self) {
        metrics::counter!(format!("{}.auth.success", self.config.metrics_signifier)).increment(1);
    }

    fn record_failure(&self) {
        metrics::counter!(format!("{}.auth.failure", self.config.metrics_signifier)).increment(1);
    }
}

fn optional_channel(enabled: bool) -> (Option<mpsc::Sender<Token>>, Option<mpsc::Receiver<Token>>) {
    if enabled {
        let (tx, rx) = mpsc::channel(1);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    }
}

async fn notified(notify: Option<&Notify>) {
    match notify {
        Some(notify) => notify.notified().await,
        None => future::pending().await,
    }
}

/// Shapes a token lookup response like a login response
fn lookup_as_auth(mut secret: Secret) -> Secret {
    if secret.auth.is_none() {
        secret.auth = Some(SecretAuth {
            client_token: secret.token_id().unwrap_or_default().to_owned(),
            accessor: secret.token_accessor().unwrap_or_default().to_owned(),
            lease_duration: secret.token_ttl(),
            renewable: secret.token_is_renewable(),
            ..SecretAuth::default()
        });
    }
    secret
}
