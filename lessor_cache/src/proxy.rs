//! Forwarding requests to the upstream

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use lessor_api::{
    consistency::ReplicationStates, namespace, Client, UpstreamRequest, UpstreamResponse,
    DEFAULT_USER_AGENT, FORWARD_ACTIVE_NODE, INCONSISTENT_HEADER, NAMESPACE_HEADER, TOKEN_HEADER,
};
use metrics::counter;

use crate::error::ProxyError;

/// A request received by the proxy
#[derive(Clone)]
pub struct SendRequest {
    /// The token the request is made with, after any substitution
    pub token: String,
    /// The request method
    pub method: Method,
    /// The absolute request path
    pub path: String,
    /// The raw query string, without the leading `?`
    pub query: Option<String>,
    /// The request headers as received
    pub headers: HeaderMap,
    /// The fully buffered request body
    pub body: Bytes,
}

impl fmt::Debug for SendRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("query", &self.query)
            .field("has_token", &!self.token.is_empty())
            .field("body_len", &self.body.len())
            .finish()
    }
}

impl SendRequest {
    /// A bodiless request without a token
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            token: String::new(),
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// The namespace header sent with the request, if any
    pub fn namespace(&self) -> Option<&str> {
        self.headers
            .get(NAMESPACE_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|ns| !ns.is_empty())
    }
}

/// How a response relates to the cache
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheMeta {
    /// Whether the response was served from the cache
    pub hit: bool,
    /// Time since the upstream generated the response
    pub age: Duration,
}

/// A response to a [`SendRequest`]
#[derive(Clone, Debug)]
pub struct SendResponse {
    /// The upstream response
    pub response: UpstreamResponse,
    /// Cache information, when the response went through the cache
    pub cache_meta: Option<CacheMeta>,
}

impl SendResponse {
    /// Wraps an upstream response that did not go through the cache
    pub fn uncached(response: UpstreamResponse) -> Self {
        Self {
            response,
            cache_meta: None,
        }
    }
}

/// Something that can answer proxied requests
#[async_trait]
pub trait Proxier: Send + Sync {
    /// Answers `req`
    async fn send(&self, req: &SendRequest) -> Result<SendResponse, ProxyError>;
}

#[async_trait]
impl<P: Proxier + ?Sized> Proxier for Arc<P> {
    async fn send(&self, req: &SendRequest) -> Result<SendResponse, ProxyError> {
        (**self).send(req).await
    }
}

/// What to do when the upstream reports it has not caught up with a
/// required index state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WhenInconsistent {
    /// Return the upstream's response to the caller
    #[default]
    Fail,
    /// Retry the request a few times
    Retry,
    /// Ask the upstream to forward the request to its active node
    Forward,
}

impl FromStr for WhenInconsistent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail" => Ok(Self::Fail),
            "retry" => Ok(Self::Retry),
            "forward" => Ok(Self::Forward),
            other => Err(format!(
                "unknown inconsistency handling `{}`; expected fail, retry or forward",
                other
            )),
        }
    }
}

/// Builds the outgoing user agent from the caller's
pub type UserAgentFn = Arc<dyn Fn(Option<&str>) -> String + Send + Sync>;

/// The default user agent transform
///
/// Identifies the proxy and keeps the caller's user agent after it.
pub fn proxy_user_agent(incoming: Option<&str>) -> String {
    match incoming.filter(|ua| !ua.is_empty()) {
        Some(ua) => format!("{}; API proxy; {}", DEFAULT_USER_AGENT, ua),
        None => format!("{}; API proxy", DEFAULT_USER_AGENT),
    }
}

/// Configures an [`ApiProxy`]
#[derive(Clone)]
pub struct ApiProxyConfig {
    /// Track index states and assert them on later requests
    pub enforce_consistency: bool,
    /// Handling of responses refused for inconsistency
    pub when_inconsistent: WhenInconsistent,
    /// Prefix the request's namespace with the client's configured namespace
    pub prepend_configured_namespace: bool,
    /// Builds the outgoing user agent
    pub user_agent: UserAgentFn,
}

impl Default for ApiProxyConfig {
    fn default() -> Self {
        Self {
            enforce_consistency: false,
            when_inconsistent: WhenInconsistent::default(),
            prepend_configured_namespace: false,
            user_agent: Arc::new(proxy_user_agent),
        }
    }
}

impl fmt::Debug for ApiProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiProxyConfig")
            .field("enforce_consistency", &self.enforce_consistency)
            .field("when_inconsistent", &self.when_inconsistent)
            .field("prepend_configured_namespace", &self.prepend_configured_namespace)
            .finish_non_exhaustive()
    }
}

const INCONSISTENT_RETRIES: u32 = 3;
const INCONSISTENT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Headers never copied from the caller's request
const DROPPED_HEADERS: [header::HeaderName; 4] = [
    header::ACCEPT_ENCODING,
    header::HOST,
    header::CONTENT_LENGTH,
    header::CONNECTION,
];

/// Forwards requests to the upstream
#[derive(Clone, Debug)]
pub struct ApiProxy {
    client: Client,
    states: Option<ReplicationStates>,
    config: ApiProxyConfig,
}

impl ApiProxy {
    /// Constructs a proxy sending through `client`
    ///
    /// The client is never modified; each request uses a clone carrying the
    /// request's token.
    pub fn new(client: Client, config: ApiProxyConfig) -> Self {
        Self {
            client,
            states: config.enforce_consistency.then(ReplicationStates::new),
            config,
        }
    }

    fn build(&self, client: &Client, req: &SendRequest) -> UpstreamRequest {
        let mut fwd = client.new_request(req.method.clone(), &req.path);

        for (name, value) in &req.headers {
            if name == TOKEN_HEADER || DROPPED_HEADERS.contains(name) {
                continue;
            }
            fwd.headers.append(name.clone(), value.clone());
        }

        let incoming = req
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok());
        match HeaderValue::from_str(&(self.config.user_agent)(incoming)) {
            Ok(ua) => {
                fwd.headers.insert(header::USER_AGENT, ua);
            }
            Err(_) => tracing::warn!("user agent is not a valid header value; leaving as-is"),
        }

        if self.config.prepend_configured_namespace {
            if let Some(configured) = self.client.namespace() {
                let ns = namespace::canonicalize(configured) + req.namespace().unwrap_or_default();
                match HeaderValue::from_str(&ns) {
                    Ok(ns) => {
                        fwd.headers.insert(NAMESPACE_HEADER, ns);
                    }
                    Err(_) => tracing::warn!(%ns, "namespace is not a valid header value"),
                }
            }
        }

        if let Some(states) = &self.states {
            fwd = fwd.with_consistency(states.clone());
            if self.config.when_inconsistent == WhenInconsistent::Forward {
                fwd.headers.insert(
                    INCONSISTENT_HEADER,
                    HeaderValue::from_static(FORWARD_ACTIVE_NODE),
                );
            }
        }

        fwd.query = req.query.clone();
        fwd.body = req.body.clone();
        fwd
    }

    fn attempts(&self) -> u32 {
        if self.states.is_some() && self.config.when_inconsistent == WhenInconsistent::Retry {
            INCONSISTENT_RETRIES + 1
        } else {
            1
        }
    }
}

#[async_trait]
impl Proxier for ApiProxy {
    #[tracing::instrument(
        level = "debug",
        err,
        skip(self, req),
        fields(method = %req.method, path = %req.path)
    )]
    async fn send(&self, req: &SendRequest) -> Result<SendResponse, ProxyError> {
        let client = self.client.clone().with_token(&req.token);
        let attempts = self.attempts();

        let mut attempt = 1;
        let response = loop {
            let result = client.send(self.build(&client, req)).await;
            match result {
                Ok(resp) if resp.status == StatusCode::PRECONDITION_FAILED && attempt < attempts => {
                    tracing::debug!(attempt, "upstream has not caught up; retrying");
                    tokio::time::sleep(INCONSISTENT_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Ok(resp) => break resp,
                Err(error) => {
                    counter!("proxy.error").increment(1);
                    return Err(error.into());
                }
            }
        };

        if response.status.is_client_error() || response.status.is_server_error() {
            counter!("proxy.client_error").increment(1);
        } else {
            counter!("proxy.success").increment(1);
        }

        Ok(SendResponse::uncached(response))
    }
}
