use std::{collections::HashMap, fmt};

use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::Url;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use serde::Serialize;
use serde_json::json;

use crate::{
    consistency::{IndexStateMiddleware, ReplicationStates},
    Error, Secret, NAMESPACE_HEADER, TOKEN_HEADER,
};

/// User agent sent when no other is configured
pub const DEFAULT_USER_AGENT: &str = concat!("lessor/", env!("CARGO_PKG_VERSION"));

/// A client for the upstream service
///
/// Cloning is cheap; the underlying connection pool is shared. Token,
/// namespace and header changes on a clone are local to that clone.
#[derive(Clone)]
pub struct Client {
    http: ClientWithMiddleware,
    address: Url,
    headers: HeaderMap,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("address", &self.address.as_str())
            .field("has_token", &self.headers.contains_key(TOKEN_HEADER))
            .field("namespace", &self.namespace())
            .finish()
    }
}

impl Client {
    /// Constructs a client for the upstream at `address`
    pub fn new(address: Url) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .map_err(Error::Build)?;

        Ok(Self::with_http(
            address,
            ClientBuilder::new(http).with(IndexStateMiddleware).build(),
        ))
    }

    /// Constructs a client around an existing middleware stack
    ///
    /// The stack should include [`IndexStateMiddleware`] if consistency
    /// tracking is wanted.
    pub fn with_http(address: Url, http: ClientWithMiddleware) -> Self {
        Self {
            http,
            address,
            headers: HeaderMap::new(),
        }
    }

    /// The upstream address
    pub fn address(&self) -> &Url {
        &self.address
    }

    /// The token attached to requests, if any
    pub fn token(&self) -> Option<&str> {
        self.headers
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|t| !t.is_empty())
    }

    /// Sets the token attached to requests
    ///
    /// An empty token clears it.
    pub fn set_token(&mut self, token: &str) -> Result<(), Error> {
        if token.is_empty() {
            self.headers.remove(TOKEN_HEADER);
            return Ok(());
        }

        let mut value = HeaderValue::from_str(token)?;
        value.set_sensitive(true);
        self.headers.insert(TOKEN_HEADER, value);
        Ok(())
    }

    /// Returns a clone of this client using `token`
    ///
    /// A token that cannot be sent as a header is dropped.
    pub fn with_token(mut self, token: &str) -> Self {
        if self.set_token(token).is_err() {
            tracing::warn!("token is not a valid header value; sending without a token");
            self.headers.remove(TOKEN_HEADER);
        }
        self
    }

    /// The namespace attached to requests, if any
    pub fn namespace(&self) -> Option<&str> {
        self.headers
            .get(NAMESPACE_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|ns| !ns.is_empty())
    }

    /// Sets the namespace attached to requests
    ///
    /// An empty namespace clears it.
    pub fn set_namespace(&mut self, namespace: &str) -> Result<(), Error> {
        if namespace.is_empty() {
            self.headers.remove(NAMESPACE_HEADER);
        } else {
            self.headers
                .insert(NAMESPACE_HEADER, HeaderValue::from_str(namespace)?);
        }
        Ok(())
    }

    /// Headers attached to every request
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Replaces the headers attached to every request
    ///
    /// The token and namespace are carried in these headers, so replacing
    /// them also replaces those.
    pub fn set_headers(&mut self, headers: HeaderMap) {
        self.headers = headers;
    }

    /// Sets the user agent sent with requests
    pub fn set_user_agent(&mut self, user_agent: &str) -> Result<(), Error> {
        self.headers
            .insert(header::USER_AGENT, HeaderValue::from_str(user_agent)?);
        Ok(())
    }

    /// Starts a request to `path`, an absolute path on the upstream
    ///
    /// The request carries this client's headers, token and namespace.
    pub fn new_request(&self, method: Method, path: &str) -> UpstreamRequest {
        UpstreamRequest {
            method,
            path: path.to_owned(),
            query: None,
            headers: self.headers.clone(),
            body: Bytes::new(),
            consistency: None,
        }
    }

    /// Sends a request, returning the response whatever its status
    #[tracing::instrument(
        level = "debug",
        err,
        skip(self, req),
        fields(method = %req.method, path = %req.path, status)
    )]
    pub async fn send(&self, req: UpstreamRequest) -> Result<UpstreamResponse, Error> {
        let mut url = self.address.clone();
        url.set_path(&req.path);
        url.set_query(req.query.as_deref().filter(|q| !q.is_empty()));

        let mut builder = self
            .http
            .request(req.method, url)
            .headers(req.headers)
            .body(req.body);

        if let Some(states) = req.consistency {
            builder = builder.with_extension(states);
        }

        let resp = builder.send().await.map_err(Error::Request)?;
        let status = resp.status();
        tracing::Span::current().record("status", status.as_u16());

        let headers = resp.headers().clone();
        let body = resp.bytes().await.map_err(Error::BodyRead)?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }

    /// Sends a request, failing on a non-success status
    pub async fn send_checked(&self, req: UpstreamRequest) -> Result<UpstreamResponse, Error> {
        self.send(req).await?.error_for_status()
    }

    /// Reads the secret at `path`, relative to the API root
    pub async fn read(&self, path: &str) -> Result<Option<Secret>, Error> {
        let req = self.new_request(Method::GET, &api_path(path));
        self.send_checked(req).await?.secret()
    }

    /// Writes `body` to `path`, relative to the API root
    pub async fn write<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<Option<Secret>, Error> {
        let req = self.new_request(Method::PUT, &api_path(path)).with_json(body)?;
        self.send_checked(req).await?.secret()
    }

    /// Looks up the client's own token
    pub async fn lookup_self(&self) -> Result<Secret, Error> {
        self.read("auth/token/lookup-self")
            .await?
            .ok_or(Error::EmptyResponse)
    }

    /// Renews the client's own token
    pub async fn renew_self(&self, increment: u64) -> Result<Secret, Error> {
        self.write("auth/token/renew-self", &json!({ "increment": increment }))
            .await?
            .ok_or(Error::EmptyResponse)
    }

    /// Renews the lease `lease_id` using the client's token
    pub async fn renew_lease(&self, lease_id: &str, increment: u64) -> Result<Secret, Error> {
        self.write(
            "sys/leases/renew",
            &json!({ "lease_id": lease_id, "increment": increment }),
        )
        .await?
        .ok_or(Error::EmptyResponse)
    }

    /// Fetches the capabilities of the client's token on each of `paths`
    ///
    /// Paths the upstream does not report on are omitted from the result.
    pub async fn capabilities_self(
        &self,
        paths: &[String],
    ) -> Result<HashMap<String, Vec<String>>, Error> {
        let secret = self
            .write("sys/capabilities-self", &json!({ "paths": paths }))
            .await?
            .ok_or(Error::EmptyResponse)?;

        let data = secret.data.unwrap_or_default();
        let mut capabilities = HashMap::with_capacity(paths.len());
        for path in paths {
            if let Some(caps) = data.get(path) {
                let caps: Vec<String> = serde_json::from_value(caps.clone())?;
                capabilities.insert(path.clone(), caps);
            }
        }

        Ok(capabilities)
    }
}

/// Builds an absolute upstream path from a path relative to the API root
pub fn api_path(path: &str) -> String {
    format!("/v1/{}", path.trim_start_matches('/'))
}

/// A request to the upstream
#[derive(Debug)]
pub struct UpstreamRequest {
    /// The request method
    pub method: Method,
    /// The absolute request path
    pub path: String,
    /// The raw query string, without the leading `?`
    pub query: Option<String>,
    /// The request headers
    pub headers: HeaderMap,
    /// The request body
    pub body: Bytes,
    /// Index states to assert and update, if tracking consistency
    pub consistency: Option<ReplicationStates>,
}

impl UpstreamRequest {
    /// Sets the raw query string
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Sets the request body
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Serializes `body` as the JSON request body
    pub fn with_json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, Error> {
        self.body = serde_json::to_vec(body)?.into();
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Ok(self)
    }

    /// Sets a header, replacing any existing value
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Tracks read-after-write consistency through `states`
    pub fn with_consistency(mut self, states: ReplicationStates) -> Self {
        self.consistency = Some(states);
        self
    }
}

/// A fully buffered response from the upstream
#[derive(Clone, Debug)]
pub struct UpstreamResponse {
    /// The response status
    pub status: StatusCode,
    /// The response headers
    pub headers: HeaderMap,
    /// The response body
    pub body: Bytes,
}

impl UpstreamResponse {
    /// Converts a non-success response into an error
    pub fn error_for_status(self) -> Result<Self, Error> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(Error::from_response(self.status, &self.body))
        }
    }

    /// Parses the body as a secret
    pub fn secret(&self) -> Result<Option<Secret>, Error> {
        Ok(Secret::parse(&self.body)?)
    }

    /// Whether the body is declared to be JSON
    pub fn is_json(&self) -> bool {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |ct| ct.starts_with("application/json"))
    }
}
