//! A scripted stand-in for the upstream service
//!
//! [`MockUpstream`] is a terminal middleware: it records every request that
//! reaches it and answers from a closure, without touching the network.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use parking_lot::Mutex;
use reqwest::{Request, Response, Url};
use reqwest_middleware::{ClientBuilder, Middleware, Next, Result};

use crate::{consistency::IndexStateMiddleware, Client};

/// Address used by clients built from a [`MockUpstream`]
pub const MOCK_ADDRESS: &str = "http://upstream.test";

type Responder = dyn Fn(&RecordedRequest) -> http::Response<Vec<u8>> + Send + Sync;

/// A request observed by a [`MockUpstream`]
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    /// The request method
    pub method: Method,
    /// The request path
    pub path: String,
    /// The raw query string
    pub query: Option<String>,
    /// The request headers
    pub headers: HeaderMap,
    /// The request body
    pub body: Bytes,
}

impl RecordedRequest {
    /// The token the request was sent with
    pub fn token(&self) -> Option<&str> {
        self.headers
            .get(crate::TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
    }

    /// The body parsed as JSON, or `Null`
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or_default()
    }
}

/// A terminal middleware answering requests from a closure
pub struct MockUpstream {
    responder: Box<Responder>,
    requests: Mutex<Vec<RecordedRequest>>,
    delay: Duration,
}

impl std::fmt::Debug for MockUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockUpstream")
            .field("requests", &self.requests.lock().len())
            .field("delay", &self.delay)
            .finish()
    }
}

impl MockUpstream {
    /// Constructs a mock that answers every request with `responder`
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&RecordedRequest) -> http::Response<Vec<u8>> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// Delays each response by `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// A client whose requests are answered by this mock
    pub fn client(self: &Arc<Self>) -> Client {
        let http = ClientBuilder::new(reqwest::Client::new())
            .with(IndexStateMiddleware)
            .with_arc(self.clone())
            .build();

        let address = Url::parse(MOCK_ADDRESS).expect("mock address is a valid url");
        Client::with_http(address, http)
    }

    /// Every request observed so far, in arrival order
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests observed for `path`
    pub fn calls_to(&self, path: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.path == path)
            .count()
    }

    /// Total number of requests observed
    pub fn total_calls(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait::async_trait]
impl Middleware for MockUpstream {
    async fn handle(
        &self,
        req: Request,
        _: &mut http::Extensions,
        _: Next<'_>,
    ) -> Result<Response> {
        let recorded = RecordedRequest {
            method: req.method().clone(),
            path: req.url().path().to_owned(),
            query: req.url().query().map(str::to_owned),
            headers: req.headers().clone(),
            body: req
                .body()
                .and_then(|b| b.as_bytes())
                .map(Bytes::copy_from_slice)
                .unwrap_or_default(),
        };
        self.requests.lock().push(recorded.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        Ok((self.responder)(&recorded).into())
    }
}

/// A JSON response with the given status
pub fn json_response(status: u16, body: serde_json::Value) -> http::Response<Vec<u8>> {
    let mut resp = http::Response::new(serde_json::to_vec(&body).unwrap_or_default());
    *resp.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    resp
}

/// A bodiless response with the given status
pub fn empty_response(status: u16) -> http::Response<Vec<u8>> {
    let mut resp = http::Response::new(Vec::new());
    *resp.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    resp
}
