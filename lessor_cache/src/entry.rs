//! Cached items and their renewal handles

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
    sync::Arc,
    time::SystemTime,
};

use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use lessor_api::UpstreamResponse;
use lessor_clock::UnixTime;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::StorageError;

/// The kind of a cache entry
///
/// The kind also names the persistent bucket the entry is written to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// An auto-auth token registered by the proxy itself
    Token,
    /// A renewable dynamic response: a lease, or a token minted through the proxy
    #[default]
    Lease,
    /// A KV secret shared by every token allowed to read it
    StaticSecret,
    /// The paths a token has been seen to read
    TokenCapabilities,
}

impl EntryType {
    /// All entry kinds, in restore order
    pub const ALL: [EntryType; 4] = [
        Self::Token,
        Self::Lease,
        Self::StaticSecret,
        Self::TokenCapabilities,
    ];

    /// The persistent bucket name for this kind
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::Lease => "lease",
            Self::StaticSecret => "static_secret",
            Self::TokenCapabilities => "token_capabilities",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| StorageError::UnknownBucket(s.to_owned()))
    }
}

/// An upstream response as held by the cache
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    /// Response status code
    pub status: u16,
    /// Response headers, in order
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Bytes,
}

impl StoredResponse {
    /// Captures an upstream response
    ///
    /// A `Date` header is added if the upstream did not send one, so that
    /// the age of a cache hit can always be computed.
    pub fn capture(resp: &UpstreamResponse, now: SystemTime) -> Self {
        let mut headers: Vec<(String, String)> = resp
            .headers
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_owned(), v.to_str().ok()?.to_owned())))
            .collect();

        if !resp.headers.contains_key(header::DATE) {
            headers.push((header::DATE.as_str().to_owned(), httpdate::fmt_http_date(now)));
        }

        Self {
            status: resp.status.as_u16(),
            headers,
            body: resp.body.clone(),
        }
    }

    /// Rebuilds the upstream response
    pub fn to_upstream(&self) -> UpstreamResponse {
        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (k, v) in &self.headers {
            if let (Ok(name), Ok(value)) = (HeaderName::from_str(k), HeaderValue::from_str(v)) {
                headers.append(name, value);
            }
        }

        UpstreamResponse {
            status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
            headers,
            body: self.body.clone(),
        }
    }

    /// The time the upstream generated the response
    pub fn date(&self) -> Option<SystemTime> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(header::DATE.as_str()))
            .and_then(|(_, v)| httpdate::parse_http_date(v).ok())
    }
}

/// Cancellation handles tying an entry's background renewal to its parent
///
/// Cancelling a context cancels every context derived from it. Closing
/// stops only this entry's renewal, leaving derived contexts running.
#[derive(Clone)]
pub struct RenewCtx(Arc<RenewCtxInner>);

struct RenewCtxInner {
    cancel: CancellationToken,
    done: CancellationToken,
}

impl fmt::Debug for RenewCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenewCtx")
            .field("cancelled", &self.0.cancel.is_cancelled())
            .field("closed", &self.0.done.is_cancelled())
            .finish()
    }
}

impl RenewCtx {
    /// A context cancelled along with `parent`
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self(Arc::new(RenewCtxInner {
            cancel: parent.child_token(),
            done: CancellationToken::new(),
        }))
    }

    /// Derives a context that is cancelled when this one is
    pub fn derive(&self) -> Self {
        Self::child_of(&self.0.cancel)
    }

    /// Cancels this context and everything derived from it
    pub fn cancel(&self) {
        self.0.cancel.cancel();
    }

    /// Stops this entry's renewal without touching derived contexts
    pub fn close(&self) {
        self.0.done.cancel();
    }

    /// Whether the context has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.0.cancel.is_cancelled()
    }

    /// Completes when the context is cancelled
    pub async fn cancelled(&self) {
        self.0.cancel.cancelled().await
    }

    /// Completes when the context is closed
    pub async fn closed(&self) {
        self.0.done.cancelled().await
    }

    /// Whether both handles refer to the same context
    pub fn same(&self, other: &RenewCtx) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A single cached item
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Entry {
    /// Request fingerprint; the primary key
    pub id: String,
    /// What kind of item this is
    #[serde(rename = "type")]
    pub kind: EntryType,
    /// Canonical namespace of the request, `root/` when none was given
    pub namespace: String,
    /// Path of the originating request
    pub request_path: String,
    /// Method of the originating request
    pub request_method: String,
    /// Headers of the originating request
    pub request_headers: Vec<(String, String)>,
    /// Token the originating request was made with
    pub request_token: String,
    /// The cached response
    pub response: Option<StoredResponse>,
    /// Responses for specific versions of a static secret
    pub versions: BTreeMap<u64, StoredResponse>,
    /// Token minted by the response
    pub token: String,
    /// Accessor of the minted token
    pub token_accessor: String,
    /// Token the minted token was created from
    pub token_parent: String,
    /// Tokens allowed to be served this static secret
    pub tokens: BTreeSet<String>,
    /// Lease issued by the response
    pub lease: String,
    /// Token the lease was created with
    pub lease_token: String,
    /// Last time the item was renewed
    pub last_renewed: UnixTime,
    /// Renewal handles; never persisted
    #[serde(skip)]
    pub renew_ctx: Option<RenewCtx>,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("namespace", &self.namespace)
            .field("request_path", &self.request_path)
            .field("request_method", &self.request_method)
            .field("lease", &self.lease)
            .field("has_token", &!self.token.is_empty())
            .field("has_parent", &!self.token_parent.is_empty())
            .field("tokens", &self.tokens.len())
            .field("versions", &self.versions.keys().collect::<Vec<_>>())
            .field("last_renewed", &self.last_renewed)
            .finish()
    }
}

impl Entry {
    /// Encodes the entry for the persistent store
    pub fn serialize(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// Decodes an entry read from the persistent store
    pub fn deserialize(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// The paths a token has been seen to read
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitiesEntry {
    /// Hash of the token
    pub id: String,
    /// The token
    pub token: String,
    /// Canonical static-secret paths the token may read
    pub readable_paths: BTreeSet<String>,
}

impl CapabilitiesEntry {
    /// Encodes the entry for the persistent store
    pub fn serialize(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// Decodes an entry read from the persistent store
    pub fn deserialize(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}
