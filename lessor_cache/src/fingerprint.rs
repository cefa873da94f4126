//! Deterministic cache keys derived from requests

use http::HeaderName;
use lessor_api::{
    namespace, FORWARD_HEADER, INCONSISTENT_HEADER, INDEX_HEADER, NAMESPACE_HEADER, TOKEN_HEADER,
};
use ring::digest;

use crate::proxy::SendRequest;

/// Headers that do not take part in a request's identity
const UNHASHED_HEADERS: [&str; 4] = [INDEX_HEADER, FORWARD_HEADER, INCONSISTENT_HEADER, TOKEN_HEADER];

fn finish(ctx: digest::Context) -> String {
    hex::encode(ctx.finish().as_ref())
}

/// Hashes a single value
pub fn hash(value: &str) -> String {
    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(value.as_bytes());
    finish(ctx)
}

/// The cache ID of a dynamic-secret request
///
/// Covers the method, path, query, headers and body of the request, along
/// with the token it is made with. Consistency headers are left out, as
/// they change between otherwise identical requests.
pub fn dynamic_id(req: &SendRequest) -> String {
    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(req.method.as_str().as_bytes());
    ctx.update(b" ");
    ctx.update(req.path.as_bytes());
    if let Some(query) = req.query.as_deref().filter(|q| !q.is_empty()) {
        ctx.update(b"?");
        ctx.update(query.as_bytes());
    }
    ctx.update(b"\r\n");

    let mut headers: Vec<(&HeaderName, &[u8])> = req
        .headers
        .iter()
        .filter(|(name, _)| !UNHASHED_HEADERS.contains(&name.as_str()))
        .map(|(name, value)| (name, value.as_bytes()))
        .collect();
    headers.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));

    for (name, value) in headers {
        ctx.update(name.as_str().as_bytes());
        ctx.update(b": ");
        ctx.update(value);
        ctx.update(b"\r\n");
    }

    ctx.update(b"\r\n");
    ctx.update(&req.body);
    ctx.update(req.token.as_bytes());
    finish(ctx)
}

/// The canonical path of a static-secret request
///
/// The API prefix is removed and the namespace header, if any, is folded into
/// the path. Requests outside the API have no static path.
pub fn static_secret_path(req: &SendRequest) -> Option<String> {
    if !req.path.starts_with("/v1") {
        return None;
    }

    let ns = req
        .headers
        .get(NAMESPACE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    Some(canonicalize_static_path(&req.path, ns))
}

/// Folds `ns` into `request_path`, dropping the API prefix and leading slashes
pub fn canonicalize_static_path(request_path: &str, ns: &str) -> String {
    let path = request_path.strip_prefix("/v1").unwrap_or(request_path);
    let path = path.trim_start_matches('/');
    namespace::canonicalize(ns) + path
}

/// The cache ID of a static-secret request, shared by every token
pub fn static_id(req: &SendRequest) -> Option<String> {
    static_secret_path(req).map(|path| hash(&path))
}

/// The version requested with `?version=N`, or zero for the latest
pub fn requested_version(req: &SendRequest) -> u64 {
    req.query
        .as_deref()
        .unwrap_or_default()
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == "version")
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(0)
}
