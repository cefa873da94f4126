//! Forwarding caller requests through the proxy chain

use std::time::SystemTime;

use axum::{
    body::Body,
    extract::{Request, State},
    response::Response,
};
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use lessor_api::TOKEN_HEADER;
use lessor_cache::{CacheMeta, SendRequest, SendResponse};

use crate::{error_response, redact, ProxyState, UseAutoAuth, MAX_REQUEST_SIZE};

const X_CACHE: &str = "x-cache";

/// Whether an upstream response rejects the token as invalid
pub(crate) fn is_invalid_token(status: StatusCode, body: &[u8]) -> bool {
    status == StatusCode::FORBIDDEN
        && std::str::from_utf8(body).map_or(false, |body| body.contains("invalid token"))
}

impl ProxyState {
    fn effective_token(&self, headers: &HeaderMap) -> String {
        let caller = headers
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        let auto_auth = || {
            self.auto_auth
                .get()
                .map(|token| token.as_str().to_owned())
                .unwrap_or_default()
        };

        match self.use_auto_auth {
            UseAutoAuth::Force => auto_auth(),
            UseAutoAuth::WhenMissing if caller.is_empty() => auto_auth(),
            _ => caller.to_owned(),
        }
    }
}

fn annotate(headers: &mut HeaderMap, meta: CacheMeta) {
    if !meta.hit {
        headers.insert(X_CACHE, HeaderValue::from_static("MISS"));
        return;
    }

    headers.insert(X_CACHE, HeaderValue::from_static("HIT"));
    headers.insert(header::AGE, HeaderValue::from(meta.age.as_secs()));
    if let Ok(date) = HeaderValue::from_str(&httpdate::fmt_http_date(SystemTime::now())) {
        headers.insert(header::DATE, date);
    }
}

fn build_response(resp: SendResponse, body: Bytes) -> Response {
    let mut headers = resp.response.headers;
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);
    if let Some(meta) = resp.cache_meta {
        annotate(&mut headers, meta);
    }

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = resp.response.status;
    *response.headers_mut() = headers;
    response
}

/// Answers any request not claimed by another route
pub(crate) async fn proxy(State(state): State<ProxyState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, MAX_REQUEST_SIZE).await {
        Ok(body) => body,
        Err(error) => {
            tracing::warn!(%error, "failed to read request body");
            return error_response(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };

    let token = state.effective_token(&parts.headers);
    let mut headers = parts.headers;
    headers.remove(TOKEN_HEADER);

    let req = SendRequest {
        token,
        method: parts.method,
        path: parts.uri.path().to_owned(),
        query: parts.uri.query().map(str::to_owned),
        headers,
        body,
    };

    let resp = match state.proxier.send(&req).await {
        Ok(resp) => resp,
        Err(error) => {
            tracing::error!(
                error = &error as &dyn std::error::Error,
                method = %req.method,
                path = %req.path,
                "failed to get a response from the upstream"
            );
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("failed to get the response: {}", error),
            );
        }
    };

    if state.use_auto_auth != UseAutoAuth::Never
        && is_invalid_token(resp.response.status, &resp.response.body)
        && state.auto_auth.is_current(&req.token)
    {
        match &state.invalid_token {
            Some(notifier) => notifier.notify(),
            None => tracing::debug!("auto-auth token rejected; no re-authentication configured"),
        }
    }

    let mut body = resp.response.body.clone();
    if resp.response.status.is_success() && redact::describes_auto_auth_token(&req, &state.auto_auth) {
        tracing::debug!(path = %req.path, "redacting auto-auth token from response");
        body = redact::redact(body);
    }

    build_response(resp, body)
}
