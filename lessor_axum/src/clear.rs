//! The cache-clear admin endpoint

use axum::{
    extract::State,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http::StatusCode;
use lessor_cache::CacheClearInput;

use crate::{error_response, ProxyState};

/// Removes entries from the lease cache
///
/// Answers 400 when the selector is malformed and 500 when the cache fails.
pub(crate) async fn cache_clear(State(state): State<ProxyState>, body: Bytes) -> Response {
    let Some(cache) = &state.cache else {
        return error_response(StatusCode::NOT_FOUND, "caching is not enabled");
    };

    let input: CacheClearInput = match serde_json::from_slice(&body) {
        Ok(input) => input,
        Err(error) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("failed to parse cache-clear request: {}", error),
            )
        }
    };

    tracing::debug!(kind = %input.kind, "received cache-clear request");
    match cache.handle_cache_clear(input) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(error) if error.is_bad_request() => {
            error_response(StatusCode::BAD_REQUEST, &error.to_string())
        }
        Err(error) => {
            tracing::error!(error = &error as &dyn std::error::Error, "failed to clear cache");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("failed to clear cache: {}", error),
            )
        }
    }
}
