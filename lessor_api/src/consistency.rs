//! Read-after-write consistency tracking
//!
//! The upstream returns an opaque, signed index state with each write. A
//! later read may assert the states it has seen, letting the upstream refuse
//! or forward the request until it has caught up. The proxy cannot re-sign a
//! merged state, so it keeps the two most recent ones and sends both.

use std::sync::Arc;

use http::HeaderValue;
use parking_lot::RwLock;
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next, Result};

use crate::INDEX_HEADER;

const MAX_STATES: usize = 2;

/// Shared, accumulating set of index states
///
/// Clones share the same underlying states.
#[derive(Clone, Debug, Default)]
pub struct ReplicationStates {
    states: Arc<RwLock<Vec<String>>>,
}

impl ReplicationStates {
    /// Constructs an empty set of states
    pub fn new() -> Self {
        Self::default()
    }

    /// The states currently held, oldest first
    pub fn snapshot(&self) -> Vec<String> {
        self.states.read().clone()
    }

    /// Records a state returned by the upstream
    pub fn record(&self, state: &str) {
        let mut states = self.states.write();
        let merged = merge(&states, state);
        *states = merged;
    }
}

/// Merges a new state into an existing list, keeping the most recent ones
pub fn merge(existing: &[String], new: &str) -> Vec<String> {
    let mut merged: Vec<String> = existing
        .iter()
        .filter(|s| s.as_str() != new)
        .cloned()
        .collect();
    merged.push(new.to_owned());

    let excess = merged.len().saturating_sub(MAX_STATES);
    merged.drain(..excess);
    merged
}

/// Middleware that asserts and captures index states
///
/// Only requests whose extensions carry a [`ReplicationStates`] handle are
/// affected; all other requests pass through untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct IndexStateMiddleware;

#[async_trait::async_trait]
impl Middleware for IndexStateMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        let states = extensions.get::<ReplicationStates>().cloned();

        if let Some(states) = &states {
            let headers = req.headers_mut();
            headers.remove(INDEX_HEADER);
            for state in states.snapshot() {
                match HeaderValue::from_str(&state) {
                    Ok(value) => {
                        headers.append(INDEX_HEADER, value);
                    }
                    Err(_) => tracing::warn!("dropping index state that is not a valid header"),
                }
            }
        }

        let resp = next.run(req, extensions).await?;

        if let Some(states) = states {
            if let Some(state) = resp
                .headers()
                .get(INDEX_HEADER)
                .and_then(|v| v.to_str().ok())
                .filter(|s| !s.is_empty())
            {
                tracing::trace!("recording upstream index state");
                states.record(state);
            }
        }

        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use reqwest::Client;
    use reqwest_middleware::ClientBuilder;

    use super::*;

    #[test]
    fn merge_keeps_two_most_recent() {
        let states = merge(&[], "a");
        let states = merge(&states, "b");
        let states = merge(&states, "c");

        assert_eq!(states, ["b", "c"]);
    }

    #[test]
    fn merge_moves_repeated_state_to_the_end() {
        let states = merge(&["a".to_owned(), "b".to_owned()], "a");

        assert_eq!(states, ["b", "a"]);
    }

    struct StateEcho {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Middleware for StateEcho {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            let call = self.calls.fetch_add(1, Ordering::AcqRel);
            let sent: Vec<_> = req
                .headers()
                .get_all(INDEX_HEADER)
                .iter()
                .map(|v| v.to_str().unwrap().to_owned())
                .collect();

            let resp = http::Response::builder()
                .header(INDEX_HEADER, format!("state-{call}"))
                .header("x-sent-states", sent.join(","))
                .body(Vec::<u8>::new())
                .unwrap();

            Ok(resp.into())
        }
    }

    mod when_request_carries_states {
        use super::*;

        #[tokio::test]
        async fn states_accumulate_across_requests() {
            let echo = Arc::new(StateEcho {
                calls: AtomicUsize::new(0),
            });
            let client = ClientBuilder::new(Client::default())
                .with(IndexStateMiddleware)
                .with_arc(echo.clone())
                .build();
            let states = ReplicationStates::new();

            let mut last_sent = String::new();
            for _ in 0..3 {
                let resp = client
                    .get("http://upstream.local/v1/secret/foo")
                    .with_extension(states.clone())
                    .send()
                    .await
                    .unwrap();
                last_sent = resp.headers()["x-sent-states"].to_str().unwrap().to_owned();
            }

            assert_eq!(last_sent, "state-0,state-1");
            assert_eq!(states.snapshot(), ["state-1", "state-2"]);
        }
    }

    mod when_request_carries_no_states {
        use super::*;

        #[tokio::test]
        async fn no_index_header_is_sent() {
            let echo = Arc::new(StateEcho {
                calls: AtomicUsize::new(0),
            });
            let client = ClientBuilder::new(Client::default())
                .with(IndexStateMiddleware)
                .with_arc(echo.clone())
                .build();

            let resp = client
                .get("http://upstream.local/v1/secret/foo")
                .send()
                .await
                .unwrap();

            assert_eq!(resp.headers()["x-sent-states"], "");
        }
    }
}
