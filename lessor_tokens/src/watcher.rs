//! Background renewal of tokens and leases

use std::{future, time::Duration};

use lessor_api::{Client, Secret};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, Instant},
};

use crate::{
    backoff::{ErrorBackoffConfig, ErrorBackoffHandler, WithBackoff},
    jitter::{JitterSource, RandomEarlyJitter},
};

/// An error that ended a lifetime watcher
#[derive(Debug, Error)]
pub enum WatcherError {
    /// The upstream refused to renew the secret
    #[error("renewal was refused by the upstream")]
    Renew(#[from] lessor_api::Error),
    /// The secret carries neither a lease nor a token
    #[error("secret has neither a lease nor a token to renew")]
    NothingToRenew,
    /// The watcher task stopped without reporting an outcome
    #[error("lifetime watcher stopped unexpectedly")]
    Stopped,
}

/// A notification from a [`LifetimeWatcher`]
#[derive(Debug)]
pub enum WatcherEvent {
    /// The secret was renewed; carries the renewal response
    Renewed(Box<Secret>),
    /// The watcher has finished
    ///
    /// `Ok` means the secret reached the end of its lifetime. An error means
    /// renewal failed permanently.
    Done(Result<(), WatcherError>),
}

/// A background task keeping a token or lease alive
///
/// Auth secrets are renewed through the token's own renew-self endpoint;
/// anything else is renewed as a lease using the client's token. Renewal is
/// attempted immediately and then after roughly two thirds of each new
/// lifetime. Transient failures are retried until the secret enters its final
/// grace period, at which point the watcher waits out the remaining lifetime
/// and reports completion.
///
/// Dropping the watcher stops the task.
#[derive(Debug)]
pub struct LifetimeWatcher {
    events: mpsc::Receiver<WatcherEvent>,
    task: JoinHandle<()>,
}

impl LifetimeWatcher {
    /// Starts watching `secret`
    ///
    /// `increment` is the requested lifetime extension in seconds; zero lets
    /// the upstream choose.
    pub fn start(client: Client, secret: Secret, increment: u64) -> Self {
        let (tx, events) = mpsc::channel(1);
        let task = tokio::spawn(watch(client, secret, increment, tx));
        Self { events, task }
    }

    /// Waits for the next event
    ///
    /// Cancel-safe; suitable for use in `select!`. After the watcher has
    /// reported [`WatcherEvent::Done`], further calls report
    /// [`WatcherError::Stopped`].
    pub async fn next(&mut self) -> WatcherEvent {
        self.events
            .recv()
            .await
            .unwrap_or(WatcherEvent::Done(Err(WatcherError::Stopped)))
    }

    /// Stops the background task
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for LifetimeWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Target {
    Token(String),
    Lease(String),
}

impl Target {
    fn of(secret: &Secret) -> Option<Self> {
        match &secret.auth {
            Some(auth) if !auth.client_token.is_empty() => {
                Some(Self::Token(auth.client_token.clone()))
            }
            _ if !secret.lease_id.is_empty() => Some(Self::Lease(secret.lease_id.clone())),
            _ => None,
        }
    }

    fn lifetime(&self, secret: &Secret) -> (Duration, bool) {
        match (self, &secret.auth) {
            (Self::Token(_), Some(auth)) => {
                (Duration::from_secs(auth.lease_duration), auth.renewable)
            }
            _ => (Duration::from_secs(secret.lease_duration), secret.renewable),
        }
    }

    async fn renew(&self, client: &Client, increment: u64) -> Result<Secret, lessor_api::Error> {
        match self {
            Self::Token(token) => client.clone().with_token(token).renew_self(increment).await,
            Self::Lease(lease_id) => client.renew_lease(lease_id, increment).await,
        }
    }
}

/// Portion of the lifetime reserved at the end, in which no renewal is attempted
fn grace_period(lifetime: Duration, jitter: &mut impl JitterSource) -> Duration {
    jitter.jitter(lifetime / 10)
}

async fn watch(client: Client, secret: Secret, increment: u64, tx: mpsc::Sender<WatcherEvent>) {
    let Some(target) = Target::of(&secret) else {
        let _ = tx.send(WatcherEvent::Done(Err(WatcherError::NothingToRenew))).await;
        return;
    };

    let mut jitter = RandomEarlyJitter::new(0.5);
    let (lifetime, renewable) = target.lifetime(&secret);

    if !renewable {
        if lifetime.is_zero() {
            tracing::debug!("secret does not expire and cannot be renewed; idling");
            future::pending::<()>().await;
        }

        let grace = grace_period(lifetime, &mut jitter);
        tracing::debug!(
            lifetime_secs = lifetime.as_secs(),
            "secret is not renewable, waiting for it to expire"
        );
        time::sleep(lifetime - grace).await;
        let _ = tx.send(WatcherEvent::Done(Ok(()))).await;
        return;
    }

    let mut backoff = ErrorBackoffHandler::new(ErrorBackoffConfig::default());
    let mut expires_at = Instant::now() + lifetime;
    let mut grace = grace_period(lifetime, &mut jitter);

    loop {
        let next_delay = match target.renew(&client, increment).await.with_backoff(&mut backoff) {
            Ok(renewed) => {
                let (lifetime, renewable) = target.lifetime(&renewed);
                expires_at = Instant::now() + lifetime;
                grace = grace_period(lifetime, &mut jitter);

                tracing::debug!(lifetime_secs = lifetime.as_secs(), "renewed secret");
                if tx.send(WatcherEvent::Renewed(Box::new(renewed))).await.is_err() {
                    return;
                }

                if !renewable {
                    tracing::debug!("secret is no longer renewable");
                    Duration::MAX
                } else {
                    RandomEarlyJitter::new(0.1).jitter(lifetime * 2 / 3)
                }
            }
            Err((err, _)) if !err.is_transient() => {
                tracing::warn!(error = %err, "renewal was refused");
                let _ = tx.send(WatcherEvent::Done(Err(err.into()))).await;
                return;
            }
            Err((err, delay)) => {
                tracing::warn!(error = %err, "renewal failed, will retry");
                delay.unwrap_or(Duration::MAX)
            }
        };

        // A renewal granting no lifetime leaves nothing to wait for
        let remaining = expires_at.saturating_duration_since(Instant::now());
        if remaining <= grace || next_delay >= remaining - grace {
            tracing::debug!(
                remaining_secs = remaining.as_secs(),
                "secret within its grace period, waiting for expiry"
            );
            time::sleep(remaining).await;
            let _ = tx.send(WatcherEvent::Done(Ok(()))).await;
            return;
        }

        time::sleep(next_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use lessor_api::testing::{json_response, MockUpstream};
    use serde_json::json;

    use super::*;

    fn auth_secret(token: &str, ttl: u64, renewable: bool) -> Secret {
        serde_json::from_value(json!({
            "auth": {
                "client_token": token,
                "accessor": "acc",
                "lease_duration": ttl,
                "renewable": renewable,
            }
        }))
        .unwrap()
    }

    fn lease_secret(lease_id: &str, ttl: u64) -> Secret {
        serde_json::from_value(json!({
            "lease_id": lease_id,
            "lease_duration": ttl,
            "renewable": true,
        }))
        .unwrap()
    }

    mod when_renewal_succeeds {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn token_is_renewed_as_itself() {
            let upstream = Arc::new(MockUpstream::new(|_| {
                json_response(
                    200,
                    json!({ "auth": { "client_token": "s.tok", "lease_duration": 60, "renewable": true } }),
                )
            }));

            let mut watcher = LifetimeWatcher::start(upstream.client(), auth_secret("s.tok", 60, true), 0);

            assert!(matches!(watcher.next().await, WatcherEvent::Renewed(_)));
            assert!(matches!(watcher.next().await, WatcherEvent::Renewed(_)));

            let reqs = upstream.requests();
            assert_eq!(reqs[0].path, "/v1/auth/token/renew-self");
            assert_eq!(reqs[0].token(), Some("s.tok"));
        }

        #[tokio::test(start_paused = true)]
        async fn lease_is_renewed_by_id() {
            let upstream = Arc::new(MockUpstream::new(|_| {
                json_response(
                    200,
                    json!({ "lease_id": "db/creds/1", "lease_duration": 30, "renewable": true }),
                )
            }));

            let client = upstream.client().with_token("s.parent");
            let mut watcher = LifetimeWatcher::start(client, lease_secret("db/creds/1", 30), 0);

            assert!(matches!(watcher.next().await, WatcherEvent::Renewed(_)));

            let reqs = upstream.requests();
            assert_eq!(reqs[0].path, "/v1/sys/leases/renew");
            assert_eq!(reqs[0].json()["lease_id"], "db/creds/1");
            assert_eq!(reqs[0].token(), Some("s.parent"));
        }

        #[tokio::test(start_paused = true)]
        async fn lifetime_capped_by_upstream_ends_in_done() {
            let upstream = Arc::new(MockUpstream::new(|_| {
                json_response(
                    200,
                    json!({ "lease_id": "db/creds/1", "lease_duration": 0, "renewable": true }),
                )
            }));

            let mut watcher = LifetimeWatcher::start(upstream.client(), lease_secret("db/creds/1", 30), 0);

            assert!(matches!(watcher.next().await, WatcherEvent::Renewed(_)));
            assert!(matches!(watcher.next().await, WatcherEvent::Done(Ok(()))));
        }
    }

    mod when_renewal_grants_no_lifetime {
        use super::*;

        fn zero_ttl_upstream() -> Arc<MockUpstream> {
            Arc::new(MockUpstream::new(|_| {
                json_response(
                    200,
                    json!({ "auth": { "client_token": "s.tok", "lease_duration": 0, "renewable": true } }),
                )
            }))
        }

        #[tokio::test(start_paused = true)]
        async fn watcher_is_done_at_once() {
            let upstream = zero_ttl_upstream();
            let started = Instant::now();

            let mut watcher = LifetimeWatcher::start(upstream.client(), auth_secret("s.tok", 60, true), 0);

            assert!(matches!(watcher.next().await, WatcherEvent::Renewed(_)));
            assert!(matches!(watcher.next().await, WatcherEvent::Done(Ok(()))));
            assert_eq!(started.elapsed(), Duration::ZERO);
        }

        #[tokio::test(start_paused = true)]
        async fn no_further_renewal_is_attempted() {
            let upstream = zero_ttl_upstream();

            let mut watcher = LifetimeWatcher::start(upstream.client(), auth_secret("s.tok", 60, true), 0);
            while !matches!(watcher.next().await, WatcherEvent::Done(_)) {}
            time::sleep(Duration::from_secs(3600)).await;

            assert_eq!(upstream.calls_to("/v1/auth/token/renew-self"), 1);
        }
    }

    mod when_renewal_fails {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn permanent_failure_is_terminal() {
            let upstream = Arc::new(MockUpstream::new(|_| {
                json_response(403, json!({ "errors": ["permission denied"] }))
            }));

            let mut watcher = LifetimeWatcher::start(upstream.client(), lease_secret("db/creds/1", 30), 0);

            match watcher.next().await {
                WatcherEvent::Done(Err(WatcherError::Renew(err))) => {
                    assert!(err.is_permission_denied())
                }
                other => panic!("unexpected event: {other:?}"),
            }
            assert_eq!(upstream.total_calls(), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn transient_failures_are_retried_until_expiry() {
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = calls.clone();
            let upstream = Arc::new(MockUpstream::new(move |_| {
                counter.fetch_add(1, Ordering::AcqRel);
                json_response(503, json!({ "errors": [] }))
            }));

            let mut watcher = LifetimeWatcher::start(upstream.client(), lease_secret("db/creds/1", 600), 0);

            assert!(matches!(watcher.next().await, WatcherEvent::Done(Ok(()))));
            assert!(calls.load(Ordering::Acquire) > 1);
        }
    }

    mod when_secret_is_not_renewable {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn watcher_waits_for_expiry_without_calling_upstream() {
            let upstream = Arc::new(MockUpstream::new(|_| json_response(200, json!({}))));

            let start = Instant::now();
            let mut watcher = LifetimeWatcher::start(upstream.client(), auth_secret("s.tok", 100, false), 0);

            assert!(matches!(watcher.next().await, WatcherEvent::Done(Ok(()))));
            assert!(start.elapsed() >= Duration::from_secs(90));
            assert_eq!(upstream.total_calls(), 0);
        }

        #[tokio::test]
        async fn secret_without_lease_or_token_is_rejected() {
            let upstream = Arc::new(MockUpstream::new(|_| json_response(200, json!({}))));

            let mut watcher = LifetimeWatcher::start(upstream.client(), Secret::default(), 0);

            assert!(matches!(
                watcher.next().await,
                WatcherEvent::Done(Err(WatcherError::NothingToRenew))
            ));
        }
    }
}
