//! Periodic re-checking of which static secrets each token may read
//!
//! A static secret is shared by every token that has read it. To stop a
//! token that has since lost access from being served the cached copy, each
//! token's readable paths are re-checked with the upstream on an interval.
//! Paths the token can no longer read are dropped from its capabilities and
//! the token is removed from the secret's allowed set. Refreshes run on a
//! fair-share [`JobManager`], one queue per token.

use std::{collections::BTreeSet, fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use lessor_api::Client;
use lessor_fairshare::{Job, JobError, JobManager};
use tokio_util::sync::CancellationToken;

use crate::{entry::CapabilitiesEntry, error::CacheError, fingerprint, store::Store};

/// Default time between refreshes of a token's capabilities
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How to treat a token whose capabilities cannot be fetched
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RefreshBehaviour {
    /// Remove the token's access when the upstream refuses the check
    #[default]
    Pessimistic,
    /// Keep the token's access until the upstream reports otherwise
    Optimistic,
}

impl FromStr for RefreshBehaviour {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pessimistic" => Ok(Self::Pessimistic),
            "optimistic" => Ok(Self::Optimistic),
            other => Err(format!(
                "unknown refresh behaviour `{}`; expected pessimistic or optimistic",
                other
            )),
        }
    }
}

/// Configures capability refreshes
#[derive(Clone, Copy, Debug)]
pub struct CapabilityRefreshConfig {
    /// Time between refreshes of a token
    pub interval: Duration,
    /// Handling of tokens whose check fails
    pub behaviour: RefreshBehaviour,
    /// Number of concurrent refreshes; zero uses the job manager default
    pub workers: usize,
}

impl Default for CapabilityRefreshConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_REFRESH_INTERVAL,
            behaviour: RefreshBehaviour::default(),
            workers: 0,
        }
    }
}

/// Schedules capability refreshes
#[derive(Clone)]
pub struct CapabilityManager {
    inner: Arc<Inner>,
}

struct Inner {
    jobs: JobManager,
    client: Client,
    store: Store,
    config: CapabilityRefreshConfig,
    stop: CancellationToken,
}

impl fmt::Debug for CapabilityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityManager")
            .field("jobs", &self.inner.jobs)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl CapabilityManager {
    pub(crate) fn new(client: Client, store: Store, config: CapabilityRefreshConfig) -> Self {
        let jobs = JobManager::new("static-secret-capabilities", config.workers);
        jobs.start();

        Self {
            inner: Arc::new(Inner {
                jobs,
                client,
                store,
                config,
                stop: CancellationToken::new(),
            }),
        }
    }

    /// Starts periodic refreshes for `entry`
    ///
    /// The first refresh happens after one interval.
    pub fn start_renewing(&self, entry: &CapabilitiesEntry) {
        self.schedule(entry.id.clone());
    }

    fn schedule(&self, id: String) {
        let manager = self.clone();
        let interval = self.inner.config.interval;
        tokio::spawn(async move {
            tokio::select! {
                _ = manager.inner.stop.cancelled() => {}
                _ = tokio::time::sleep(interval) => {
                    let jobs = manager.inner.jobs.clone();
                    jobs.add_job(RefreshJob { id: id.clone(), manager }, &id);
                }
            }
        });
    }

    /// Stops all refreshes
    pub async fn stop(&self) {
        self.inner.stop.cancel();
        self.inner.jobs.stop().await;
    }

    /// Re-checks the capabilities recorded under `id` and reschedules
    #[tracing::instrument(level = "debug", err, skip(self))]
    pub(crate) async fn refresh(&self, id: &str) -> Result<(), RefreshError> {
        let entry = match self.inner.store.db.get_capabilities(id) {
            Ok(entry) => entry,
            Err(_) => {
                tracing::debug!("capabilities entry is gone; stopping refresh");
                return Ok(());
            }
        };

        let paths: Vec<String> = entry.readable_paths.iter().cloned().collect();
        let client = self.inner.client.clone().with_token(&entry.token);

        let capabilities = match client.capabilities_self(&paths).await {
            Ok(capabilities) => capabilities,
            Err(err) if !err.is_transient() && self.inner.config.behaviour == RefreshBehaviour::Pessimistic => {
                tracing::info!(paths = paths.len(), "capability check refused; revoking access to cached secrets");
                if self.revoke(&entry, &entry.readable_paths)? {
                    self.schedule(entry.id.clone());
                }
                return Err(err.into());
            }
            Err(err) => {
                self.schedule(entry.id.clone());
                return Err(err.into());
            }
        };

        let lost: BTreeSet<String> = entry
            .readable_paths
            .iter()
            .filter(|path| {
                !capabilities
                    .get(*path)
                    .map_or(false, |caps| caps.iter().any(|c| c == "read" || c == "root"))
            })
            .cloned()
            .collect();

        if !lost.is_empty() {
            tracing::debug!(lost = lost.len(), "token lost read access to cached secrets");
        }
        if self.revoke(&entry, &lost)? {
            self.schedule(entry.id.clone());
        }
        Ok(())
    }

    /// Takes `paths` away from the token of `entry`
    ///
    /// Only the given paths are touched, so paths recorded while the check
    /// was in flight survive. Returns whether the entry is still cached.
    fn revoke(&self, entry: &CapabilitiesEntry, paths: &BTreeSet<String>) -> Result<bool, CacheError> {
        self.remove_token_from(&entry.token, paths)?;
        self.inner.store.drop_readable_paths(&entry.id, paths)
    }

    fn remove_token_from(&self, token: &str, paths: &BTreeSet<String>) -> Result<(), CacheError> {
        for path in paths {
            self.inner
                .store
                .modify(&fingerprint::hash(path), |secret| {
                    secret.tokens.remove(token);
                })?;
        }
        Ok(())
    }
}

/// A failed capability refresh
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// The upstream check failed
    #[error("capability check failed")]
    Upstream(#[from] lessor_api::Error),
    /// The cache could not be updated
    #[error("failed to update cached capabilities")]
    Cache(#[from] CacheError),
}

#[derive(Debug)]
struct RefreshJob {
    id: String,
    manager: CapabilityManager,
}

#[async_trait]
impl Job for RefreshJob {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self) -> Result<(), JobError> {
        self.manager.refresh(&self.id).await?;
        Ok(())
    }

    fn on_failure(&self, error: JobError) {
        tracing::warn!(%error, "failed to refresh token capabilities");
    }
}
