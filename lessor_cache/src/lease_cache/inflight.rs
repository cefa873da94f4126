//! Coalescing of concurrent identical requests

use std::sync::Arc;

use dashmap::{mapref::entry::Entry as MapEntry, DashMap};
use tokio_util::sync::CancellationToken;

/// Requests currently being answered by the upstream, keyed by cache ID
#[derive(Debug, Default)]
pub(super) struct Inflight {
    requests: DashMap<String, Arc<CancellationToken>>,
}

/// Held by the request answering for an ID; releases waiters when dropped
#[derive(Debug)]
pub(super) struct InflightGuard<'a> {
    owner: &'a Inflight,
    id: String,
    done: Arc<CancellationToken>,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.done.cancel();
        self.owner
            .requests
            .remove_if(&self.id, |_, done| Arc::ptr_eq(done, &self.done));
    }
}

impl Inflight {
    /// Claims `id`, or waits for the request that already holds it
    ///
    /// Returns a guard if this caller now answers for `id`. A caller that
    /// waited gets `None` once the holder finishes and should look in the
    /// cache again.
    pub(super) async fn claim(&self, id: &str) -> Option<InflightGuard<'_>> {
        let waiting = match self.requests.entry(id.to_owned()) {
            MapEntry::Occupied(existing) => existing.get().clone(),
            MapEntry::Vacant(slot) => {
                let done = Arc::new(CancellationToken::new());
                slot.insert(done.clone());
                return Some(InflightGuard {
                    owner: self,
                    id: id.to_owned(),
                    done,
                });
            }
        };

        tracing::trace!(%id, "waiting on in-flight request");
        waiting.cancelled().await;
        None
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.requests.len()
    }
}
