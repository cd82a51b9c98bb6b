//! Inbound correlation: matches transport session announcements against
//! the registry by identity key.
//!
//! Runs as one background task per hub for the hub's whole life. An outbound
//! session can be announced before its `connect()` has registered it; such
//! notices are re-queued a bounded number of times before being dropped.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::sync::{broadcast, watch};

use connhub_core::config::CorrelationConfig;
use connhub_core::{PeerConnected, SessionId};

use crate::hub::{shutdown_signal, Attach, Inner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Correlation {
    Ignored,
    Attached,
    /// Initiator session with no matching record yet.
    Retry,
}

impl Inner {
    pub(crate) fn correlate(self: &Arc<Self>, notice: &PeerConnected, may_retry: bool) -> Correlation {
        let session = &notice.session;
        if self.is_closed() || notice.key == self.transport.local_key() {
            return Correlation::Ignored;
        }

        if !self.transport.is_ready() {
            tracing::debug!(session = %session.id(), peer = %notice.key, "server not ready, closing session");
            let session = session.clone();
            tokio::spawn(async move {
                let _ = session.close(true).await;
            });
            return Correlation::Ignored;
        }

        if let Some((address, _)) = self.registry.find_by_key(&notice.key) {
            return match self.attach(&address, session.clone(), notice.initiator) {
                Attach::Rejected => Correlation::Ignored,
                Attach::Attached | Attach::AlreadyAttached => Correlation::Attached,
            };
        }

        if notice.initiator {
            if may_retry {
                return Correlation::Retry;
            }
            tracing::debug!(
                peer = %notice.key,
                session = %session.id(),
                "connected to us, but not via connhub"
            );
            return Correlation::Ignored;
        }

        let address = session.remote_address();
        tracing::debug!(%address, peer = %notice.key, "inbound session, synthesizing record");
        match self.attach(&address, session.clone(), false) {
            Attach::Rejected => Correlation::Ignored,
            Attach::Attached | Attach::AlreadyAttached => Correlation::Attached,
        }
    }
}

/// Correlation loop. Exits when the hub closes or is dropped, or the
/// transport stops announcing.
pub(crate) async fn run(
    hub: Weak<Inner>,
    mut notices: broadcast::Receiver<PeerConnected>,
    mut shutdown: watch::Receiver<bool>,
    policy: CorrelationConfig,
) {
    let mut pending: FuturesUnordered<BoxFuture<'static, PeerConnected>> = FuturesUnordered::new();
    let mut attempts: HashMap<SessionId, u32> = HashMap::new();

    loop {
        let notice = tokio::select! {
            _ = shutdown_signal(&mut shutdown) => break,
            received = notices.recv() => match received {
                Ok(notice) => notice,
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    tracing::warn!(lagged = count, "correlator lagged, session announcements dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some(notice) = pending.next(), if !pending.is_empty() => notice,
        };

        let Some(inner) = hub.upgrade() else { break };
        let id = notice.session.id();
        let used = attempts.get(&id).copied().unwrap_or(0);

        match inner.correlate(&notice, used < policy.retries) {
            Correlation::Retry => {
                attempts.insert(id, used + 1);
                tracing::trace!(session = %id, attempt = used + 1, "no record yet, retrying correlation");
                let delay = policy.retry_interval();
                pending.push(
                    async move {
                        tokio::time::sleep(delay).await;
                        notice
                    }
                    .boxed(),
                );
            }
            Correlation::Attached | Correlation::Ignored => {
                attempts.remove(&id);
            }
        }
    }

    tracing::debug!("correlator stopped");
}
