//! Keepalive probe for sessions we dialled.
//!
//! Pings on a fixed interval and reports failures on the event bus. It never
//! closes the session; that stays the transport's call.

use tokio::sync::watch;

use connhub_core::config::PingConfig;
use connhub_core::{SessionHandle, TransportError};
use connhub_services::{EventBus, EventDetails, HubEvent, HubEventKind, ProbeHandle};

use crate::hub::shutdown_signal;

/// Start probing `session`. Publishes a `ping` event carrying the returned
/// handle before the first cycle.
pub(crate) fn spawn(
    events: EventBus,
    address: String,
    key: Option<String>,
    session: SessionHandle,
    config: PingConfig,
    mut shutdown: watch::Receiver<bool>,
) -> ProbeHandle {
    let probe = ProbeHandle::new(session.id(), config.timeout());
    events.publish(
        HubEvent::new(HubEventKind::Ping, &address, key.clone())
            .with_details(EventDetails::Probe(probe.clone())),
    );

    let handle = probe.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal(&mut shutdown) => {}
            _ = session.closed() => {}
            _ = probe_loop(&events, &address, &key, &session, &config, &probe) => {}
        }
        tracing::trace!(%address, pings = probe.pings(), failures = probe.failures(), "probe stopped");
    });
    handle
}

async fn probe_loop(
    events: &EventBus,
    address: &str,
    key: &Option<String>,
    session: &SessionHandle,
    config: &PingConfig,
    probe: &ProbeHandle,
) {
    let limit = config.timeout();
    loop {
        tokio::time::sleep(config.interval()).await;

        let error = match tokio::time::timeout(limit, session.ping()).await {
            Ok(Ok(rtt)) => {
                probe.record_success(rtt);
                tracing::trace!(%address, ?rtt, "pong");
                continue;
            }
            Ok(Err(e)) => e,
            Err(_) => TransportError::Timeout(limit),
        };

        probe.record_failure();
        tracing::warn!(%address, session = %session.id(), error = %error, "ping failed");
        events.publish(
            HubEvent::new(HubEventKind::PingFailed, address, key.clone())
                .with_details(EventDetails::Error(error)),
        );
    }
}
