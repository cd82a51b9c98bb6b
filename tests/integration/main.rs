//! connhub integration test harness.
//!
//! Every test runs real hubs over the TCP transport on 127.0.0.1, each on
//! its own ephemeral port, so tests can run in parallel.
//!
//!   RUST_LOG=connhub=debug cargo test --test integration

mod failures;
mod sessions;

use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use connhub::{identity, ConnHub, EventStream, HubConfig, HubEvent, HubEventKind, TcpTransport};

// ── Harness ───────────────────────────────────────────────────────────────────

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct Node {
    pub transport: Arc<TcpTransport>,
    pub hub: ConnHub,
}

impl Node {
    pub fn key(&self) -> &str {
        connhub::Transport::local_key(self.transport.as_ref())
    }

    pub fn address(&self) -> String {
        self.transport.local_address()
    }

    pub async fn stop(self) {
        self.hub.close();
        self.transport.shutdown().await;
    }
}

/// Default config with the keepalive probe off, unless a test needs it.
pub fn test_config() -> HubConfig {
    let mut config = HubConfig::default();
    config.ping.enabled = false;
    config.connect.wait_timeout_secs = 5;
    config
}

pub async fn spawn_node(config: HubConfig) -> Result<Node> {
    init_tracing();
    let transport = TcpTransport::bind(identity::generate(), "127.0.0.1:0".parse()?).await?;
    let hub = ConnHub::new(transport.clone(), config);
    Ok(Node { transport, hub })
}

/// An address nothing is listening on.
pub async fn dead_address() -> Result<String> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(connhub::address::net_address("127.0.0.1", port, &identity::generate()))
}

/// Next event, failing the test if none arrives in time.
pub async fn next_event(events: &mut EventStream) -> Result<HubEvent> {
    tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .context("timed out waiting for event")?
        .context("event stream ended")
}

/// Skip events until one of `kind` arrives.
pub async fn wait_for(events: &mut EventStream, kind: HubEventKind) -> Result<HubEvent> {
    loop {
        let event = next_event(events).await?;
        if event.kind == kind {
            return Ok(event);
        }
    }
}

/// Poll `check` until it holds or the event timeout passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            bail!("condition not met within {EVENT_TIMEOUT:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}
