//! Lifecycle events published by the hub.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use connhub_core::{SessionHandle, SessionId, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HubEventKind {
    Connecting,
    Connected,
    ConnectingFailed,
    Disconnecting,
    DisconnectingFailed,
    Disconnected,
    Ping,
    PingFailed,
}

impl HubEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HubEventKind::Connecting => "connecting",
            HubEventKind::Connected => "connected",
            HubEventKind::ConnectingFailed => "connecting-failed",
            HubEventKind::Disconnecting => "disconnecting",
            HubEventKind::DisconnectingFailed => "disconnecting-failed",
            HubEventKind::Disconnected => "disconnected",
            HubEventKind::Ping => "ping",
            HubEventKind::PingFailed => "ping-failed",
        }
    }
}

impl fmt::Display for HubEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra payload attached to some events.
#[derive(Debug, Clone)]
pub enum EventDetails {
    /// `connected`: the live session and whether we dialled it.
    Session {
        session: SessionHandle,
        initiator: bool,
    },
    /// `connecting-failed`, `disconnecting-failed`, `ping-failed`.
    Error(TransportError),
    /// `ping`: the probe that was just started.
    Probe(ProbeHandle),
}

#[derive(Debug, Clone)]
pub struct HubEvent {
    pub kind: HubEventKind,
    pub address: String,
    pub key: Option<String>,
    pub details: Option<EventDetails>,
}

impl HubEvent {
    pub fn new(kind: HubEventKind, address: &str, key: Option<String>) -> Self {
        Self {
            kind,
            address: address.to_string(),
            key,
            details: None,
        }
    }

    pub fn with_details(mut self, details: EventDetails) -> Self {
        self.details = Some(details);
        self
    }

    pub fn error(&self) -> Option<&TransportError> {
        match &self.details {
            Some(EventDetails::Error(e)) => Some(e),
            _ => None,
        }
    }

    pub fn session(&self) -> Option<&SessionHandle> {
        match &self.details {
            Some(EventDetails::Session { session, .. }) => Some(session),
            _ => None,
        }
    }

    pub fn probe(&self) -> Option<&ProbeHandle> {
        match &self.details {
            Some(EventDetails::Probe(p)) => Some(p),
            _ => None,
        }
    }
}

// ── Probe handle ──────────────────────────────────────────────────────────────

/// Shared view of a running keepalive probe.
#[derive(Debug, Clone)]
pub struct ProbeHandle {
    session_id: SessionId,
    timeout: Duration,
    stats: Arc<ProbeStats>,
}

#[derive(Debug, Default)]
struct ProbeStats {
    pings: AtomicU64,
    failures: AtomicU64,
    // 0 = no successful ping yet
    last_rtt_micros: AtomicU64,
}

impl ProbeHandle {
    pub fn new(session_id: SessionId, timeout: Duration) -> Self {
        Self {
            session_id,
            timeout,
            stats: Arc::new(ProbeStats::default()),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Successful round trips so far.
    pub fn pings(&self) -> u64 {
        self.stats.pings.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.stats.failures.load(Ordering::Relaxed)
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        match self.stats.last_rtt_micros.load(Ordering::Relaxed) {
            0 => None,
            micros => Some(Duration::from_micros(micros)),
        }
    }

    pub fn record_success(&self, rtt: Duration) {
        self.stats.pings.fetch_add(1, Ordering::Relaxed);
        let micros = (rtt.as_micros() as u64).max(1);
        self.stats.last_rtt_micros.store(micros, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
    }
}
