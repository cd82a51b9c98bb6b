//! In-memory transport for hub unit tests.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, watch};

use connhub_core::address;
use connhub_core::identity;
use connhub_core::{PeerConnected, Session, SessionHandle, SessionId, Transport, TransportError};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingMode {
    Ok,
    Fail,
    Hang,
}

pub struct MockTransport {
    local_key: String,
    ready: AtomicBool,
    notices: broadcast::Sender<PeerConnected>,
    sessions: DashMap<SessionId, Arc<MockSession>>,
    dials: AtomicUsize,
    closes: Arc<AtomicUsize>,
    failures: Mutex<HashMap<String, io::ErrorKind>>,
    connect_delay: Mutex<Duration>,
    ping_mode: Mutex<PingMode>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (notices, _) = broadcast::channel(64);
        Arc::new(Self {
            local_key: identity::generate(),
            ready: AtomicBool::new(true),
            notices,
            sessions: DashMap::new(),
            dials: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            failures: Mutex::new(HashMap::new()),
            connect_delay: Mutex::new(Duration::ZERO),
            ping_mode: Mutex::new(PingMode::Ok),
        })
    }

    pub fn local_key_string(&self) -> String {
        self.local_key.clone()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = delay;
    }

    pub fn set_ping_mode(&self, mode: PingMode) {
        *self.ping_mode.lock().unwrap() = mode;
    }

    /// Make every dial of `address` fail with `kind`.
    pub fn fail_with(&self, address: &str, kind: io::ErrorKind) {
        self.failures.lock().unwrap().insert(address.to_string(), kind);
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Successful session closes, across all sessions.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<MockSession>> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    /// Register a session without announcing it.
    pub fn open_session(&self, key: String, remote: &str) -> Arc<MockSession> {
        let n = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        let (closed, _) = watch::channel(false);
        let session = Arc::new(MockSession {
            id: SessionId::derive(&n.to_le_bytes()),
            key,
            remote: remote.to_string(),
            closed,
            fail_close: AtomicBool::new(false),
            close_delay: Mutex::new(Duration::ZERO),
            ping_mode: *self.ping_mode.lock().unwrap(),
            closes: self.closes.clone(),
        });
        self.sessions.insert(session.id, session.clone());
        session
    }

    /// A peer dialled us.
    pub fn inbound(&self, key: &str, remote: &str) -> Arc<MockSession> {
        self.announce(key, remote, false)
    }

    /// A session we dialled, announced without going through `connect`.
    pub fn outbound(&self, key: &str, remote: &str) -> Arc<MockSession> {
        self.announce(key, remote, true)
    }

    fn announce(&self, key: &str, remote: &str, initiator: bool) -> Arc<MockSession> {
        let session = self.open_session(key.to_string(), remote);
        let _ = self.notices.send(PeerConnected {
            session: session.clone(),
            key: key.to_string(),
            initiator,
        });
        session
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn local_key(&self) -> &str {
        &self.local_key
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn connect(&self, address: &str) -> Result<SessionHandle, TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(kind) = self.failures.lock().unwrap().get(address).copied() {
            return Err(io::Error::new(kind, "mock dial failure").into());
        }
        let key = address::key_from_address(address)
            .ok()
            .flatten()
            .unwrap_or_else(identity::generate);
        Ok(self.announce(&key, address, true))
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerConnected> {
        self.notices.subscribe()
    }

    fn sessions(&self) -> Vec<SessionHandle> {
        self.sessions
            .iter()
            .filter(|s| !s.is_closed())
            .map(|s| s.value().clone() as SessionHandle)
            .collect()
    }
}

#[derive(Debug)]
pub struct MockSession {
    id: SessionId,
    key: String,
    remote: String,
    closed: watch::Sender<bool>,
    fail_close: AtomicBool,
    close_delay: Mutex<Duration>,
    ping_mode: PingMode,
    closes: Arc<AtomicUsize>,
}

impl MockSession {
    pub fn fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn set_close_delay(&self, delay: Duration) {
        *self.close_delay.lock().unwrap() = delay;
    }

    /// The remote end hung up.
    pub fn remote_close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl Session for MockSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn peer_key(&self) -> &str {
        &self.key
    }

    fn remote_address(&self) -> String {
        self.remote.clone()
    }

    async fn close(&self, _forced: bool) -> Result<(), TransportError> {
        let delay = *self.close_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock close failure").into());
        }
        if !self.closed.send_replace(true) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn ping(&self) -> Result<Duration, TransportError> {
        match self.ping_mode {
            PingMode::Ok => Ok(Duration::from_millis(2)),
            PingMode::Fail => Err(TransportError::SessionClosed),
            PingMode::Hang => std::future::pending().await,
        }
    }
}
