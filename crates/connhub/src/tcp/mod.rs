//! Plaintext TCP transport.
//!
//! Dials and accepts `net:` addresses, runs the identity exchange in
//! [`handshake`], and announces every established session on a broadcast
//! channel. Good enough for local networks and tests; it does not encrypt.

mod handshake;
mod session;

pub use session::TcpSession;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use connhub_core::address;
use connhub_core::{PeerConnected, Session, SessionHandle, SessionId, Transport, TransportError};

const NOTICE_CAPACITY: usize = 64;

pub struct TcpTransport {
    this: Weak<TcpTransport>,
    local_key: String,
    local_addr: SocketAddr,
    ready: AtomicBool,
    notices: broadcast::Sender<PeerConnected>,
    sessions: DashMap<SessionId, Arc<TcpSession>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Bind `listen` and start accepting. Port 0 picks a free port; see
    /// [`local_address`](Self::local_address).
    pub async fn bind(local_key: String, listen: SocketAddr) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("failed to bind {listen}"))?;
        let local_addr = listener
            .local_addr()
            .context("failed to read bound address")?;
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        let transport = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            local_key,
            local_addr,
            ready: AtomicBool::new(true),
            notices,
            sessions: DashMap::new(),
            accept_task: Mutex::new(None),
        });
        let task = tokio::spawn(accept_loop(Arc::downgrade(&transport), listener));
        *transport
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        tracing::info!(addr = %local_addr, key = %transport.local_key, "tcp transport listening");
        Ok(transport)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Our listening endpoint as a dialable address.
    pub fn local_address(&self) -> String {
        address::net_address(
            &self.local_addr.ip().to_string(),
            self.local_addr.port(),
            &self.local_key,
        )
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Stop accepting and force-close every session.
    pub async fn shutdown(&self) {
        if let Some(task) = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        let open: Vec<_> = self.sessions.iter().map(|s| s.value().clone()).collect();
        for session in open {
            let _ = session.close(true).await;
        }
        self.sessions.clear();
        tracing::info!(addr = %self.local_addr, "tcp transport stopped");
    }

    fn register(
        &self,
        stream_local: SocketAddr,
        peer_addr: SocketAddr,
        done: handshake::Handshaken,
        initiator: bool,
    ) -> Arc<TcpSession> {
        let material = format!(
            "{}|{}|{}|{}",
            self.local_key, done.peer_key, stream_local, peer_addr
        );
        let id = SessionId::derive(material.as_bytes());
        let session = TcpSession::start(id, done.peer_key, peer_addr, done.reader, done.writer);
        self.sessions.insert(id, session.clone());

        let transport = self.this.clone();
        let watched = session.clone();
        tokio::spawn(async move {
            watched.closed().await;
            if let Some(transport) = transport.upgrade() {
                transport.sessions.remove(&watched.id());
            }
        });

        tracing::debug!(session = %id, peer = %session.peer_key(), %peer_addr, initiator, "session established");
        let _ = self.notices.send(PeerConnected {
            session: session.clone(),
            key: session.peer_key().to_string(),
            initiator,
        });
        session
    }
}

async fn accept_loop(transport: Weak<TcpTransport>, listener: TcpListener) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let Some(transport) = transport.upgrade() else { return };
        tokio::spawn(async move {
            if let Err(e) = respond(&transport, stream, peer_addr).await {
                tracing::debug!(%peer_addr, error = %e, "inbound handshake failed");
            }
        });
    }
}

async fn respond(
    transport: &TcpTransport,
    stream: TcpStream,
    peer_addr: SocketAddr,
) -> Result<(), TransportError> {
    let local = stream.local_addr()?;
    let done = handshake::exchange(stream, &transport.local_key, None).await?;
    transport.register(local, peer_addr, done, false);
    Ok(())
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_key(&self) -> &str {
        &self.local_key
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn connect(&self, address: &str) -> Result<SessionHandle, TransportError> {
        let (host, port) = address::net_host_port(address).ok_or_else(|| {
            TransportError::Io(Arc::new(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a net address: {address}"),
            )))
        })?;
        let expected = address::key_from_address(address).ok().flatten();

        tracing::debug!(%address, "dialing");
        let stream = TcpStream::connect((host, port)).await?;
        let local = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let done = handshake::exchange(stream, &self.local_key, expected.as_deref()).await?;
        Ok(self.register(local, peer_addr, done, true))
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
