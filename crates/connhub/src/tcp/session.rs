//! A line-framed TCP session.
//!
//! After the handshake the only traffic is `PING <n>` / `PONG <n>`. A reader
//! task answers pings and completes our own; EOF or a read error closes the
//! session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use connhub_core::address;
use connhub_core::{Session, SessionId, TransportError};

pub struct TcpSession {
    id: SessionId,
    peer_key: String,
    peer_addr: SocketAddr,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    next_ping: AtomicU64,
    closed: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TcpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSession")
            .field("id", &self.id)
            .field("peer_key", &self.peer_key)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &*self.closed.borrow())
            .finish()
    }
}

impl TcpSession {
    pub(crate) fn start(
        id: SessionId,
        peer_key: String,
        peer_addr: SocketAddr,
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    ) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        let session = Arc::new(Self {
            id,
            peer_key,
            peer_addr,
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            next_ping: AtomicU64::new(0),
            closed,
            reader: Mutex::new(None),
        });
        let task = tokio::spawn(read_loop(Arc::downgrade(&session), reader));
        *session.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        session
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn mark_closed(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        // Dropping the senders fails every ping still in flight.
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::debug!(session = %self.id, peer = %self.peer_key, "session closed");
    }

    async fn send_line(&self, line: String) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        Ok(())
    }

    fn complete_ping(&self, n: u64) {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&n);
        match waiter {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => tracing::trace!(session = %self.id, n, "unsolicited pong"),
        }
    }
}

async fn read_loop(session: Weak<TcpSession>, mut reader: BufReader<OwnedReadHalf>) {
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line).await;
        let Some(session) = session.upgrade() else { return };
        match read {
            Ok(0) => {
                tracing::trace!(session = %session.id, "peer closed the connection");
                session.mark_closed();
                return;
            }
            Err(e) => {
                tracing::debug!(session = %session.id, error = %e, "read failed");
                session.mark_closed();
                return;
            }
            Ok(_) => {}
        }

        match parse_frame(line.trim_end()) {
            Some(Frame::Ping(n)) => {
                if let Err(e) = session.send_line(format!("PONG {n}\n")).await {
                    tracing::debug!(session = %session.id, error = %e, "failed to answer ping");
                }
            }
            Some(Frame::Pong(n)) => session.complete_ping(n),
            None => tracing::debug!(session = %session.id, line = %line.trim_end(), "ignoring unknown frame"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Ping(u64),
    Pong(u64),
}

fn parse_frame(line: &str) -> Option<Frame> {
    let (verb, n) = line.split_once(' ')?;
    let n = n.parse().ok()?;
    match verb {
        "PING" => Some(Frame::Ping(n)),
        "PONG" => Some(Frame::Pong(n)),
        _ => None,
    }
}

#[async_trait]
impl Session for TcpSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn peer_key(&self) -> &str {
        &self.peer_key
    }

    fn remote_address(&self) -> String {
        address::net_address(
            &self.peer_addr.ip().to_string(),
            self.peer_addr.port(),
            &self.peer_key,
        )
    }

    async fn close(&self, forced: bool) -> Result<(), TransportError> {
        if self.is_closed() {
            return Ok(());
        }
        if !forced {
            let mut writer = self.writer.lock().await;
            writer.flush().await?;
        }
        {
            let mut writer = self.writer.lock().await;
            // The peer may already be gone; the local close still stands.
            let _ = writer.shutdown().await;
        }
        if let Some(task) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.mark_closed();
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
        let n = self.next_ping.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(n, tx);

        let started = Instant::now();
        if let Err(e) = self.send_line(format!("PING {n}\n")).await {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&n);
            return Err(e);
        }
        rx.await.map_err(|_| TransportError::SessionClosed)?;
        Ok(started.elapsed())
    }
}
