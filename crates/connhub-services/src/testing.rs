//! Minimal session stand-in for unit tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use connhub_core::{Session, SessionHandle, SessionId, TransportError};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub struct StubSession {
    id: SessionId,
    key: String,
}

impl StubSession {
    pub fn new(key: &str) -> SessionHandle {
        let n = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            id: SessionId::derive(&n.to_le_bytes()),
            key: key.to_string(),
        })
    }
}

#[async_trait]
impl Session for StubSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn peer_key(&self) -> &str {
        &self.key
    }

    fn remote_address(&self) -> String {
        "net:127.0.0.1:1".to_string()
    }

    async fn close(&self, _forced: bool) -> Result<(), TransportError> {
        Ok(())
    }

    async fn closed(&self) {
        std::future::pending::<()>().await
    }

    async fn ping(&self) -> Result<Duration, TransportError> {
        Ok(Duration::from_millis(1))
    }
}
