//! The narrow transport interface the hub drives.
//!
//! A [`Transport`] dials addresses, announces every established session
//! (ours and theirs) on a broadcast channel, and can list and close what it
//! has open. The handshake itself lives entirely behind this trait.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::TransportError;

/// Stable identifier of one session, unique within a transport.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub [u8; 32]);

impl SessionId {
    /// Derive an id by hashing arbitrary session material.
    pub fn derive(material: &[u8]) -> Self {
        Self(*blake3::hash(material).as_bytes())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}

/// An established bidirectional connection to a peer.
#[async_trait]
pub trait Session: Send + Sync + fmt::Debug {
    fn id(&self) -> SessionId;

    /// Identity key proven by the handshake.
    fn peer_key(&self) -> &str;

    /// The remote end as an address, as seen by the transport.
    fn remote_address(&self) -> String;

    /// Close the session. `forced` skips any graceful drain.
    async fn close(&self, forced: bool) -> Result<(), TransportError>;

    /// Resolves once the session has closed, for whatever reason.
    async fn closed(&self);

    /// One ping/pong round trip. Returns the measured RTT.
    async fn ping(&self) -> Result<Duration, TransportError>;
}

pub type SessionHandle = Arc<dyn Session>;

/// Announcement that a session has been established.
#[derive(Debug, Clone)]
pub struct PeerConnected {
    pub session: SessionHandle,
    pub key: String,
    /// True when the local side dialled.
    pub initiator: bool,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Our own identity.
    fn local_key(&self) -> &str;

    /// False while the local server is still starting up.
    fn is_ready(&self) -> bool;

    async fn connect(&self, address: &str) -> Result<SessionHandle, TransportError>;

    /// Subscribe to session announcements. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<PeerConnected>;

    /// Every session currently open.
    fn sessions(&self) -> Vec<SessionHandle>;
}
