//! connhub: tracks connections to peers across a transport and tells
//! subscribers about every change.
//!
//! ```ignore
//! let transport = TcpTransport::bind(identity::generate(), "0.0.0.0:8008".parse()?).await?;
//! let hub = ConnHub::new(transport, HubConfig::load()?);
//! let mut events = hub.listen()?;
//! hub.connect("net:10.0.0.4:8008~shs:...").await?;
//! ```

mod correlator;
mod hub;
mod keepalive;
pub mod tcp;

#[cfg(test)]
mod mock;

pub use hub::ConnHub;
pub use tcp::{TcpSession, TcpTransport};

pub use connhub_core::{
    address, identity, HubConfig, HubError, PeerConnected, PeerType, Session, SessionHandle,
    SessionId, Transport, TransportError,
};
pub use connhub_services::{
    ConnectionRecord, EventDetails, EventStream, Extensions, HubEvent, HubEventKind,
    LiveEntriesStream, Patch, PeerState, ProbeHandle, RecordPatch, Snapshot,
};
