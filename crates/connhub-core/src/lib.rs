//! connhub-core: address codec, identities, peer classification, config,
//! errors, and the transport interface the hub is written against.
//! All other connhub crates depend on this one.

pub mod address;
pub mod config;
pub mod error;
pub mod identity;
pub mod peer_type;
pub mod transport;

pub use config::HubConfig;
pub use error::{HubError, TransportError};
pub use peer_type::PeerType;
pub use transport::{PeerConnected, Session, SessionHandle, SessionId, Transport};
