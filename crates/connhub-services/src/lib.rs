//! connhub-services: the hub's in-memory state: connection records, the
//! peer registry, per-address locks, and the event and snapshot buses.

pub mod bus;
pub mod event;
pub mod locks;
pub mod record;
pub mod registry;

#[cfg(test)]
mod testing;

pub use bus::{EventBus, EventStream, LiveEntriesBus, LiveEntriesStream};
pub use event::{EventDetails, HubEvent, HubEventKind, ProbeHandle};
pub use locks::AddressLocks;
pub use record::{
    now_millis, ConnectionRecord, DisconnectCloser, Extensions, Patch, PeerState, RecordPatch,
};
pub use registry::{PeerRegistry, RegistryError, Snapshot};
