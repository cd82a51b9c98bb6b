//! Connection records and the patches that mutate them.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use connhub_core::{PeerType, SessionHandle, SessionId, TransportError};

/// Caller-supplied fields, carried opaquely alongside a record.
pub type Extensions = BTreeMap<String, Value>;

/// Lifecycle state of a tracked address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Connecting,
    Connected,
    Disconnecting,
}

/// Field-level patch: leave the stored value alone, overwrite it, or clear it.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Patch<T> {
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T> Patch<T> {
    pub fn apply(self, slot: &mut Option<T>) {
        match self {
            Patch::Keep => {}
            Patch::Set(v) => *slot = Some(v),
            Patch::Clear => *slot = None,
        }
    }

    pub fn is_keep(&self) -> bool {
        matches!(self, Patch::Keep)
    }
}

/// `Some` overwrites, `None` clears.
impl<T> From<Option<T>> for Patch<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Patch::Set(v),
            None => Patch::Clear,
        }
    }
}

/// Capability to tear down the live session behind a record.
#[derive(Clone)]
pub struct DisconnectCloser {
    session: SessionHandle,
}

impl DisconnectCloser {
    pub fn new(session: SessionHandle) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    /// Force-close the session and wait for the transport to confirm.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.session.close(true).await
    }
}

impl fmt::Debug for DisconnectCloser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisconnectCloser")
            .field("session", &self.session.id())
            .finish()
    }
}

/// Everything the hub knows about one address.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    pub address: String,
    pub state: PeerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inferred_type: Option<PeerType>,
    /// Milliseconds since the epoch. Never changes after creation.
    pub hub_birth: u64,
    pub hub_updated: u64,
    #[serde(skip)]
    pub disconnect_closer: Option<DisconnectCloser>,
    #[serde(flatten)]
    pub extensions: Extensions,
}

impl ConnectionRecord {
    /// Build a record from a patch. Returns `None` when the patch has no state.
    pub fn create(address: &str, patch: RecordPatch, now: u64) -> Option<Self> {
        let Patch::Set(state) = patch.state else {
            return None;
        };
        let mut record = Self {
            address: address.to_string(),
            state,
            key: None,
            inferred_type: None,
            hub_birth: now,
            hub_updated: now,
            disconnect_closer: None,
            extensions: Extensions::new(),
        };
        record.apply(RecordPatch { state: Patch::Keep, ..patch }, now);
        Some(record)
    }

    /// Merge a patch into this record.
    ///
    /// The closer never outlives the `connected` state. `state` itself cannot
    /// be cleared; a `Clear` for it is ignored.
    pub fn apply(&mut self, patch: RecordPatch, now: u64) {
        if let Patch::Set(state) = patch.state {
            self.state = state;
        }
        patch.key.apply(&mut self.key);
        patch.inferred_type.apply(&mut self.inferred_type);
        patch.disconnect_closer.apply(&mut self.disconnect_closer);
        for (name, value) in patch.extensions {
            match value {
                Patch::Keep => {}
                Patch::Set(v) => {
                    self.extensions.insert(name, v);
                }
                Patch::Clear => {
                    self.extensions.remove(&name);
                }
            }
        }
        if self.state != PeerState::Connected {
            self.disconnect_closer = None;
        }
        self.hub_updated = now;
    }

    /// The live session, if one is attached.
    pub fn session(&self) -> Option<&SessionHandle> {
        self.disconnect_closer.as_ref().map(DisconnectCloser::session)
    }
}

/// A set of field-level changes to a [`ConnectionRecord`].
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub state: Patch<PeerState>,
    pub key: Patch<String>,
    pub inferred_type: Patch<PeerType>,
    pub disconnect_closer: Patch<DisconnectCloser>,
    pub extensions: BTreeMap<String, Patch<Value>>,
}

impl RecordPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: PeerState) -> Self {
        self.state = Patch::Set(state);
        self
    }

    pub fn with_key(mut self, key: Option<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_inferred_type(mut self, inferred_type: PeerType) -> Self {
        self.inferred_type = Patch::Set(inferred_type);
        self
    }

    pub fn with_closer(mut self, closer: DisconnectCloser) -> Self {
        self.disconnect_closer = Patch::Set(closer);
        self
    }

    pub fn with_extension(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extensions.insert(name.into(), Patch::Set(value));
        self
    }

    pub fn with_extensions(mut self, extensions: Extensions) -> Self {
        for (name, value) in extensions {
            self.extensions.insert(name, Patch::Set(value));
        }
        self
    }

    pub fn clear_extension(mut self, name: impl Into<String>) -> Self {
        self.extensions.insert(name.into(), Patch::Clear);
        self
    }

    /// Drop the lifecycle fields (state and closer), keeping only metadata.
    pub fn metadata_only(mut self) -> Self {
        self.state = Patch::Keep;
        self.disconnect_closer = Patch::Keep;
        self
    }
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
