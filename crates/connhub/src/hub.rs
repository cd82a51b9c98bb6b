//! ConnHub: the connection lifecycle orchestrator.
//!
//! Owns the peer registry, the retry set and both buses for one transport.
//! Every registry mutation and the events describing it happen under the
//! address's lock, so operations on one address appear atomic to each other.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use connhub_core::address;
use connhub_core::peer_type::infer_peer_type;
use connhub_core::{HubConfig, HubError, SessionHandle, Transport};
use connhub_services::{
    AddressLocks, DisconnectCloser, EventBus, EventDetails, EventStream, Extensions, HubEvent,
    HubEventKind, LiveEntriesBus, LiveEntriesStream, PeerRegistry, PeerState, RecordPatch,
    Snapshot,
};

use crate::correlator;
use crate::keepalive;

/// Handle to a hub. Cheap to clone; all clones share one hub.
///
/// Must be created inside a tokio runtime: the inbound correlator runs as a
/// background task.
#[derive(Clone)]
pub struct ConnHub {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) config: HubConfig,
    pub(crate) registry: PeerRegistry,
    pub(crate) locks: AddressLocks,
    pub(crate) events: EventBus,
    pub(crate) live: LiveEntriesBus,
    /// Addresses whose connect() arrived while a disconnect() was in flight.
    retries: Mutex<HashSet<String>>,
    closed: AtomicBool,
    pub(crate) shutdown: watch::Sender<bool>,
    correlator: Mutex<Option<JoinHandle<()>>>,
}

enum ConnectStep {
    Done(Option<SessionHandle>),
    Wait(EventStream),
    Dial(Option<String>),
}

enum DisconnectStep {
    Absent,
    /// Another disconnect() already owns the address.
    Join(EventStream),
    Close(PendingDisconnect),
}

struct PendingDisconnect {
    prior: PeerState,
    closer: Option<DisconnectCloser>,
    key: Option<String>,
}

/// What happened when a session was attached to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attach {
    Attached,
    AlreadyAttached,
    /// The address is being disconnected (or the hub is closed); the session
    /// was closed instead.
    Rejected,
}

impl ConnHub {
    pub fn new(transport: Arc<dyn Transport>, config: HubConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let notices = transport.subscribe();
        let inner = Arc::new(Inner {
            events: EventBus::new(config.bus.event_capacity),
            live: LiveEntriesBus::new(config.bus.snapshot_capacity),
            transport,
            config,
            registry: PeerRegistry::new(),
            locks: AddressLocks::new(),
            retries: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            shutdown,
            correlator: Mutex::new(None),
        });

        let task = tokio::spawn(correlator::run(
            Arc::downgrade(&inner),
            notices,
            inner.shutdown.subscribe(),
            inner.config.correlation.clone(),
        ));
        *inner
            .correlator
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        tracing::debug!(local_key = %inner.transport.local_key(), "connhub started");
        Self { inner }
    }

    /// Connect to `address`.
    ///
    /// `Ok(None)` means this call did not produce a session of its own:
    ///
    /// - the address was already connecting. The call waits for that attempt
    ///   to settle and returns `None` even when it succeeded; read
    ///   [`get_state`](Self::get_state) or [`entries`](Self::entries) for
    ///   the outcome.
    /// - a disconnect is in flight. The connect is replayed once it finishes.
    /// - the address was disconnected while dialling. The new session is
    ///   closed again.
    pub async fn connect(&self, address: &str) -> Result<Option<SessionHandle>, HubError> {
        self.inner.connect(address, Extensions::new()).await
    }

    /// Like [`connect`](Self::connect), seeding the new record with `initial`.
    pub async fn connect_with(
        &self,
        address: &str,
        initial: Extensions,
    ) -> Result<Option<SessionHandle>, HubError> {
        self.inner.connect(address, initial).await
    }

    /// Close the session for `address`.
    ///
    /// `Ok(false)` when nothing is tracked. A call that finds a disconnect
    /// already in flight waits for it and reports its outcome: `Ok(true)` if
    /// the address was disconnected, `Ok(false)` if that disconnect failed
    /// and the record was rolled back.
    pub async fn disconnect(&self, address: &str) -> Result<bool, HubError> {
        self.inner.disconnect(address).await
    }

    /// Merge metadata into an existing record. State and closer are owned
    /// by the hub and ignored here.
    pub fn update(&self, address: &str, patch: RecordPatch) -> Result<bool, HubError> {
        self.inner.ensure_open()?;
        let patch = patch.metadata_only();
        Ok(self.inner.locks.with(address, || {
            if !self.inner.registry.contains(address) {
                return false;
            }
            self.inner.upsert(address, patch);
            self.inner.refresh();
            true
        }))
    }

    /// Force-close every live session except a connection to ourselves.
    /// The registry follows through the sessions' close notifications.
    pub fn reset(&self) -> Result<(), HubError> {
        self.inner.ensure_open()?;
        let local = self.inner.transport.local_key().to_string();
        for session in self.inner.transport.sessions() {
            if session.peer_key() == local {
                continue;
            }
            tracing::debug!(session = %session.id(), peer = %session.peer_key(), "reset: closing session");
            tokio::spawn(async move {
                if let Err(e) = session.close(true).await {
                    tracing::warn!(session = %session.id(), error = %e, "reset: close failed");
                }
            });
        }
        Ok(())
    }

    pub fn entries(&self) -> Snapshot {
        self.inner.registry.snapshot()
    }

    pub fn get_state(&self, address: &str) -> Option<PeerState> {
        self.inner.registry.state(address)
    }

    /// Lifecycle events from now on.
    pub fn listen(&self) -> Result<EventStream, HubError> {
        self.inner.ensure_open()?;
        self.inner.events.subscribe().ok_or(HubError::Closed)
    }

    /// The current registry snapshot, then one per change.
    pub fn live_entries(&self) -> Result<LiveEntriesStream, HubError> {
        self.inner.ensure_open()?;
        self.inner.live.subscribe().ok_or(HubError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Shut the hub down. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.send_replace(true);
        if let Some(task) = self
            .inner
            .correlator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.inner.events.close();
        self.inner.live.close();
        self.inner.registry.clear();
        self.inner.retries_guard().clear();
        tracing::info!("connhub closed");
    }
}

#[cfg(test)]
impl ConnHub {
    pub(crate) fn inner_for_tests(&self) -> &Arc<Inner> {
        &self.inner
    }
}

impl Inner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), HubError> {
        if self.is_closed() {
            Err(HubError::Closed)
        } else {
            Ok(())
        }
    }

    fn ensure_valid(address: &str) -> Result<(), HubError> {
        if address::check(address) {
            Ok(())
        } else {
            Err(HubError::InvalidAddress(address.to_string()))
        }
    }

    fn retries_guard(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.retries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn upsert(&self, address: &str, patch: RecordPatch) {
        if let Err(e) = self.registry.upsert(address, patch) {
            tracing::debug!(error = %e, "unexpected control flow, registry update skipped");
        }
    }

    fn emit(&self, event: HubEvent) {
        self.events.publish(event);
    }

    fn refresh(&self) {
        self.live.publish(|| self.registry.snapshot());
    }

    // ── connect ──────────────────────────────────────────────────────────────

    async fn connect(
        self: &Arc<Self>,
        address: &str,
        initial: Extensions,
    ) -> Result<Option<SessionHandle>, HubError> {
        self.ensure_open()?;
        Self::ensure_valid(address)?;

        let step = self.locks.with(address, || -> Result<ConnectStep, HubError> {
            self.ensure_open()?;
            if let Some(record) = self.registry.get(address) {
                return Ok(match record.state {
                    PeerState::Connected => {
                        tracing::debug!(%address, "already connected");
                        ConnectStep::Done(record.session().cloned())
                    }
                    PeerState::Connecting => match self.events.subscribe() {
                        Some(events) => ConnectStep::Wait(events),
                        None => ConnectStep::Done(None),
                    },
                    PeerState::Disconnecting => {
                        tracing::debug!(%address, "disconnect in flight, connect deferred");
                        self.retries_guard().insert(address.to_string());
                        ConnectStep::Done(None)
                    }
                });
            }

            let key = address::key_from_address(address)?;
            self.upsert(
                address,
                RecordPatch::new()
                    .with_state(PeerState::Connecting)
                    .with_key(key.clone())
                    .with_extensions(initial),
            );
            tracing::debug!(%address, "connecting");
            self.emit(HubEvent::new(HubEventKind::Connecting, address, key.clone()));
            self.refresh();
            Ok(ConnectStep::Dial(key))
        })?;

        let key = match step {
            ConnectStep::Done(session) => return Ok(session),
            ConnectStep::Wait(events) => {
                self.wait_for_settle(
                    address,
                    events,
                    &[
                        HubEventKind::Connected,
                        HubEventKind::ConnectingFailed,
                        HubEventKind::Disconnected,
                    ],
                )
                .await;
                self.ensure_open()?;
                return Ok(None);
            }
            ConnectStep::Dial(key) => key,
        };

        match self.transport.connect(address).await {
            Err(error) => {
                self.locks.with(address, || {
                    if self.registry.state(address) == Some(PeerState::Connecting) {
                        self.registry.remove(address);
                    }
                    tracing::debug!(%address, error = %error, "failed to connect");
                    self.emit(
                        HubEvent::new(HubEventKind::ConnectingFailed, address, key)
                            .with_details(EventDetails::Error(error.clone())),
                    );
                    self.refresh();
                });
                Err(HubError::Transport(error))
            }
            Ok(session) => match self.attach_as(address, session.clone(), true, false) {
                Attach::Attached | Attach::AlreadyAttached => Ok(Some(session)),
                Attach::Rejected => {
                    self.ensure_open()?;
                    Ok(None)
                }
            },
        }
    }

    /// Wait for the first event on `address` whose kind is in `outcomes`,
    /// bounded by the configured timeout. The subscription is dropped on
    /// return.
    async fn wait_for_settle(
        &self,
        address: &str,
        mut events: EventStream,
        outcomes: &[HubEventKind],
    ) -> Option<HubEventKind> {
        let limit = self.config.connect.wait_timeout();
        let settled = tokio::time::timeout(limit, async {
            while let Some(event) = events.recv().await {
                if event.address == address && outcomes.contains(&event.kind) {
                    return Some(event.kind);
                }
            }
            None
        })
        .await;

        match settled {
            Ok(Some(kind)) => {
                tracing::debug!(%address, %kind, "in-flight operation settled");
                Some(kind)
            }
            Ok(None) => {
                tracing::debug!(%address, "event bus closed while waiting");
                None
            }
            Err(_) => {
                tracing::debug!(%address, ?limit, "gave up waiting for in-flight operation");
                None
            }
        }
    }

    /// Mark `address` connected on `session`, creating the record if needed.
    ///
    /// Both `connect()` and the inbound correlator end up here; whichever
    /// arrives second for the same session is a no-op.
    pub(crate) fn attach(
        self: &Arc<Self>,
        address: &str,
        session: SessionHandle,
        initiator: bool,
    ) -> Attach {
        self.attach_as(address, session, initiator, true)
    }

    /// `create = false` rejects the session when the record is gone, which is
    /// how a dial learns that the address was disconnected meanwhile.
    fn attach_as(
        self: &Arc<Self>,
        address: &str,
        session: SessionHandle,
        initiator: bool,
        create: bool,
    ) -> Attach {
        let attached = self.locks.with(address, || {
            if self.is_closed() {
                return Err(Attach::Rejected);
            }
            let existing = self.registry.get(address);
            if existing.is_none() && !create {
                tracing::debug!(%address, "record removed while dialling");
                return Err(Attach::Rejected);
            }
            if let Some(record) = &existing {
                match record.state {
                    PeerState::Disconnecting => return Err(Attach::Rejected),
                    PeerState::Connected
                        if record.disconnect_closer.as_ref().map(|c| c.session_id())
                            == Some(session.id()) =>
                    {
                        return Err(Attach::AlreadyAttached);
                    }
                    _ => {}
                }
            }

            let key = existing
                .as_ref()
                .and_then(|r| r.key.clone())
                .or_else(|| Some(session.peer_key().to_string()));
            let mut patch = RecordPatch::new()
                .with_state(PeerState::Connected)
                .with_key(key.clone())
                .with_closer(DisconnectCloser::new(session.clone()));
            if existing.as_ref().and_then(|r| r.inferred_type).is_none() {
                let hint = session.remote_address();
                if let Some(peer_type) = infer_peer_type(address, Some(&hint)) {
                    patch = patch.with_inferred_type(peer_type);
                }
            }
            self.upsert(address, patch);

            tracing::info!(%address, session = %session.id(), initiator, "connected");
            self.emit(
                HubEvent::new(HubEventKind::Connected, address, key.clone()).with_details(
                    EventDetails::Session {
                        session: session.clone(),
                        initiator,
                    },
                ),
            );
            self.refresh();
            Ok(key)
        });

        let key = match attached {
            Ok(key) => key,
            Err(Attach::Rejected) => {
                tracing::debug!(%address, session = %session.id(), "session not wanted, closing");
                tokio::spawn(async move {
                    let _ = session.close(true).await;
                });
                return Attach::Rejected;
            }
            Err(outcome) => return outcome,
        };

        self.watch_session(address, session.clone());
        if initiator && self.config.ping.enabled {
            keepalive::spawn(
                self.events.clone(),
                address.to_string(),
                key,
                session,
                self.config.ping.clone(),
                self.shutdown.subscribe(),
            );
        }
        Attach::Attached
    }

    /// Remove the record once `session` closes, unless something else has
    /// taken over the address by then.
    fn watch_session(self: &Arc<Self>, address: &str, session: SessionHandle) {
        let hub = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        let address = address.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = session.closed() => {}
                _ = shutdown_signal(&mut shutdown) => return,
            }
            if let Some(inner) = hub.upgrade() {
                inner.on_session_closed(&address, &session);
            }
        });
    }

    fn on_session_closed(&self, address: &str, session: &SessionHandle) {
        self.locks.with(address, || {
            let Some(record) = self.registry.get(address) else {
                return;
            };
            if record.state == PeerState::Disconnecting {
                // disconnect() is in flight and will remove the record itself
                return;
            }
            if record.disconnect_closer.as_ref().map(|c| c.session_id()) != Some(session.id()) {
                return;
            }
            self.registry.remove(address);
            tracing::info!(%address, session = %session.id(), "disconnected");
            self.emit(HubEvent::new(HubEventKind::Disconnected, address, record.key));
            self.refresh();
        });
    }

    // ── disconnect ───────────────────────────────────────────────────────────

    async fn disconnect(self: &Arc<Self>, address: &str) -> Result<bool, HubError> {
        self.ensure_open()?;
        Self::ensure_valid(address)?;

        let step = self.locks.with(address, || -> Result<_, HubError> {
            self.ensure_open()?;
            let Some(record) = self.registry.get(address) else {
                return Ok(DisconnectStep::Absent);
            };
            if record.state == PeerState::Disconnecting {
                return Ok(match self.events.subscribe() {
                    Some(events) => DisconnectStep::Join(events),
                    None => DisconnectStep::Absent,
                });
            }
            self.upsert(address, RecordPatch::new().with_state(PeerState::Disconnecting));
            tracing::debug!(%address, "disconnecting");
            self.emit(HubEvent::new(
                HubEventKind::Disconnecting,
                address,
                record.key.clone(),
            ));
            self.refresh();
            Ok(DisconnectStep::Close(PendingDisconnect {
                prior: record.state,
                closer: record.disconnect_closer.clone(),
                key: record.key,
            }))
        })?;
        let pending = match step {
            DisconnectStep::Absent => return Ok(false),
            DisconnectStep::Join(events) => {
                let outcome = self
                    .wait_for_settle(
                        address,
                        events,
                        &[HubEventKind::Disconnected, HubEventKind::DisconnectingFailed],
                    )
                    .await;
                self.ensure_open()?;
                return Ok(outcome == Some(HubEventKind::Disconnected));
            }
            DisconnectStep::Close(pending) => pending,
        };

        if let Some(closer) = &pending.closer {
            if let Err(error) = closer.close().await {
                self.locks.with(address, || {
                    if self.registry.state(address) == Some(PeerState::Disconnecting) {
                        let mut patch = RecordPatch::new().with_state(pending.prior);
                        if pending.prior == PeerState::Connected {
                            patch = patch.with_closer(closer.clone());
                        }
                        self.upsert(address, patch);
                    }
                    tracing::warn!(%address, error = %error, "failed to disconnect");
                    self.emit(
                        HubEvent::new(HubEventKind::DisconnectingFailed, address, pending.key.clone())
                            .with_details(EventDetails::Error(error.clone())),
                    );
                    self.refresh();
                });
                return Err(HubError::Transport(error));
            }
        }

        let replay = self.locks.with(address, || {
            if self.registry.remove(address).is_some() {
                tracing::info!(%address, "disconnected");
                self.emit(HubEvent::new(HubEventKind::Disconnected, address, pending.key));
                self.refresh();
            }
            self.retries_guard().remove(address)
        });

        if replay && !self.is_closed() {
            tracing::debug!(%address, "replaying connect deferred behind disconnect");
            let inner = Arc::clone(self);
            let address = address.to_string();
            tokio::spawn(async move {
                if let Err(e) = inner.connect(&address, Extensions::new()).await {
                    tracing::debug!(%address, error = %e, "deferred connect failed");
                }
            });
        }
        Ok(true)
    }
}

/// Resolves once the hub is closed (or dropped).
pub(crate) async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
