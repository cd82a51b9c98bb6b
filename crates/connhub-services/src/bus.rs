//! Fan-out broadcast of lifecycle events and registry snapshots.
//!
//! Both buses are backed by `tokio::sync::broadcast`. Closing a bus drops
//! its sender, so every open stream drains what it already has and then
//! yields `None`.

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::task::{Context, Poll};

use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use crate::event::HubEvent;
use crate::registry::Snapshot;

// ── EventBus ──────────────────────────────────────────────────────────────────

/// Live-only event broadcast: subscribers see events published after they
/// subscribed, nothing earlier.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<RwLock<Option<broadcast::Sender<HubEvent>>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(RwLock::new(Some(sender))),
        }
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: HubEvent) -> usize {
        let guard = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            tracing::trace!(kind = %event.kind, address = %event.address, "bus closed, event dropped");
            return 0;
        };
        match sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => 0,
        }
    }

    /// `None` once the bus is closed.
    pub fn subscribe(&self) -> Option<EventStream> {
        let guard = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .map(|sender| EventStream::new(sender.subscribe()))
    }

    pub fn close(&self) {
        self.sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }
}

/// Stream of lifecycle events. Ends when the bus closes.
///
/// A subscriber that falls more than the bus capacity behind skips the
/// events it missed.
pub struct EventStream {
    inner: BroadcastStream<HubEvent>,
}

impl EventStream {
    fn new(receiver: broadcast::Receiver<HubEvent>) -> Self {
        Self {
            inner: BroadcastStream::new(receiver),
        }
    }

    /// Next event, or `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<HubEvent> {
        self.next().await
    }
}

impl Stream for EventStream {
    type Item = HubEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(count)))) => {
                    tracing::debug!(lagged = count, "event subscriber lagged, events dropped");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

// ── LiveEntriesBus ────────────────────────────────────────────────────────────

/// Snapshot broadcast with last-value replay: a new subscriber first gets the
/// current snapshot, then every later one.
#[derive(Clone)]
pub struct LiveEntriesBus {
    state: Arc<Mutex<LiveState>>,
}

struct LiveState {
    current: Arc<Snapshot>,
    sender: Option<broadcast::Sender<Arc<Snapshot>>>,
}

impl LiveEntriesBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Arc::new(Mutex::new(LiveState {
                current: Arc::new(Snapshot::new()),
                sender: Some(sender),
            })),
        }
    }

    /// Take a fresh snapshot with `take` and publish it.
    ///
    /// `take` runs under the bus lock, so snapshots go out in the order they
    /// were taken and a concurrent subscriber sees each exactly once.
    pub fn publish(&self, take: impl FnOnce() -> Snapshot) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.sender.is_none() {
            return;
        }
        let snapshot = Arc::new(take());
        state.current = snapshot.clone();
        if let Some(sender) = state.sender.as_ref() {
            let _ = sender.send(snapshot);
        }
    }

    /// `None` once the bus is closed.
    pub fn subscribe(&self) -> Option<LiveEntriesStream> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = state.sender.as_ref()?;
        Some(LiveEntriesStream {
            initial: Some(state.current.clone()),
            inner: BroadcastStream::new(sender.subscribe()),
        })
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .clone()
    }

    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.sender = None;
        state.current = Arc::new(Snapshot::new());
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sender
            .is_none()
    }
}

/// Stream of registry snapshots. Ends when the bus closes.
pub struct LiveEntriesStream {
    initial: Option<Arc<Snapshot>>,
    inner: BroadcastStream<Arc<Snapshot>>,
}

impl LiveEntriesStream {
    pub async fn recv(&mut self) -> Option<Arc<Snapshot>> {
        self.next().await
    }
}

impl Stream for LiveEntriesStream {
    type Item = Arc<Snapshot>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(snapshot) = self.initial.take() {
            return Poll::Ready(Some(snapshot));
        }
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(snapshot))) => return Poll::Ready(Some(snapshot)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(count)))) => {
                    tracing::debug!(lagged = count, "live entries subscriber lagged");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
