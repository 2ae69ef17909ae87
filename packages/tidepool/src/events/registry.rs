//! Live-connection registry
//!
//! Owns the set of open event streams, keyed by user id, and performs
//! best-effort fan-out writes. One instance lives in `AppState` for the
//! lifetime of the process; the request layer registers authenticated
//! streams here and the CRUD handlers broadcast through it.
//!
//! Locking: the outer map is read-locked for lookups and write-locked only
//! to insert or prune a user entry. All mutation of one user's connection
//! set serializes on that entry's inner mutex, so traffic for different
//! users never contends. Lock order is always outer → inner.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::Event;
use crate::metrics::ServerMetrics;

/// Capacity of each connection's outbound frame channel. A client that
/// stops reading long enough to fill this is treated as dead.
const SINK_CAPACITY: usize = 64;

/// Identifier for one registered connection.
pub type ConnectionId = Uuid;

/// One open push stream to a single client instance. Never reused across
/// reconnects — every attempt registers a fresh connection.
struct Connection {
    sink: mpsc::Sender<String>,
}

/// One user's live connections. `detached` marks a slot that lost a race
/// with pruning: a registration that still holds the old Arc must retry
/// against the current map instead of inserting into an orphan.
#[derive(Default)]
struct UserSlot {
    connections: HashMap<ConnectionId, Connection>,
    detached: bool,
}

type SlotHandle = Arc<Mutex<UserSlot>>;

pub struct EventRegistry {
    /// user_id → that user's connection slot.
    connections: RwLock<HashMap<String, SlotHandle>>,
    /// Set once by `shutdown`; registrations after that are refused.
    closed: AtomicBool,
    /// Cancels the heartbeat task.
    cancel: CancellationToken,
    metrics: Arc<ServerMetrics>,
}

impl EventRegistry {
    pub fn new(metrics: Arc<ServerMetrics>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            metrics,
        }
    }

    /// Spawn the heartbeat sweep on `interval`. Stopped by `shutdown`.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        info!("Starting event heartbeat every {:?}", interval);
        let registry = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately; skip it
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => registry.heartbeat_all().await,
                }
            }
            debug!("Heartbeat task stopped");
        });
    }

    /// Open a stream for `user_id`: registers a fresh connection and returns
    /// its frame stream. The stream deregisters itself when dropped, which
    /// is how transport close and error reach the registry. Returns `None`
    /// when the registry has shut down.
    pub async fn subscribe(self: &Arc<Self>, user_id: &str) -> Option<EventStream> {
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        let id = self.register(user_id, tx).await?;
        Some(EventStream {
            rx,
            _guard: DisconnectGuard {
                registry: Arc::clone(self),
                user_id: user_id.to_string(),
                id,
            },
        })
    }

    /// Add `sink` to the user's connection set and confirm the stream with a
    /// `connected` event. Returns `None` (dropping the sink, so the stream
    /// ends immediately) when racing or following `shutdown`.
    pub async fn register(&self, user_id: &str, sink: mpsc::Sender<String>) -> Option<ConnectionId> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        let id = Uuid::new_v4();
        let count = loop {
            let slot = {
                let map = self.connections.read().await;
                map.get(user_id).cloned()
            };
            let slot = match slot {
                Some(slot) => slot,
                None => {
                    let mut map = self.connections.write().await;
                    // shutdown sets `closed` before taking this lock; never
                    // re-create an entry it has already drained
                    if self.closed.load(Ordering::Acquire) {
                        return None;
                    }
                    map.entry(user_id.to_string()).or_default().clone()
                }
            };

            let mut guard = slot.lock().await;
            if guard.detached {
                // pruned between lookup and lock; look up again
                continue;
            }
            // shutdown sets `closed` before draining slots, so checking it
            // under the slot lock guarantees this insert cannot be missed
            // by the shutdown sweep
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            guard.connections.insert(id, Connection { sink: sink.clone() });
            break guard.connections.len();
        };

        self.metrics.connection_opened();
        if count == 1 {
            info!(user_id, "Event stream established");
        }

        // Confirm the stream before any domain events reach it.
        if sink.try_send(Event::connected().to_frame()).is_ok() {
            self.metrics.event_sent();
        }

        Some(id)
    }

    /// Idempotent removal: absent connections and repeated calls are no-ops.
    /// The last removal for a user prunes the user's entry entirely.
    pub async fn remove(&self, user_id: &str, id: ConnectionId) {
        let slot = {
            let map = self.connections.read().await;
            map.get(user_id).cloned()
        };
        let Some(slot) = slot else { return };

        let now_empty = {
            let mut guard = slot.lock().await;
            if guard.connections.remove(&id).is_none() {
                return;
            }
            guard.connections.is_empty()
        };
        self.metrics.connection_closed();

        if now_empty {
            let mut map = self.connections.write().await;
            if let Some(current) = map.get(user_id).cloned() {
                let mut guard = current.lock().await;
                if guard.connections.is_empty() {
                    guard.detached = true;
                    drop(guard);
                    map.remove(user_id);
                    debug!(user_id, "All event streams closed");
                }
            }
        }
    }

    /// Write `event` to every connection currently registered for `user_id`.
    /// A failed write removes that connection and never blocks delivery to
    /// the rest. No connections → silent no-op (nothing is buffered for
    /// offline users).
    pub async fn broadcast(&self, user_id: &str, event: &Event) {
        let slot = {
            let map = self.connections.read().await;
            map.get(user_id).cloned()
        };
        let Some(slot) = slot else { return };

        let frame = event.to_frame();
        let failed = self.write_to_slot(&slot, &frame).await;
        for id in failed {
            warn!(
                user_id,
                connection_id = %id,
                kind = event.kind.as_str(),
                "Dropping event stream after failed write"
            );
            self.remove(user_id, id).await;
        }
    }

    /// Write a `heartbeat` event to every connection of every user, with the
    /// same failed-write-removes-that-connection rule as `broadcast`. Keeps
    /// intermediaries from timing out idle streams and reaps half-open
    /// transports.
    pub async fn heartbeat_all(&self) {
        let slots: Vec<(String, SlotHandle)> = {
            let map = self.connections.read().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let frame = Event::heartbeat().to_frame();
        for (user_id, slot) in slots {
            let failed = self.write_to_slot(&slot, &frame).await;
            for id in failed {
                warn!(user_id, connection_id = %id, "Dropping event stream after failed heartbeat");
                self.remove(&user_id, id).await;
            }
        }
        self.metrics.heartbeat_sweep();
    }

    /// Write one frame to every connection in a slot, returning the ids
    /// whose write failed. Failures are collected rather than handled
    /// inline so removal never happens mid-iteration.
    async fn write_to_slot(&self, slot: &SlotHandle, frame: &str) -> Vec<ConnectionId> {
        let guard = slot.lock().await;
        let mut failed = Vec::new();
        for (id, conn) in &guard.connections {
            if conn.sink.try_send(frame.to_string()).is_ok() {
                self.metrics.event_sent();
            } else {
                self.metrics.event_dropped();
                failed.push(*id);
            }
        }
        failed
    }

    /// Visible connection count for one user. Absent entry ≡ zero.
    #[allow(dead_code)]
    pub async fn connection_count(&self, user_id: &str) -> usize {
        let slot = {
            let map = self.connections.read().await;
            map.get(user_id).cloned()
        };
        match slot {
            Some(slot) => slot.lock().await.connections.len(),
            None => 0,
        }
    }

    /// Stop the heartbeat, close every stream, and clear the registry.
    /// Registrations racing this call are either drained here or refused in
    /// `register` — never leaked. Called once during process termination.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();

        let mut map = self.connections.write().await;
        let mut closed = 0usize;
        for (_, slot) in map.drain() {
            let mut guard = slot.lock().await;
            guard.detached = true;
            closed += guard.connections.len();
            // dropping the senders ends each stream
            guard.connections.clear();
        }
        for _ in 0..closed {
            self.metrics.connection_closed();
        }
        if closed > 0 {
            info!(connections = closed, "Closed all event streams");
        }
    }
}

// =============================================================================
// EventStream
// =============================================================================

/// Frame stream for one registered connection. Dropping it (transport
/// close, transport error, or response teardown) deregisters the
/// connection — the single terminal-state notification the registry
/// relies on.
pub struct EventStream {
    rx: mpsc::Receiver<String>,
    _guard: DisconnectGuard,
}

impl futures::Stream for EventStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

struct DisconnectGuard {
    registry: Arc<EventRegistry>,
    user_id: String,
    id: ConnectionId,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let registry = Arc::clone(&self.registry);
        let user_id = std::mem::take(&mut self.user_id);
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                registry.remove(&user_id, id).await;
            });
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
