//! Reconnecting subscription state machine.
//!
//! One spawned task drives connect → consume → backoff-and-retry. The loop
//! structure itself enforces the concurrency contract: at most one
//! transport attempt and at most one pending reconnect timer exist at any
//! instant, and a per-run cancellation token makes forced teardown
//! effective at the next await point.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use rand::Rng;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::Error;
use crate::sse::Frame;
use crate::transport::EventSource;

// ── Configuration ────────────────────────────────────────────────────

/// Reconnection policy.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// Backoff base: delay before the first retry. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on the exponential backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Consecutive failed attempts before giving up. Default: 10.
    pub max_attempts: u32,

    /// Consecutive remote-initiated closes tolerated before the client
    /// treats them as an authentication failure and invokes the
    /// force-logout callback. Default: 3 (escalates on the 4th).
    pub remote_close_threshold: u32,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            remote_close_threshold: 3,
        }
    }
}

// ── Status and events ────────────────────────────────────────────────

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Initial state, forced teardown, and terminal after giving up.
    Disconnected,
    /// A transport attempt is in flight.
    Connecting,
    /// The stream is open and frames are flowing.
    Connected,
    /// Transient: a failure occurred, a retry is scheduled (or retries are
    /// about to be exhausted).
    Error,
}

/// Domain event kinds forwarded to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveEventKind {
    TodoCreated,
    TodoUpdated,
    TodoDeleted,
}

impl LiveEventKind {
    fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "todo-created" => Some(Self::TodoCreated),
            "todo-updated" => Some(Self::TodoUpdated),
            "todo-deleted" => Some(Self::TodoDeleted),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TodoCreated => "todo-created",
            Self::TodoUpdated => "todo-updated",
            Self::TodoDeleted => "todo-deleted",
        }
    }
}

/// One forwarded domain event, stamped at capture time.
#[derive(Debug, Clone)]
pub struct LiveEvent {
    pub kind: LiveEventKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

// ── LiveClient ───────────────────────────────────────────────────────

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner<S> {
    source: S,
    config: LiveConfig,
    status_tx: watch::Sender<ConnectionStatus>,
    last_error: StdMutex<Option<String>>,
    last_event: StdMutex<Option<LiveEvent>>,
    last_heartbeat: StdMutex<Option<DateTime<Utc>>>,
    on_event: Box<dyn Fn(LiveEvent) + Send + Sync>,
    on_force_logout: Box<dyn Fn() + Send + Sync>,
    /// The single in-flight run, if any. Serializes start/stop.
    run: Mutex<Option<RunHandle>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl<S> Inner<S> {
    fn set_status(&self, status: ConnectionStatus) {
        self.status_tx.send_replace(status);
    }

    fn set_error(&self, message: Option<String>) {
        *lock(&self.last_error) = message;
    }

    /// Route one incoming frame. Only domain kinds reach the caller;
    /// heartbeats update liveness bookkeeping; anything else is dropped
    /// with a diagnostic. A malformed payload for a recognized kind is
    /// reported through the error slot and never touches connection state.
    fn dispatch(&self, frame: Frame) {
        match frame.event.as_str() {
            "heartbeat" => {
                trace!("heartbeat received");
                *lock(&self.last_heartbeat) = Some(Utc::now());
            }
            "connected" => debug!("server confirmed event stream"),
            kind_str => match LiveEventKind::from_wire(kind_str) {
                Some(kind) => match serde_json::from_str(&frame.data) {
                    Ok(payload) => {
                        let event = LiveEvent {
                            kind,
                            payload,
                            timestamp: Utc::now(),
                        };
                        *lock(&self.last_event) = Some(event.clone());
                        (self.on_event)(event);
                    }
                    Err(e) => {
                        warn!(kind = kind_str, "malformed event payload: {e}");
                        self.set_error(Some(format!("failed to parse {kind_str} payload: {e}")));
                    }
                },
                None => debug!(kind = kind_str, "ignoring unrecognized event kind"),
            },
        }
    }
}

/// Handle to the subscription. Cheap to clone via the inner Arc; drop all
/// clones and the background task keeps running until [`stop`](Self::stop).
pub struct LiveClient<S: EventSource> {
    inner: Arc<Inner<S>>,
}

impl<S: EventSource> Clone for LiveClient<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: EventSource> LiveClient<S> {
    /// Build a client. `on_event` fires once per forwarded domain event;
    /// `on_force_logout` fires when repeated remote closes make the session
    /// look invalid. Nothing connects until [`start`](Self::start).
    pub fn new<F, G>(source: S, config: LiveConfig, on_event: F, on_force_logout: G) -> Self
    where
        F: Fn(LiveEvent) + Send + Sync + 'static,
        G: Fn() + Send + Sync + 'static,
    {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                source,
                config,
                status_tx,
                last_error: StdMutex::new(None),
                last_event: StdMutex::new(None),
                last_heartbeat: StdMutex::new(None),
                on_event: Box::new(on_event),
                on_force_logout: Box::new(on_force_logout),
                run: Mutex::new(None),
            }),
        }
    }

    /// Begin (or resume) the subscription. Call once the user is
    /// authenticated; calling while a run is already in flight is a no-op.
    pub async fn start(&self) {
        let mut run = self.inner.run.lock().await;
        if let Some(handle) = run.as_ref() {
            if !handle.task.is_finished() {
                return;
            }
        }

        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            run_loop(inner, task_cancel).await;
        });
        *run = Some(RunHandle { cancel, task });
    }

    /// Forced teardown (logout). Cancels any pending reconnect timer and
    /// in-flight attempt without waiting for the transport, clears the
    /// error, and leaves the client `Disconnected` with fresh counters so a
    /// later re-authentication starts clean.
    pub async fn stop(&self) {
        let handle = self.inner.run.lock().await.take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            let _ = handle.task.await;
        }
        self.inner.set_error(None);
        self.inner.set_status(ConnectionStatus::Disconnected);
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status_tx.borrow()
    }

    /// Subscribe to status transitions.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner.last_error).clone()
    }

    pub fn last_event(&self) -> Option<LiveEvent> {
        lock(&self.inner.last_event).clone()
    }

    /// Time of the most recent heartbeat, as a low-level liveness signal.
    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        *lock(&self.inner.last_heartbeat)
    }
}

// ── The reconnect loop ───────────────────────────────────────────────

async fn run_loop<S: EventSource>(inner: Arc<Inner<S>>, cancel: CancellationToken) {
    // consecutive failed attempts since the last successful connect
    let mut failures: u32 = 0;
    // consecutive remote-initiated closes; tracked separately so network
    // faults between closes break the streak
    let mut remote_closes: u32 = 0;

    loop {
        inner.set_status(ConnectionStatus::Connecting);
        inner.set_error(None);

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = inner.source.connect() => result,
        };

        let end = match connected {
            Ok(mut frames) => {
                info!("event stream connected");
                inner.set_status(ConnectionStatus::Connected);
                failures = 0;
                remote_closes = 0;

                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        frame = frames.next() => frame,
                    };
                    match next {
                        Some(Ok(frame)) => inner.dispatch(frame),
                        Some(Err(e)) => break e,
                        None => break Error::RemoteClosed("stream ended".into()),
                    }
                }
            }
            Err(e) => e,
        };

        warn!(attempt = failures, "event stream failed: {end}");
        inner.set_status(ConnectionStatus::Error);
        inner.set_error(Some(end.to_string()));

        if end.is_remote_close() {
            remote_closes += 1;
            if remote_closes > inner.config.remote_close_threshold {
                error!(
                    closes = remote_closes,
                    "server keeps closing the stream, treating as authentication failure"
                );
                inner.set_error(Some(
                    "connection closed by server - possible authentication failure".into(),
                ));
                (inner.on_force_logout)();
                inner.set_status(ConnectionStatus::Disconnected);
                return;
            }
        } else {
            remote_closes = 0;
        }

        failures += 1;
        if failures >= inner.config.max_attempts {
            error!(attempts = failures, "reconnection budget exhausted, giving up");
            inner.set_error(Some("maximum reconnection attempts exceeded".into()));
            inner.set_status(ConnectionStatus::Disconnected);
            return;
        }

        let delay = backoff_delay(failures - 1, &inner.config);
        debug!(
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            "waiting before reconnect"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) + uniform[0, 1s)`
///
/// `attempt` is 0-indexed. The jitter spreads reconnection storms when many
/// clients lose the same server at once.
fn backoff_delay(attempt: u32, config: &LiveConfig) -> Duration {
    let exp = config.initial_delay.as_secs_f64() * 2.0_f64.powi(attempt.min(31) as i32);
    let capped = exp.min(config.max_delay.as_secs_f64());
    let jitter: f64 = rand::rng().random_range(0.0..1.0);
    Duration::from_secs_f64(capped + jitter)
}

// ── Tests ────────────────────────────────────────────────────────────
