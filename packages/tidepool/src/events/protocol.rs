//! Event model and wire encoding for the push stream.
//!
//! Each event travels as one text frame: an event-kind line, a single
//! JSON-encoded payload line, and a blank-line terminator
//! (`text/event-stream` framing).

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::error;

use crate::models::Todo;

/// Discriminator for events pushed over a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Sent once, immediately after a stream is registered.
    Connected,
    TodoCreated,
    TodoUpdated,
    TodoDeleted,
    /// Periodic liveness proof; carries a timestamp.
    Heartbeat,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::TodoCreated => "todo-created",
            Self::TodoUpdated => "todo-updated",
            Self::TodoDeleted => "todo-deleted",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// An immutable value handed to the registry for fan-out. Constructed by the
/// CRUD layer at the moment a mutation commits; never persisted or retried.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    payload: serde_json::Value,
}

impl Event {
    pub fn connected() -> Self {
        Self {
            kind: EventKind::Connected,
            payload: json!({ "message": "event stream established" }),
        }
    }

    pub fn todo_created(todo: &Todo) -> Self {
        Self::record(EventKind::TodoCreated, todo)
    }

    pub fn todo_updated(todo: &Todo) -> Self {
        Self::record(EventKind::TodoUpdated, todo)
    }

    pub fn todo_deleted(todo_id: &str) -> Self {
        Self {
            kind: EventKind::TodoDeleted,
            payload: json!({ "id": todo_id }),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            kind: EventKind::Heartbeat,
            payload: json!({ "timestamp": Utc::now().to_rfc3339() }),
        }
    }

    fn record<T: Serialize>(kind: EventKind, value: &T) -> Self {
        let payload = serde_json::to_value(value).unwrap_or_else(|e| {
            error!(kind = kind.as_str(), "Failed to serialize event payload: {e}");
            serde_json::Value::Null
        });
        Self { kind, payload }
    }

    /// Encode as one wire frame.
    pub fn to_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.kind.as_str(), self.payload)
    }
}
