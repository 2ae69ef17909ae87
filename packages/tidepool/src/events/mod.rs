//! Real-time change notification: event model, wire encoding, and the
//! per-user connection registry that fans events out to open streams.

pub mod protocol;
pub mod registry;

pub use protocol::{Event, EventKind};
pub use registry::{ConnectionId, EventRegistry, EventStream};
