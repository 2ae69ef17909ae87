//! Resilient client for the Tidepool live event stream.
//!
//! Maintains at most one logical subscription to the server's
//! `text/event-stream` endpoint, reconnecting under failure with
//! exponential backoff + jitter, and escalating to a force-logout callback
//! when the server keeps closing the stream.
//!
//! # Example
//!
//! ```rust,ignore
//! use tidepool_live::{HttpEventSource, LiveClient, LiveConfig};
//!
//! let source = HttpEventSource::new("http://localhost:3001", Some(session_token))?;
//! let client = LiveClient::new(
//!     source,
//!     LiveConfig::default(),
//!     |event| println!("{}: {}", event.kind.as_str(), event.payload),
//!     || println!("session rejected, logging out"),
//! );
//!
//! client.start().await;
//! let mut status = client.watch_status();
//! while status.changed().await.is_ok() {
//!     println!("status: {:?}", *status.borrow());
//! }
//! ```

mod client;
mod error;
mod sse;
mod transport;

pub use client::{ConnectionStatus, LiveClient, LiveConfig, LiveEvent, LiveEventKind};
pub use error::Error;
pub use sse::{Frame, FrameParser};
pub use transport::{EventSource, FrameStream, HttpEventSource};
