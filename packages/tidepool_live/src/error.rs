use thiserror::Error;

/// Failure modes of the live stream transport.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The server refused or deliberately terminated the stream (HTTP error
    /// status on connect, or end-of-stream). Repeated occurrences suggest
    /// the session is no longer valid.
    #[error("stream closed by server: {0}")]
    RemoteClosed(String),

    /// Network-level failure establishing or reading the stream.
    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    /// True when the failure was a remote-side close rather than a network
    /// fault. Drives the force-logout escalation.
    pub fn is_remote_close(&self) -> bool {
        matches!(self, Self::RemoteClosed(_))
    }
}
