//! Error types for the Tvheadend tuner host.

use htsp_protocol::ProtocolError;
use thiserror::Error;

/// Errors surfaced by the HTSP session and the tuner host operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HtspError {
    /// Socket or handshake failure. The next operation reconnects.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The backend rejected the configured credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Malformed message on the wire; the connection is torn down.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The deadline elapsed before a reply arrived.
    #[error("Request timed out")]
    Timeout,

    /// The connection dropped while the request was pending.
    #[error("Connection lost")]
    ConnectionLost,

    /// The backend answered with an error reply.
    #[error("Backend error: {0}")]
    Backend(String),

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// A host channel id does not belong to this tuner or is not well formed.
    #[error("Invalid channel id: {0}")]
    InvalidChannelId(String),

    /// Tuner configuration is unusable.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<std::io::Error> for HtspError {
    fn from(e: std::io::Error) -> Self {
        HtspError::Connection(e.to_string())
    }
}

impl HtspError {
    /// Returns true if the error leaves the connection unusable.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            HtspError::Connection(_) | HtspError::Protocol(_) | HtspError::ConnectionLost
        )
    }
}
