//! Error types shared by every transport and credential implementation.

use std::time::Duration;

/// Failure to obtain an access token from the credential endpoint.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CredentialError {
    /// The HTTP request could not be sent or the connection failed.
    #[error("credential request failed: {0}")]
    Request(String),
    /// The endpoint answered with a non-2xx status.
    #[error("credential endpoint returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },
    /// The response body was not the expected JSON document.
    #[error("invalid credential response: {0}")]
    Decode(String),
    /// The response had no (or an empty) `url` field.
    #[error("credential response has no url")]
    MissingUrl,
    /// The token could not be minted locally.
    #[error("token minting failed: {0}")]
    Mint(String),
}

/// Failure reported by a [`Transport`](crate::Transport).
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    /// The socket could not be opened or the handshake failed.
    #[error("connect failed: {0}")]
    Connect(String),
    /// An operation was attempted without an open session.
    #[error("transport is not open")]
    NotOpen,
    /// The service acknowledged the operation with an error.
    #[error("{operation} rejected: {name}: {message}")]
    Rejected {
        /// Operation name (`joinGroup`, `leaveGroup`, `sendToGroup`).
        operation: String,
        /// Service error name.
        name: String,
        /// Service error message.
        message: String,
    },
    /// No acknowledgement arrived in time.
    #[error("no ack for {operation} within {timeout:?}")]
    AckTimeout {
        /// Operation name.
        operation: String,
        /// How long we waited.
        timeout: Duration,
    },
    /// The session closed while the operation was pending.
    #[error("connection closed")]
    Closed,
    /// A frame could not be encoded or made no sense.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::NotOpen => "not_open",
            Self::Rejected { .. } => "rejected",
            Self::AckTimeout { .. } => "ack_timeout",
            Self::Closed => "closed",
            Self::Protocol(_) => "protocol",
        }
    }
}
