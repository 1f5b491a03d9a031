//! The real-time transport capability.
//!
//! The sync core never talks to a socket directly. It drives a [`Transport`]:
//! one session multiplexing many named groups, with acknowledged
//! join/leave/send operations and a broadcast of lifecycle and group events.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::errors::TransportError;
use crate::ids::ConnectionId;

/// Payload encoding for [`Transport::send_to_group`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Structured JSON payload.
    #[default]
    Json,
    /// Plain text payload.
    Text,
}

/// Options for a group send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendOptions {
    /// Payload encoding.
    pub data_type: DataType,
    /// Do not deliver the message back to the sending connection.
    pub no_echo: bool,
}

impl SendOptions {
    /// JSON payload, not echoed back to the sender.
    pub fn json_no_echo() -> Self {
        Self {
            data_type: DataType::Json,
            no_echo: true,
        }
    }
}

impl Default for SendOptions {
    fn default() -> Self {
        Self::json_no_echo()
    }
}

/// Events surfaced by a transport session.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// The service confirmed the session.
    Connected {
        /// Service-assigned connection id.
        connection_id: ConnectionId,
    },
    /// The session dropped without [`Transport::close`] being called.
    Disconnected {
        /// Human-readable reason.
        reason: String,
    },
    /// A message published to a group this connection belongs to.
    GroupMessage {
        /// Group the message was published to.
        group: String,
        /// Message payload.
        data: Value,
    },
}

/// One real-time session shared by every group operation.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session against a client access URL, replacing any previous one.
    async fn open(&self, url: &str) -> Result<(), TransportError>;

    /// Close the current session. Never emits [`TransportEvent::Disconnected`].
    async fn close(&self);

    /// Whether a session is currently open.
    fn is_open(&self) -> bool;

    /// Join a group on the current session.
    async fn join_group(&self, group: &str) -> Result<(), TransportError>;

    /// Leave a group on the current session.
    async fn leave_group(&self, group: &str) -> Result<(), TransportError>;

    /// Publish a payload to a group.
    async fn send_to_group(
        &self,
        group: &str,
        payload: Value,
        options: SendOptions,
    ) -> Result<(), TransportError>;

    /// Subscribe to session events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
