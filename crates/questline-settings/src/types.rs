//! Settings sections.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuestlineSettings {
    /// Browser-side client settings.
    pub client: ClientSettings,
    /// Base connection retry and refresh timings.
    pub connection: ConnectionSettings,
    /// Group join timings.
    pub groups: GroupSettings,
    /// Web PubSub service settings.
    pub pubsub: PubSubSettings,
    /// Negotiate server and content responder settings.
    pub server: ServerSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

/// Client settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// URL of the credential (negotiate) endpoint.
    pub credential_endpoint: String,
    /// Capacity of the content update queue.
    pub update_buffer: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            credential_endpoint: "http://127.0.0.1:7071/api/negotiate".to_string(),
            update_buffer: 256,
        }
    }
}

/// Base connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Attempts per connection sequence.
    pub max_attempts: u32,
    /// Fixed delay between attempts and before reconnecting, in ms.
    pub retry_delay_ms: u64,
    /// Silent token refresh interval in ms.
    pub token_refresh_ms: u64,
    /// How long to wait for a service acknowledgement, in ms.
    pub ack_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 5_000,
            token_refresh_ms: 3_300_000,
            ack_timeout_ms: 10_000,
        }
    }
}

/// Group join settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupSettings {
    /// How long a join waits for the base connection, in ms.
    pub base_wait_timeout_ms: u64,
    /// First backoff delay, doubled per failed attempt, in ms.
    pub base_delay_ms: u64,
    /// Join attempts before the group enters `error`.
    pub max_attempts: u32,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            base_wait_timeout_ms: 10_000,
            base_delay_ms: 1_000,
            max_attempts: 3,
        }
    }
}

/// Web PubSub service settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PubSubSettings {
    /// Service connection string (`Endpoint=...;AccessKey=...;Version=1.0;`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
    /// Hub name.
    pub hub_name: String,
    /// Lifetime of minted client tokens, in ms.
    pub token_lifetime_ms: u64,
}

impl Default for PubSubSettings {
    fn default() -> Self {
        Self {
            connection_string: None,
            hub_name: "questline".to_string(),
            token_lifetime_ms: 3_600_000,
        }
    }
}

impl PubSubSettings {
    /// The connection string, or an error naming the missing setting.
    pub fn require_connection_string(&self) -> Result<&str> {
        self.connection_string
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or(SettingsError::Missing("pubsub.connectionString"))
    }
}

/// Server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (0 picks a free port).
    pub port: u16,
    /// Directory holding the markdown content files.
    pub content_dir: String,
    /// Delivery attempts for a content response.
    pub delivery_attempts: u32,
    /// First delivery backoff delay, doubled per attempt, in ms.
    pub delivery_base_delay_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7071,
            content_dir: "content".to_string(),
            delivery_attempts: 3,
            delivery_base_delay_ms: 1_000,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level filter (`RUST_LOG` wins when set).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Persist warn+ events to SQLite.
    pub persist_warnings: bool,
    /// Log database path; defaults to `~/.questline/logs.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            persist_warnings: true,
            db_path: None,
        }
    }
}
