//! Runtime configuration for the sync core.

use std::time::Duration;

use questline_settings::QuestlineSettings;

/// Base connection timings.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Attempts per connection sequence.
    pub max_attempts: u32,
    /// Fixed delay between attempts, and before each reconnection.
    pub retry_delay: Duration,
    /// Silent token refresh interval.
    pub token_refresh_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            token_refresh_interval: Duration::from_secs(55 * 60),
        }
    }
}

/// Group join timings.
#[derive(Clone, Debug)]
pub struct GroupConfig {
    /// How long a join waits for the base connection.
    pub base_wait_timeout: Duration,
    /// Delay after the first failed attempt; doubled for each further one.
    pub base_delay: Duration,
    /// Attempts before the channel enters `error`.
    pub max_attempts: u32,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            base_wait_timeout: Duration::from_secs(10),
            base_delay: Duration::from_secs(1),
            max_attempts: 3,
        }
    }
}

/// Everything [`SyncContext`](crate::SyncContext) needs.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base connection timings.
    pub connection: ConnectionConfig,
    /// Group join timings.
    pub groups: GroupConfig,
    /// Capacity of the content update queue.
    pub update_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            groups: GroupConfig::default(),
            update_buffer: 256,
        }
    }
}

impl ClientConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &QuestlineSettings) -> Self {
        Self {
            connection: ConnectionConfig {
                max_attempts: settings.connection.max_attempts.max(1),
                retry_delay: Duration::from_millis(settings.connection.retry_delay_ms),
                token_refresh_interval: Duration::from_millis(settings.connection.token_refresh_ms),
            },
            groups: GroupConfig {
                base_wait_timeout: Duration::from_millis(settings.groups.base_wait_timeout_ms),
                base_delay: Duration::from_millis(settings.groups.base_delay_ms),
                max_attempts: settings.groups.max_attempts.max(1),
            },
            update_buffer: settings.client.update_buffer.max(1),
        }
    }
}
