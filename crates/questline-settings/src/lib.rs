//! # questline-settings
//!
//! Configuration for the Questline binaries, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults** - [`QuestlineSettings::default()`]
//! 2. **User file** - `~/.questline/settings.json` (deep-merged over defaults)
//! 3. **Environment variables** - `QUESTLINE_*` and the Web PubSub
//!    connection variables (highest priority)
//!
//! Settings are plain data. Each runtime crate converts the section it needs
//! into its own config type, and the binary passes those down explicitly.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_match_documented_timings() {
        let settings = QuestlineSettings::default();
        assert_eq!(settings.connection.max_attempts, 3);
        assert_eq!(settings.connection.retry_delay_ms, 5_000);
        assert_eq!(settings.connection.token_refresh_ms, 55 * 60 * 1000);
        assert_eq!(settings.groups.base_wait_timeout_ms, 10_000);
        assert_eq!(settings.groups.max_attempts, 3);
        assert_eq!(settings.pubsub.token_lifetime_ms, 60 * 60 * 1000);
        assert!(settings.pubsub.connection_string.is_none());
    }
}
