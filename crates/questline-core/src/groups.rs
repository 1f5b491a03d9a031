//! Group (channel) status and naming.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Channel carrying navigation content and the content index.
pub const NAVIGATION: &str = "navigation";
/// Channel carrying the event stream.
pub const EVENTS: &str = "events";
/// Channel carrying story updates.
pub const STORY: &str = "story";
/// Channel carrying detail panels (trainer, skill, spell summaries).
pub const DETAILS: &str = "details";

/// Channels the UI joins independently of the selected content.
pub const WELL_KNOWN: [&str; 4] = [NAVIGATION, EVENTS, STORY, DETAILS];

/// Subscription status of one channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    /// Not a member (initial state, explicit leave, or lost base connection).
    #[default]
    Disconnected,
    /// A join attempt is running or waiting out a backoff delay.
    Connecting,
    /// The service acknowledged the join.
    Connected,
    /// Join attempts were exhausted; requires a manual retry.
    Error,
}

impl GroupStatus {
    /// Lowercase name used in logs and UI.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a content identifier to its channel name.
///
/// Path segments are joined with `_`; empty segments (leading, trailing, or
/// doubled separators) are dropped and `\` counts as a separator.
/// Returns `None` when the identifier has no segments at all.
pub fn channel_for_file(filename: &str) -> Option<String> {
    let segments: Vec<&str> = filename
        .split(['/', '\\'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if segments.is_empty() {
        None
    } else {
        Some(segments.join("_"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_path_maps_to_joined_segments() {
        assert_eq!(
            channel_for_file("quests/dragon.md").as_deref(),
            Some("quests_dragon.md")
        );
    }

    #[test]
    fn single_segment_is_unchanged() {
        assert_eq!(channel_for_file("intro.md").as_deref(), Some("intro.md"));
    }

    #[test]
    fn stray_separators_are_ignored() {
        assert_eq!(
            channel_for_file("/quests//act1/dragon.md/").as_deref(),
            Some("quests_act1_dragon.md")
        );
        assert_eq!(
            channel_for_file("quests\\dragon.md").as_deref(),
            Some("quests_dragon.md")
        );
    }

    #[test]
    fn empty_identifier_has_no_channel() {
        assert_eq!(channel_for_file(""), None);
        assert_eq!(channel_for_file("//"), None);
    }

    #[test]
    fn status_names() {
        assert_eq!(GroupStatus::default(), GroupStatus::Disconnected);
        assert_eq!(GroupStatus::Connecting.to_string(), "connecting");
        assert_eq!(
            serde_json::to_string(&GroupStatus::Error).unwrap(),
            "\"error\""
        );
    }
}
