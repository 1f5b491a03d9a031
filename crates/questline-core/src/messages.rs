//! Content messages exchanged over groups, and the typed updates consumers see.
//!
//! On the wire every payload is a JSON object tagged by `type`. The client
//! sends `content_request`; publishers answer with one of the update kinds.
//! [`ContentMessage::into_update`] turns an incoming message into the
//! [`ContentUpdate`] handed to the UI layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry of the event stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEntry {
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Free-form event kind (e.g. `quest_started`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Human-readable description.
    pub message: String,
}

/// A trainer, skill, or spell summary panel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Panel title.
    pub title: String,
    /// Markdown body.
    #[serde(default)]
    pub markdown: String,
}

/// A player profile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Stable profile id.
    pub id: String,
    /// Display name.
    pub name: String,
}

/// Wire-level group payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentMessage {
    /// Ask publishers on the channel for the file's content.
    ContentRequest {
        /// Requested content identifier.
        filename: String,
    },
    /// Markdown content for one file.
    MarkdownContent {
        /// Content identifier.
        filename: String,
        /// Markdown source.
        content: String,
    },
    /// A batch of event stream entries.
    Events {
        /// Entries, oldest first.
        events: Vec<EventEntry>,
    },
    /// Trainer summary panel.
    TrainerSummary {
        /// Panel content.
        summary: Summary,
    },
    /// Skill summary panel.
    SkillSummary {
        /// Panel content.
        summary: Summary,
    },
    /// Spell summary panel.
    SpellSummary {
        /// Panel content.
        summary: Summary,
    },
    /// The profile roster.
    Profiles {
        /// All known profiles.
        profiles: Vec<Profile>,
    },
    /// The active profile.
    CurrentProfile {
        /// Active profile.
        profile: Profile,
    },
    /// Root navigation, pushed on `navigation` whenever a publisher connects.
    InitialNavigation {
        /// Navigation markdown.
        content: String,
    },
}

impl ContentMessage {
    /// Decode a group payload. Returns `None` for anything unrecognized.
    pub fn decode(data: &Value) -> Option<Self> {
        Self::deserialize(data).ok()
    }

    /// Encode as a JSON payload.
    pub fn to_value(&self) -> Value {
        // Serializing a derive-only enum of strings and vecs cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Convert into the update delivered to consumers.
    ///
    /// Requests are not updates and yield `None`.
    pub fn into_update(self, group: &str) -> Option<ContentUpdate> {
        match self {
            Self::ContentRequest { .. } => None,
            Self::MarkdownContent { filename, content } => Some(ContentUpdate::Content {
                group: group.to_string(),
                filename,
                content,
            }),
            Self::Events { events } => Some(ContentUpdate::Events(events)),
            Self::TrainerSummary { summary } => Some(ContentUpdate::Trainer(summary)),
            Self::SkillSummary { summary } => Some(ContentUpdate::Skills(summary)),
            Self::SpellSummary { summary } => Some(ContentUpdate::Spells(summary)),
            Self::Profiles { profiles } => Some(ContentUpdate::Profiles(profiles)),
            Self::CurrentProfile { profile } => Some(ContentUpdate::CurrentProfile(profile)),
            Self::InitialNavigation { content } => Some(ContentUpdate::Navigation(content)),
        }
    }
}

/// A typed update for the UI layer.
#[derive(Clone, Debug, PartialEq)]
pub enum ContentUpdate {
    /// Markdown content arrived on a channel.
    Content {
        /// Channel it arrived on.
        group: String,
        /// Content identifier.
        filename: String,
        /// Markdown source.
        content: String,
    },
    /// Event stream entries.
    Events(Vec<EventEntry>),
    /// Trainer summary.
    Trainer(Summary),
    /// Skill summary.
    Skills(Summary),
    /// Spell summary.
    Spells(Summary),
    /// Profile roster.
    Profiles(Vec<Profile>),
    /// Active profile.
    CurrentProfile(Profile),
    /// Root navigation markdown.
    Navigation(String),
}
