use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TurnId;

/// Retention cap applied after every insert when no other capacity is configured.
pub const DEFAULT_MAX_TURNS: usize = 50;

/// Who wrote a turn. Placeholders shown while a reply is pending count as `Model`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnAuthor {
    User,
    Model,
}

impl TurnAuthor {
    pub fn from_is_user(is_user: bool) -> Self {
        if is_user { Self::User } else { Self::Model }
    }

    pub fn is_user(self) -> bool {
        matches!(self, Self::User)
    }
}

/// Body of a turn.
///
/// Older exports stored the body as an object carrying a `text` field instead of a plain
/// string; both shapes decode, and readers should go through [`TurnContent::as_text`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TurnContent {
    Text(String),
    Legacy { text: String },
}

impl TurnContent {
    pub fn as_text(&self) -> &str {
        match self {
            Self::Text(text) | Self::Legacy { text } => text,
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Self::Text(text) | Self::Legacy { text } => text,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.as_text().trim().is_empty()
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::Legacy { .. })
    }
}

impl From<String> for TurnContent {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for TurnContent {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub id: TurnId,
    pub author: TurnAuthor,
    pub content: TurnContent,
    pub timestamp: DateTime<Utc>,
}

impl ChatTurn {
    pub fn is_user(&self) -> bool {
        self.author.is_user()
    }

    pub fn timestamp_iso(&self) -> String {
        format_timestamp(&self.timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTurn {
    pub author: TurnAuthor,
    pub content: TurnContent,
}

impl NewTurn {
    pub fn user(content: impl Into<TurnContent>) -> Self {
        Self {
            author: TurnAuthor::User,
            content: content.into(),
        }
    }

    pub fn model(content: impl Into<TurnContent>) -> Self {
        Self {
            author: TurnAuthor::Model,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyImportWarning {
    pub line_number: usize,
    pub reason: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyImportReport {
    pub source_path: String,
    pub source_missing: bool,
    pub imported_turns: usize,
    pub skipped_rows: usize,
    pub warnings: Vec<LegacyImportWarning>,
    pub already_migrated: bool,
}

/// Current time at the precision the store persists, so written and re-read values compare equal.
pub fn now_timestamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Fixed-width ISO-8601 (`2024-05-01T10:00:00.000Z`); lexical order matches time order.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|parsed| parsed.with_timezone(&Utc).trunc_subsecs(3))
}
