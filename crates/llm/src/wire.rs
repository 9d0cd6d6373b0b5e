use std::fmt;

use serde::{Deserialize, Serialize};

/// Author role in the shape the completion endpoint expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireRole {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPart {
    pub text: String,
}

/// One history entry as sent upstream: `{ "role": "user", "parts": [{ "text": "..." }] }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectedTurn {
    pub role: WireRole,
    pub parts: Vec<TextPart>,
}

impl ProjectedTurn {
    pub fn new(role: WireRole, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![TextPart { text: text.into() }],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(WireRole::User, text)
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::new(WireRole::Model, text)
    }

    /// Concatenated text of all parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .map(|part| part.text.as_str())
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    pub question: String,
    pub chat_history: Vec<ProjectedTurn>,
    pub api_key: String,
    pub model: String,
}

impl CompletionRequest {
    pub fn new(
        question: impl Into<String>,
        chat_history: Vec<ProjectedTurn>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            question: question.into(),
            chat_history,
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

// Keeps the credential out of logs.
impl fmt::Debug for CompletionRequest {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("CompletionRequest")
            .field("question", &self.question)
            .field("chat_history_len", &self.chat_history.len())
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .finish()
    }
}
