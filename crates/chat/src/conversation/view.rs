use chrono::{DateTime, Utc};
use gemchat_storage::{ChatTurn, TurnAuthor, TurnId};

/// Content shown for the model turn while its reply is outstanding. Never persisted.
pub const PENDING_PLACEHOLDER: &str = "typing...";

/// One row of the in-memory transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewTurn {
    /// View-local handle; unlike `stored_id` it exists before anything is persisted.
    pub key: u64,
    pub author: TurnAuthor,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub stored_id: Option<TurnId>,
    pub pending: bool,
}

impl ViewTurn {
    pub fn is_user(&self) -> bool {
        self.author.is_user()
    }
}

/// Handles to the two turns an exchange adds to the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeKeys {
    pub question: u64,
    pub placeholder: u64,
}

#[derive(Debug, Default)]
pub struct ConversationView {
    turns: Vec<ViewTurn>,
    draft: String,
    next_key: u64,
}

impl ConversationView {
    pub fn turns(&self) -> &[ViewTurn] {
        &self.turns
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn set_draft(&mut self, draft: impl Into<String>) {
        self.draft = draft.into();
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Replaces the transcript with stored history. The draft is kept.
    pub fn replace_with_stored(&mut self, stored: &[ChatTurn]) {
        self.turns.clear();
        for turn in stored {
            let key = self.alloc_key();
            self.turns.push(ViewTurn {
                key,
                author: turn.author,
                content: turn.content.as_text().to_string(),
                timestamp: turn.timestamp,
                stored_id: Some(turn.id),
                pending: false,
            });
        }
    }

    /// Shows the question plus a pending model placeholder and clears the draft.
    ///
    /// `stored_id` is `None` when the question could not be persisted.
    pub fn begin_exchange(
        &mut self,
        question: &str,
        timestamp: DateTime<Utc>,
        stored_id: Option<TurnId>,
    ) -> ExchangeKeys {
        let question_key = self.alloc_key();
        self.turns.push(ViewTurn {
            key: question_key,
            author: TurnAuthor::User,
            content: question.to_string(),
            timestamp,
            stored_id,
            pending: false,
        });

        let placeholder_key = self.alloc_key();
        self.turns.push(ViewTurn {
            key: placeholder_key,
            author: TurnAuthor::Model,
            content: PENDING_PLACEHOLDER.to_string(),
            timestamp,
            stored_id: None,
            pending: true,
        });

        self.draft.clear();

        ExchangeKeys {
            question: question_key,
            placeholder: placeholder_key,
        }
    }

    /// Whether the exchange's placeholder is still waiting in the transcript.
    pub fn is_awaiting(&self, keys: ExchangeKeys) -> bool {
        self.turns
            .iter()
            .any(|turn| turn.key == keys.placeholder && turn.pending)
    }

    /// Swaps the placeholder for the reply. Returns `false` when the placeholder is gone,
    /// which happens if the transcript was cleared while the exchange was in flight.
    pub fn complete_exchange(
        &mut self,
        keys: ExchangeKeys,
        reply: String,
        stored_id: Option<TurnId>,
        timestamp: DateTime<Utc>,
    ) -> bool {
        let Some(placeholder) = self
            .turns
            .iter_mut()
            .find(|turn| turn.key == keys.placeholder)
        else {
            return false;
        };

        placeholder.content = reply;
        placeholder.stored_id = stored_id;
        placeholder.timestamp = timestamp;
        placeholder.pending = false;
        true
    }

    /// Drops both optimistic turns and puts the original input back into the draft.
    pub fn rollback_exchange(&mut self, keys: ExchangeKeys, draft: String) {
        self.turns
            .retain(|turn| turn.key != keys.question && turn.key != keys.placeholder);
        self.draft = draft;
    }

    pub fn committed_turns(&self) -> impl Iterator<Item = &ViewTurn> {
        self.turns.iter().filter(|turn| !turn.pending)
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    fn alloc_key(&mut self) -> u64 {
        self.next_key = self.next_key.saturating_add(1);
        self.next_key
    }
}

#[cfg(test)]
mod tests {
    use gemchat_storage::{TurnContent, parse_timestamp};

    use super::*;

    fn base_time() -> DateTime<Utc> {
        parse_timestamp("2024-05-01T10:00:00.000Z").unwrap()
    }

    fn stored(id: i64, author: TurnAuthor, text: &str) -> ChatTurn {
        ChatTurn {
            id: TurnId::new(id),
            author,
            content: TurnContent::from(text),
            timestamp: base_time(),
        }
    }

    #[test]
    fn exchange_adds_question_and_placeholder_then_commits_reply() {
        let mut view = ConversationView::default();
        view.set_draft("hello?");

        let keys = view.begin_exchange("hello?", base_time(), Some(TurnId::new(1)));
        assert!(view.is_awaiting(keys));
        assert_eq!(view.draft(), "");
        assert_eq!(view.turns().len(), 2);
        assert!(view.turns()[1].pending);
        assert_eq!(view.turns()[1].content, PENDING_PLACEHOLDER);
        assert_eq!(view.committed_turns().count(), 1);

        let now = parse_timestamp("2024-05-01T10:00:01.000Z").unwrap();
        assert!(view.complete_exchange(keys, "hi!".to_string(), Some(TurnId::new(2)), now));
        assert!(!view.is_awaiting(keys));
        assert_eq!(view.turns()[1].content, "hi!");
        assert_eq!(view.turns()[1].stored_id, Some(TurnId::new(2)));
        assert_eq!(view.committed_turns().count(), 2);
    }

    #[test]
    fn rollback_restores_previous_transcript_and_draft() {
        let mut view = ConversationView::default();
        view.replace_with_stored(&[stored(1, TurnAuthor::User, "A")]);
        let before = view.turns().to_vec();

        let keys = view.begin_exchange("B", base_time(), None);
        assert_eq!(view.turns()[1].stored_id, None);
        view.rollback_exchange(keys, "B ".to_string());

        assert_eq!(view.turns(), before.as_slice());
        assert_eq!(view.draft(), "B ");
    }

    #[test]
    fn completing_after_clear_is_a_no_op() {
        let mut view = ConversationView::default();
        let keys = view.begin_exchange("q", base_time(), Some(TurnId::new(1)));
        view.clear();
        assert!(!view.is_awaiting(keys));

        let now = parse_timestamp("2024-05-01T10:00:01.000Z").unwrap();
        assert!(!view.complete_exchange(keys, "late".to_string(), None, now));
        assert!(view.is_empty());
    }
}
