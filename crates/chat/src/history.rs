use gemchat_llm::{ProjectedTurn, WireRole};
use gemchat_storage::{ChatTurn, TurnAuthor};

use crate::conversation::ViewTurn;

/// Maps stored turns onto the wire history, one entry per turn in the same order.
///
/// Legacy `{ text }` bodies are unwrapped; nothing is filtered or truncated here.
pub fn project(turns: &[ChatTurn]) -> Vec<ProjectedTurn> {
    turns.iter().map(project_turn).collect()
}

pub fn project_turn(turn: &ChatTurn) -> ProjectedTurn {
    ProjectedTurn::new(wire_role(turn.author), turn.content.as_text())
}

/// Same mapping over the transcript, for when the store cannot be read. Pending
/// placeholders are not history and are skipped.
pub fn project_view(turns: &[ViewTurn]) -> Vec<ProjectedTurn> {
    turns
        .iter()
        .filter(|turn| !turn.pending)
        .map(|turn| ProjectedTurn::new(wire_role(turn.author), turn.content.as_str()))
        .collect()
}

fn wire_role(author: TurnAuthor) -> WireRole {
    match author {
        TurnAuthor::User => WireRole::User,
        TurnAuthor::Model => WireRole::Model,
    }
}

#[cfg(test)]
mod tests {
    use gemchat_storage::{TurnContent, TurnId, parse_timestamp};

    use super::*;
    use crate::conversation::PENDING_PLACEHOLDER;

    fn turn(id: i64, author: TurnAuthor, content: TurnContent) -> ChatTurn {
        ChatTurn {
            id: TurnId::new(id),
            author,
            content,
            timestamp: parse_timestamp("2024-05-01T10:00:00.000Z").unwrap(),
        }
    }

    #[test]
    fn projection_keeps_order_roles_and_text() {
        let turns = vec![
            turn(1, TurnAuthor::User, TurnContent::from("hi")),
            turn(2, TurnAuthor::Model, TurnContent::from("hello\n```rust\nfn main() {}\n```")),
            turn(3, TurnAuthor::User, TurnContent::from("  spaced  ")),
        ];

        let projected = project(&turns);

        assert_eq!(projected.len(), turns.len());
        for (stored, wire) in turns.iter().zip(&projected) {
            let expected_role = if stored.is_user() {
                WireRole::User
            } else {
                WireRole::Model
            };
            assert_eq!(wire.role, expected_role);
            assert_eq!(wire.parts.len(), 1);
            assert_eq!(wire.parts[0].text, stored.content.as_text());
        }
    }

    #[test]
    fn legacy_object_content_is_unwrapped() {
        let legacy = turn(
            1,
            TurnAuthor::Model,
            TurnContent::Legacy {
                text: "hello".to_string(),
            },
        );

        assert_eq!(project_turn(&legacy), ProjectedTurn::model("hello"));
    }

    #[test]
    fn projecting_twice_gives_the_same_result() {
        let turns = vec![turn(1, TurnAuthor::User, TurnContent::from("a"))];
        assert_eq!(project(&turns), project(&turns));
        assert!(project(&[]).is_empty());
    }

    #[test]
    fn view_projection_skips_pending_placeholders() {
        let timestamp = parse_timestamp("2024-05-01T10:00:00.000Z").unwrap();
        let view = vec![
            ViewTurn {
                key: 1,
                author: TurnAuthor::User,
                content: "q".to_string(),
                timestamp,
                stored_id: None,
                pending: false,
            },
            ViewTurn {
                key: 2,
                author: TurnAuthor::Model,
                content: PENDING_PLACEHOLDER.to_string(),
                timestamp,
                stored_id: None,
                pending: true,
            },
        ];

        assert_eq!(project_view(&view), vec![ProjectedTurn::user("q")]);
    }
}
