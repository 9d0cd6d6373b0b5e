use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::error::StorageResult;
use super::ids::TurnId;
use super::types::{ChatTurn, NewTurn};
use super::{BoxFuture, TurnStore};

/// Process-local store used when the history database cannot be opened.
///
/// Same ordering and retention rules as the sqlite store; nothing survives a restart.
#[derive(Debug)]
pub struct MemoryTurnStore {
    state: Mutex<MemoryState>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    last_id: i64,
    turns: Vec<ChatTurn>,
}

impl MemoryTurnStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            capacity: capacity.max(1),
        }
    }
}

impl MemoryState {
    fn sort(&mut self) {
        self.turns.sort_by(|left, right| {
            left.timestamp
                .cmp(&right.timestamp)
                .then_with(|| left.id.cmp(&right.id))
        });
    }

    fn evict_beyond(&mut self, capacity: usize) -> usize {
        let excess = self.turns.len().saturating_sub(capacity);
        // Sorted oldest first, so the excess sits at the front.
        self.turns.drain(..excess);
        excess
    }
}

impl TurnStore for MemoryTurnStore {
    fn append_at(
        &self,
        turn: NewTurn,
        timestamp: DateTime<Utc>,
    ) -> BoxFuture<'_, StorageResult<ChatTurn>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.last_id += 1;
            let record = ChatTurn {
                id: TurnId::new(state.last_id),
                author: turn.author,
                content: turn.content,
                timestamp,
            };
            state.turns.push(record.clone());
            state.sort();

            let evicted = state.evict_beyond(self.capacity);
            if evicted > 0 {
                tracing::debug!(evicted, capacity = self.capacity, "evicted in-memory turns");
            }

            Ok(record)
        })
    }

    fn load_all(&self) -> BoxFuture<'_, StorageResult<Vec<ChatTurn>>> {
        Box::pin(async move { Ok(self.state.lock().await.turns.clone()) })
    }

    fn remove(&self, id: TurnId) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.state.lock().await.turns.retain(|turn| turn.id != id);
            Ok(())
        })
    }

    fn clear(&self) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.state.lock().await.turns.clear();
            Ok(())
        })
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::types::{DEFAULT_MAX_TURNS, parse_timestamp};

    #[tokio::test]
    async fn keeps_the_newest_turns_in_time_order() {
        let store = MemoryTurnStore::new(DEFAULT_MAX_TURNS);
        let start = parse_timestamp("2024-05-01T10:00:00.000Z").unwrap();

        // Reverse insertion: ids grow while timestamps shrink.
        for index in (0..60_i64).rev() {
            store
                .append_at(
                    NewTurn::user(format!("turn {index}")),
                    start + Duration::seconds(index),
                )
                .await
                .unwrap();
        }

        let turns = store.load_all().await.unwrap();
        assert_eq!(turns.len(), DEFAULT_MAX_TURNS);
        assert_eq!(turns.first().unwrap().content.as_text(), "turn 10");
        assert_eq!(turns.last().unwrap().content.as_text(), "turn 59");
        assert!(turns.windows(2).all(|pair| pair[0].timestamp <= pair[1].timestamp));
    }

    #[tokio::test]
    async fn clear_then_append_issues_fresh_ids() {
        let store = MemoryTurnStore::new(DEFAULT_MAX_TURNS);
        let first = store.append(NewTurn::user("a")).await.unwrap();
        store.clear().await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());

        let second = store.append(NewTurn::model("b")).await.unwrap();
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn equal_timestamps_keep_insertion_order_and_evict_the_lower_id() {
        let store = MemoryTurnStore::new(2);
        let stamp = parse_timestamp("2024-05-01T10:00:00.000Z").unwrap();

        let first = store.append_at(NewTurn::user("a"), stamp).await.unwrap();
        let second = store.append_at(NewTurn::model("b"), stamp).await.unwrap();
        let third = store.append_at(NewTurn::user("c"), stamp).await.unwrap();

        let ids = store
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .map(|turn| turn.id)
            .collect::<Vec<_>>();
        assert!(first.id < second.id && second.id < third.id);
        assert_eq!(ids, vec![second.id, third.id]);
    }
}
