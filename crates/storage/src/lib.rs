use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};

pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::TurnId;
pub use memory::MemoryTurnStore;
pub use sqlite::SqliteTurnStore;
pub use types::{
    ChatTurn, DEFAULT_MAX_TURNS, LegacyImportReport, LegacyImportWarning, NewTurn, TurnAuthor,
    TurnContent, format_timestamp, now_timestamp, parse_timestamp,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Bounded, timestamp-ordered log of chat turns.
///
/// Every insert is followed by an eviction sweep that keeps only the [`TurnStore::capacity`]
/// most recent turns; sweep failures are logged and never reach the caller.
pub trait TurnStore: Send + Sync {
    fn append(&self, turn: NewTurn) -> BoxFuture<'_, StorageResult<ChatTurn>> {
        self.append_at(turn, now_timestamp())
    }

    fn append_at(
        &self,
        turn: NewTurn,
        timestamp: DateTime<Utc>,
    ) -> BoxFuture<'_, StorageResult<ChatTurn>>;

    /// All turns, oldest first. Equal timestamps keep insertion order.
    fn load_all(&self) -> BoxFuture<'_, StorageResult<Vec<ChatTurn>>>;

    fn remove(&self, id: TurnId) -> BoxFuture<'_, StorageResult<()>>;

    fn clear(&self) -> BoxFuture<'_, StorageResult<()>>;

    fn capacity(&self) -> usize;
}
