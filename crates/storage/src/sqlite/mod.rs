use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::error::{
    CreateSqliteDirectorySnafu, EncodeContentSnafu, InvalidTimestampSnafu,
    InvariantViolationSnafu, ParseLegacyExportSnafu, ReadLegacyExportSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu,
    SqliteQuerySnafu, StorageResult,
};
use super::ids::TurnId;
use super::types::{
    ChatTurn, LegacyImportReport, LegacyImportWarning, NewTurn, TurnAuthor, TurnContent,
    format_timestamp, parse_timestamp,
};
use super::{BoxFuture, TurnStore};

pub const DEFAULT_DATABASE_FILE_NAME: &str = "chat_history.db";

const CONTENT_SHAPE_TEXT: &str = "text";
const CONTENT_SHAPE_OBJECT: &str = "object";

#[derive(Debug, Clone)]
pub struct SqliteTurnStore {
    pool: SqlitePool,
    database_url: String,
    capacity: usize,
    // Eviction runs detached after each insert; the next operation waits for it first.
    pending_sweep: Arc<Mutex<Option<JoinHandle<()>>>>,
}

#[derive(Debug, FromRow)]
struct TurnRow {
    id: i64,
    is_user: bool,
    content: String,
    content_shape: String,
    timestamp: String,
}

#[derive(Debug, Deserialize)]
struct LegacyExportRow {
    #[serde(default)]
    id: Option<i64>,
    #[serde(rename = "isUser")]
    is_user: bool,
    content: TurnContent,
    timestamp: String,
}

#[derive(Debug)]
struct LegacyTurn {
    legacy_id: Option<i64>,
    author: TurnAuthor,
    content: TurnContent,
    timestamp: DateTime<Utc>,
}

impl SqliteTurnStore {
    /// Opens (or creates) the history database and applies pending schema migrations.
    pub async fn open(database_location: &str, capacity: usize) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // One long-lived connection: statements serialize on it and `:memory:` databases survive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(
            database_url = %database_url,
            journal_mode = %journal_mode,
            capacity,
            "opened sqlite turn store"
        );

        Ok(Self {
            pool,
            database_url,
            capacity: capacity.max(1),
            pending_sweep: Arc::new(Mutex::new(None)),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Imports a JSON array exported from the browser history store.
    ///
    /// Runs only against an empty store; a store that already holds turns is reported as
    /// migrated and left untouched. Rows that cannot be read are skipped with a warning.
    pub async fn import_legacy_export(&self, export_path: &Path) -> StorageResult<LegacyImportReport> {
        let source_path = export_path.display().to_string();
        let source_text = match tokio::fs::read_to_string(export_path).await {
            Ok(contents) => contents,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LegacyImportReport {
                    source_path,
                    source_missing: true,
                    imported_turns: 0,
                    skipped_rows: 0,
                    warnings: Vec::new(),
                    already_migrated: false,
                });
            }
            Err(source) => {
                return Err(source).context(ReadLegacyExportSnafu {
                    stage: "legacy-import-read-source",
                    path: source_path,
                });
            }
        };

        let (legacy_turns, warnings) = parse_legacy_export(&source_text, &source_path)?;
        self.settle_sweep().await;

        let existing_turns = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM chat_turns")
            .fetch_one(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "legacy-import-count-existing-turns",
            })?;

        if existing_turns > 0 {
            return Ok(LegacyImportReport {
                source_path,
                source_missing: false,
                imported_turns: 0,
                skipped_rows: warnings.len(),
                warnings,
                already_migrated: true,
            });
        }

        let imported_turns = legacy_turns.len();
        if imported_turns > 0 {
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "legacy-import-begin",
            })?;

            for turn in legacy_turns {
                let (content, shape) = encode_content(&turn.content)?;
                sqlx::query(
                    "INSERT INTO chat_turns (is_user, content, content_shape, timestamp) VALUES (?, ?, ?, ?)",
                )
                .bind(turn.author.is_user())
                .bind(content)
                .bind(shape)
                .bind(format_timestamp(&turn.timestamp))
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "legacy-import-insert-turn",
                })?;
            }

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "legacy-import-commit",
            })?;
            self.schedule_sweep().await;
        }

        tracing::info!(
            source_path = %source_path,
            imported_turns,
            skipped_rows = warnings.len(),
            "imported legacy chat export"
        );

        Ok(LegacyImportReport {
            source_path,
            source_missing: false,
            imported_turns,
            skipped_rows: warnings.len(),
            warnings,
            already_migrated: false,
        })
    }

    async fn settle_sweep(&self) {
        let pending = self.pending_sweep.lock().await.take();
        if let Some(handle) = pending {
            await_sweep(handle).await;
        }
    }

    async fn schedule_sweep(&self) {
        let pool = self.pool.clone();
        let capacity = self.capacity;
        let handle = tokio::spawn(async move {
            match evict_beyond_capacity(&pool, capacity).await {
                Ok(0) => {}
                Ok(evicted) => {
                    tracing::debug!(evicted, capacity, "evicted turns beyond retention cap");
                }
                Err(error) => {
                    tracing::warn!(error = %error, capacity, "eviction sweep failed");
                }
            }
        });

        let previous = self.pending_sweep.lock().await.replace(handle);
        if let Some(previous) = previous {
            await_sweep(previous).await;
        }
    }
}

impl TurnStore for SqliteTurnStore {
    fn append_at(
        &self,
        turn: NewTurn,
        timestamp: DateTime<Utc>,
    ) -> BoxFuture<'_, StorageResult<ChatTurn>> {
        Box::pin(async move {
            self.settle_sweep().await;

            let (content, shape) = encode_content(&turn.content)?;
            let id = sqlx::query_scalar::<_, i64>(
                "INSERT INTO chat_turns (is_user, content, content_shape, timestamp) VALUES (?, ?, ?, ?) RETURNING id",
            )
            .bind(turn.author.is_user())
            .bind(content)
            .bind(shape)
            .bind(format_timestamp(&timestamp))
            .fetch_one(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "turn-append-insert",
            })?;

            self.schedule_sweep().await;

            Ok(ChatTurn {
                id: TurnId::new(id),
                author: turn.author,
                content: turn.content,
                timestamp,
            })
        })
    }

    fn load_all(&self) -> BoxFuture<'_, StorageResult<Vec<ChatTurn>>> {
        Box::pin(async move {
            self.settle_sweep().await;

            let rows = sqlx::query_as::<_, TurnRow>(
                "SELECT id, is_user, content, content_shape, timestamp FROM chat_turns ORDER BY timestamp ASC, id ASC",
            )
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "turn-load-all-query",
            })?;

            rows.into_iter().map(turn_row_to_record).collect()
        })
    }

    fn remove(&self, id: TurnId) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.settle_sweep().await;

            let result = sqlx::query("DELETE FROM chat_turns WHERE id = ?")
                .bind(id.get())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "turn-remove-delete",
                })?;

            if result.rows_affected() == 0 {
                tracing::debug!(turn_id = %id, "turn to remove was already gone");
            }

            Ok(())
        })
    }

    fn clear(&self) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.settle_sweep().await;

            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "turn-clear-begin",
            })?;
            sqlx::query("DELETE FROM chat_turns")
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "turn-clear-delete",
                })?;
            tx.commit().await.context(SqliteQuerySnafu {
                stage: "turn-clear-commit",
            })?;

            Ok(())
        })
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

async fn await_sweep(handle: JoinHandle<()>) {
    if let Err(error) = handle.await {
        tracing::warn!(error = %error, "eviction sweep task did not complete");
    }
}

/// Keeps the `capacity` most recent turns by `(timestamp, id)` and deletes the rest.
async fn evict_beyond_capacity(pool: &SqlitePool, capacity: usize) -> StorageResult<usize> {
    let mut tx = pool.begin().await.context(SqliteQuerySnafu {
        stage: "turn-evict-begin",
    })?;

    let newest_first = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM chat_turns ORDER BY timestamp DESC, id DESC",
    )
    .fetch_all(&mut *tx)
    .await
    .context(SqliteQuerySnafu {
        stage: "turn-evict-scan",
    })?;

    let stale_ids = newest_first.into_iter().skip(capacity).collect::<Vec<_>>();
    for id in &stale_ids {
        sqlx::query("DELETE FROM chat_turns WHERE id = ?")
            .bind(*id)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "turn-evict-delete",
            })?;
    }

    tx.commit().await.context(SqliteQuerySnafu {
        stage: "turn-evict-commit",
    })?;

    Ok(stale_ids.len())
}

fn turn_row_to_record(row: TurnRow) -> StorageResult<ChatTurn> {
    let content = decode_content(row.content, &row.content_shape)?;
    let timestamp = parse_timestamp(&row.timestamp).context(InvalidTimestampSnafu {
        stage: "turn-row-timestamp",
        raw: row.timestamp.clone(),
    })?;

    Ok(ChatTurn {
        id: TurnId::new(row.id),
        author: TurnAuthor::from_is_user(row.is_user),
        content,
        timestamp,
    })
}

fn encode_content(content: &TurnContent) -> StorageResult<(String, &'static str)> {
    match content {
        TurnContent::Text(text) => Ok((text.clone(), CONTENT_SHAPE_TEXT)),
        TurnContent::Legacy { .. } => {
            let encoded = serde_json::to_string(content).context(EncodeContentSnafu {
                stage: "turn-content-encode-object",
            })?;
            Ok((encoded, CONTENT_SHAPE_OBJECT))
        }
    }
}

fn decode_content(raw: String, shape: &str) -> StorageResult<TurnContent> {
    match shape {
        CONTENT_SHAPE_TEXT => Ok(TurnContent::Text(raw)),
        CONTENT_SHAPE_OBJECT => match serde_json::from_str::<TurnContent>(&raw) {
            Ok(content) => Ok(content),
            Err(error) => InvariantViolationSnafu {
                stage: "turn-content-decode-object",
                details: format!("stored object content is unreadable: {error}"),
            }
            .fail(),
        },
        _ => InvariantViolationSnafu {
            stage: "turn-content-decode-shape",
            details: format!("unknown content shape '{shape}'"),
        }
        .fail(),
    }
}

fn parse_legacy_export(
    source_text: &str,
    source_path: &str,
) -> StorageResult<(Vec<LegacyTurn>, Vec<LegacyImportWarning>)> {
    let raw_rows = serde_json::from_str::<Vec<serde_json::Value>>(source_text).context(
        ParseLegacyExportSnafu {
            stage: "legacy-import-parse-array",
            path: source_path.to_string(),
        },
    )?;

    let mut turns = Vec::new();
    let mut warnings = Vec::new();

    for (index, raw_row) in raw_rows.into_iter().enumerate() {
        match parse_legacy_row(raw_row) {
            Ok(turn) => turns.push(turn),
            Err(reason) => warnings.push(LegacyImportWarning {
                line_number: index + 1,
                reason,
            }),
        }
    }

    // Insert oldest first so new ids follow the exported time order.
    turns.sort_by(|left, right| {
        left.timestamp
            .cmp(&right.timestamp)
            .then_with(|| left.legacy_id.cmp(&right.legacy_id))
    });

    Ok((turns, warnings))
}

fn parse_legacy_row(raw_row: serde_json::Value) -> Result<LegacyTurn, &'static str> {
    let row = serde_json::from_value::<LegacyExportRow>(raw_row).map_err(|_| "invalid-row")?;
    let timestamp = parse_timestamp(&row.timestamp).map_err(|_| "invalid-timestamp")?;
    if row.content.is_blank() {
        return Err("empty-content");
    }

    Ok(LegacyTurn {
        legacy_id: row.id,
        author: TurnAuthor::from_is_user(row.is_user),
        content: row.content,
        timestamp,
    })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
