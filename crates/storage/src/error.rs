use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("storage id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: std::num::ParseIntError,
    },
    #[snafu(display("storage invariant violation: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("failed to create sqlite directory at {path}"))]
    CreateSqliteDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse sqlite connection URL '{database_url}'"))]
    SqliteConnectOptions {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to connect sqlite database '{database_url}'"))]
    SqliteConnect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to configure sqlite pragma '{pragma}'"))]
    SqlitePragma {
        stage: &'static str,
        pragma: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("failed to run sqlite migrations"))]
    SqliteMigrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("sqlite query failed at {stage}: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("stored timestamp '{raw}' is not ISO-8601"))]
    InvalidTimestamp {
        stage: &'static str,
        raw: String,
        source: chrono::ParseError,
    },
    #[snafu(display("failed to encode turn content"))]
    EncodeContent {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to read legacy chat export from {path}"))]
    ReadLegacyExport {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("legacy chat export at {path} is not a JSON array of turns"))]
    ParseLegacyExport {
        stage: &'static str,
        path: String,
        source: serde_json::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;
