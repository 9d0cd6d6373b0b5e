use std::fmt;
use std::str::FromStr;

use snafu::ResultExt;

use super::error::{InvalidIdSnafu, StorageError, StorageResult};

/// Row handle assigned by the store. Only identifies a turn; ordering uses timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub i64);

impl TurnId {
    pub fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        let parsed = raw.trim().parse::<i64>().context(InvalidIdSnafu {
            stage: "parse-turn-id",
            id_type: "turn-id",
            raw: raw.to_string(),
        })?;
        Ok(Self(parsed))
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl From<i64> for TurnId {
    fn from(value: i64) -> Self {
        Self::new(value)
    }
}

impl From<TurnId> for i64 {
    fn from(value: TurnId) -> Self {
        value.0
    }
}

impl FromStr for TurnId {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays_round_trip() {
        let id = TurnId::parse(" 42 ").unwrap();
        assert_eq!(id, TurnId(42));
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn rejects_non_numeric_ids() {
        let error = "abc".parse::<TurnId>().unwrap_err();
        assert!(matches!(error, StorageError::InvalidId { raw, .. } if raw == "abc"));
    }
}
