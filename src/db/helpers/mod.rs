use std::convert::TryFrom;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::db::models::{CodeState, LockState};

pub fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

pub fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("{field} contains negative value {value}"))
}

pub fn to_u32(value: i64, field: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("{field} out of range: {value}"))
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
pub fn fmt_datetime(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn fmt_optional_datetime(value: Option<&DateTime<Utc>>) -> Option<String> {
    value.map(fmt_datetime)
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn parse_optional_datetime(
    value: Option<String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => parse_datetime(&raw, field).map(Some),
        None => Ok(None),
    }
}

/// Wraps a decode failure so it can be returned from a row mapper.
pub fn invalid_column(err: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(err.into())
}

pub fn parse_code_state(value: &str) -> Result<CodeState> {
    match value {
        "Issued" => Ok(CodeState::Issued),
        "Consumed" => Ok(CodeState::Consumed),
        "Expired" => Ok(CodeState::Expired),
        other => Err(anyhow!("unknown code state {other}")),
    }
}

pub fn parse_lock_state(value: &str) -> Result<LockState> {
    match value {
        "Open" => Ok(LockState::Open),
        "Locked" => Ok(LockState::Locked),
        other => Err(anyhow!("unknown lock state {other}")),
    }
}
