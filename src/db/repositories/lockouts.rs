use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{
    connection::Database,
    helpers::{fmt_datetime, invalid_column, parse_optional_datetime},
    models::AccountLock,
};

fn row_to_lock(row: &Row) -> Result<AccountLock, rusqlite::Error> {
    let locked_at: Option<String> = row.get("locked_at")?;
    let unlocked_at: Option<String> = row.get("unlocked_at")?;

    Ok(AccountLock {
        student_id: row.get("student_id")?,
        locked: row.get("locked")?,
        locked_at: parse_optional_datetime(locked_at, "locked_at").map_err(invalid_column)?,
        reason: row.get("reason")?,
        unlocked_at: parse_optional_datetime(unlocked_at, "unlocked_at").map_err(invalid_column)?,
    })
}

pub(super) fn load_lock(conn: &Connection, student_id: &str) -> Result<Option<AccountLock>> {
    conn.query_row(
        "SELECT student_id, locked, locked_at, reason, unlocked_at
         FROM account_locks WHERE student_id = ?1",
        params![student_id],
        row_to_lock,
    )
    .optional()
    .with_context(|| format!("failed to load account lock for {student_id}"))
}

pub(super) fn account_locked(conn: &Connection, student_id: &str) -> Result<bool> {
    Ok(load_lock(conn, student_id)?.is_some_and(|lock| lock.locked))
}

pub(super) fn lock_account(
    conn: &Connection,
    student_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO account_locks (student_id, locked, locked_at, reason, unlocked_at)
         VALUES (?1, 1, ?2, ?3, NULL)
         ON CONFLICT(student_id) DO UPDATE SET
             locked = 1,
             locked_at = excluded.locked_at,
             reason = excluded.reason",
        params![student_id, fmt_datetime(&now), reason],
    )
    .with_context(|| format!("failed to lock account {student_id}"))?;
    Ok(())
}

impl Database {
    /// Lock row for the student, if one was ever written.
    pub async fn account_lock(&self, student_id: &str) -> Result<Option<AccountLock>> {
        let student_id = student_id.to_string();
        self.execute(move |conn| load_lock(conn, &student_id)).await
    }

    /// Clears the lock. Returns `false` when the account was not locked.
    pub async fn unlock_account(&self, student_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let student_id = student_id.to_string();
        self.execute(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE account_locks SET locked = 0, unlocked_at = ?1
                     WHERE student_id = ?2 AND locked = 1",
                    params![fmt_datetime(&now), student_id],
                )
                .with_context(|| format!("failed to unlock account {student_id}"))?;
            Ok(changed > 0)
        })
        .await
    }
}
