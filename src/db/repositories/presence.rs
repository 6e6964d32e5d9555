use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{
    connection::Database,
    helpers::{fmt_datetime, invalid_column, parse_datetime},
    models::PresenceFix,
};

fn row_to_fix(row: &Row) -> Result<PresenceFix, rusqlite::Error> {
    let observed_at: String = row.get("observed_at")?;

    Ok(PresenceFix {
        student_id: row.get("student_id")?,
        session_id: row.get("session_id")?,
        latitude: row.get("latitude")?,
        longitude: row.get("longitude")?,
        observed_at: parse_datetime(&observed_at, "observed_at").map_err(invalid_column)?,
    })
}

impl Database {
    pub async fn last_presence(&self, student_id: &str) -> Result<Option<PresenceFix>> {
        let student_id = student_id.to_string();
        self.execute(move |conn| {
            conn.query_row(
                "SELECT student_id, session_id, latitude, longitude, observed_at
                 FROM presence_fixes WHERE student_id = ?1",
                params![student_id],
                row_to_fix,
            )
            .optional()
            .with_context(|| format!("failed to load presence for {student_id}"))
        })
        .await
    }

    /// Keeps only the most recent fix per student.
    pub async fn record_presence(&self, fix: PresenceFix) -> Result<()> {
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO presence_fixes (student_id, session_id, latitude, longitude, observed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(student_id) DO UPDATE SET
                     session_id = excluded.session_id,
                     latitude = excluded.latitude,
                     longitude = excluded.longitude,
                     observed_at = excluded.observed_at",
                params![
                    fix.student_id,
                    fix.session_id,
                    fix.latitude,
                    fix.longitude,
                    fmt_datetime(&fix.observed_at),
                ],
            )
            .with_context(|| format!("failed to record presence for {}", fix.student_id))?;
            Ok(())
        })
        .await
    }
}
