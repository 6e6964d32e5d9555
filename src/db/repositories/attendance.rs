use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::{
    db::{
        connection::Database,
        helpers::{fmt_datetime, invalid_column, parse_datetime},
        models::AttendanceRecord,
    },
    otp::state::ConsumeOutcome,
};

use super::codes::{evaluate_consume, mark_consumed};

#[derive(Debug, Clone)]
pub enum CommitOutcome {
    Recorded(AttendanceRecord),
    /// A gate failed between scoring and commit; nothing was written.
    Rejected(ConsumeOutcome),
}

fn row_to_attendance(row: &Row) -> Result<AttendanceRecord, rusqlite::Error> {
    let recorded_at: String = row.get("recorded_at")?;

    Ok(AttendanceRecord {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        student_id: row.get("student_id")?,
        face_confidence: row.get("face_confidence")?,
        factors_json: row.get("factors_json")?,
        recorded_at: parse_datetime(&recorded_at, "recorded_at").map_err(invalid_column)?,
    })
}

impl Database {
    /// Consumes the code and inserts the attendance row in one transaction.
    pub async fn commit_attendance(
        &self,
        session_id: &str,
        student_id: &str,
        submitted: &str,
        face_confidence: Option<f64>,
        factors_json: String,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome> {
        let session_id = session_id.to_string();
        let student_id = student_id.to_string();
        let submitted = submitted.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;

            let outcome = evaluate_consume(&tx, &session_id, &student_id, &submitted, now)?;
            if outcome != ConsumeOutcome::Accepted {
                return Ok(CommitOutcome::Rejected(outcome));
            }
            if !mark_consumed(&tx, &session_id, &student_id, &submitted, now)? {
                return Ok(CommitOutcome::Rejected(ConsumeOutcome::AlreadyConsumed));
            }

            tx.execute(
                "INSERT INTO attendance (session_id, student_id, face_confidence, factors_json, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    session_id,
                    student_id,
                    face_confidence,
                    factors_json,
                    fmt_datetime(&now),
                ],
            )
            .with_context(|| format!("failed to record attendance for {student_id}"))?;
            let id = tx.last_insert_rowid();

            tx.commit()?;
            Ok(CommitOutcome::Recorded(AttendanceRecord {
                id,
                session_id,
                student_id,
                face_confidence,
                factors_json,
                recorded_at: now,
            }))
        })
        .await
    }

    pub async fn get_attendance(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<Option<AttendanceRecord>> {
        let session_id = session_id.to_string();
        let student_id = student_id.to_string();
        self.execute(move |conn| {
            conn.query_row(
                "SELECT id, session_id, student_id, face_confidence, factors_json, recorded_at
                 FROM attendance WHERE session_id = ?1 AND student_id = ?2",
                params![session_id, student_id],
                row_to_attendance,
            )
            .optional()
            .with_context(|| format!("failed to load attendance for {student_id}"))
        })
        .await
    }

    pub async fn attendance_for_session(&self, session_id: &str) -> Result<Vec<AttendanceRecord>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, student_id, face_confidence, factors_json, recorded_at
                 FROM attendance WHERE session_id = ?1 ORDER BY recorded_at ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![session_id], row_to_attendance)?;
            let records = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }
}
