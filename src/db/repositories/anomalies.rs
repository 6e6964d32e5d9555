use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{
    connection::Database,
    helpers::{
        fmt_datetime, fmt_optional_datetime, invalid_column, parse_datetime,
        parse_optional_datetime, to_u32,
    },
    models::{AnomalyRecord, AnomalyType},
};

use super::lockouts::{load_lock, lock_account};

const ANOMALY_COLUMNS: &str = "id, session_id, student_id, anomaly_type, reason, confidences_json,
    created_at, reviewed, reviewed_by, reviewed_at";

/// What a proxy attempt did to the student's standing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyTally {
    pub anomaly_id: i64,
    /// Proxy attempts inside the rolling window, this one included.
    pub proxy_count: u32,
    /// Set only by the attempt that crossed the threshold.
    pub lockout_triggered: bool,
}

fn row_to_anomaly(row: &Row) -> Result<AnomalyRecord, rusqlite::Error> {
    let anomaly_type: String = row.get("anomaly_type")?;
    let confidences_json: String = row.get("confidences_json")?;
    let created_at: String = row.get("created_at")?;
    let reviewed_at: Option<String> = row.get("reviewed_at")?;

    let confidences: BTreeMap<String, f64> = serde_json::from_str(&confidences_json)
        .map_err(|e| invalid_column(anyhow!("invalid confidences_json: {e}")))?;

    Ok(AnomalyRecord {
        id: Some(row.get("id")?),
        session_id: row.get("session_id")?,
        student_id: row.get("student_id")?,
        anomaly_type: AnomalyType::parse(&anomaly_type)
            .ok_or_else(|| invalid_column(anyhow!("unknown anomaly type {anomaly_type}")))?,
        reason: row.get("reason")?,
        confidences,
        created_at: parse_datetime(&created_at, "created_at").map_err(invalid_column)?,
        reviewed: row.get("reviewed")?,
        reviewed_by: row.get("reviewed_by")?,
        reviewed_at: parse_optional_datetime(reviewed_at, "reviewed_at").map_err(invalid_column)?,
    })
}

fn insert_anomaly_row(conn: &Connection, record: &AnomalyRecord) -> Result<i64> {
    let confidences = serde_json::to_string(&record.confidences)?;
    conn.execute(
        "INSERT INTO anomalies (
            session_id,
            student_id,
            anomaly_type,
            reason,
            confidences_json,
            created_at,
            reviewed,
            reviewed_by,
            reviewed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.session_id,
            record.student_id,
            record.anomaly_type.as_str(),
            record.reason,
            confidences,
            fmt_datetime(&record.created_at),
            record.reviewed,
            record.reviewed_by,
            fmt_optional_datetime(record.reviewed_at.as_ref()),
        ],
    )
    .with_context(|| format!("failed to insert {} anomaly", record.anomaly_type.as_str()))?;
    Ok(conn.last_insert_rowid())
}

fn load_anomaly(conn: &Connection, id: i64) -> Result<Option<AnomalyRecord>> {
    conn.query_row(
        &format!("SELECT {ANOMALY_COLUMNS} FROM anomalies WHERE id = ?1"),
        params![id],
        row_to_anomaly,
    )
    .optional()
    .with_context(|| format!("failed to load anomaly {id}"))
}

impl Database {
    pub async fn insert_anomaly(&self, record: AnomalyRecord) -> Result<i64> {
        self.execute(move |conn| insert_anomaly_row(conn, &record))
            .await
    }

    /// Logs a proxy attempt and applies the lockout rule in one transaction.
    ///
    /// Attempts are counted over `window` ending at the record's timestamp,
    /// but never before the student's last unlock, so an unlock starts a
    /// clean slate. Reaching `threshold` locks the account and appends a
    /// `lockout_triggered` record.
    pub async fn record_proxy_attempt(
        &self,
        record: AnomalyRecord,
        window: Duration,
        threshold: u32,
    ) -> Result<ProxyTally> {
        self.execute(move |conn| {
            let student_id = record
                .student_id
                .clone()
                .ok_or_else(|| anyhow!("proxy attempt without a student id"))?;
            let tx = conn.transaction()?;

            let anomaly_id = insert_anomaly_row(&tx, &record)?;

            let lock = load_lock(&tx, &student_id)?;
            let mut since = record.created_at - window;
            if let Some(unlocked_at) = lock.as_ref().and_then(|l| l.unlocked_at) {
                since = since.max(unlocked_at);
            }

            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM anomalies
                 WHERE student_id = ?1 AND anomaly_type = ?2 AND created_at >= ?3",
                params![
                    student_id,
                    AnomalyType::ProxyAttempt.as_str(),
                    fmt_datetime(&since),
                ],
                |row| row.get(0),
            )?;
            let proxy_count = to_u32(count, "proxy count")?;

            let already_locked = lock.is_some_and(|l| l.locked);
            let lockout_triggered = !already_locked && proxy_count >= threshold;
            if lockout_triggered {
                let reason = format!("{proxy_count} proxy attempts within {}h", window.num_hours());
                lock_account(&tx, &student_id, &reason, record.created_at)?;
                let trigger = AnomalyRecord::new(
                    &record.session_id,
                    Some(&student_id),
                    AnomalyType::LockoutTriggered,
                    reason,
                    record.created_at,
                )
                .with_confidence("proxy_count", f64::from(proxy_count));
                insert_anomaly_row(&tx, &trigger)?;
            }

            tx.commit()?;
            Ok(ProxyTally {
                anomaly_id,
                proxy_count,
                lockout_triggered,
            })
        })
        .await
    }

    pub async fn count_session_anomalies(
        &self,
        session_id: &str,
        anomaly_type: AnomalyType,
    ) -> Result<u32> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM anomalies WHERE session_id = ?1 AND anomaly_type = ?2",
                params![session_id, anomaly_type.as_str()],
                |row| row.get(0),
            )?;
            to_u32(count, "anomaly count")
        })
        .await
    }

    /// Oldest first, so the review queue drains in arrival order.
    pub async fn unreviewed_anomalies(&self, limit: u32) -> Result<Vec<AnomalyRecord>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ANOMALY_COLUMNS} FROM anomalies
                 WHERE reviewed = 0
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit], row_to_anomaly)?;
            let records = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }

    pub async fn anomalies_for_student(&self, student_id: &str) -> Result<Vec<AnomalyRecord>> {
        let student_id = student_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ANOMALY_COLUMNS} FROM anomalies
                 WHERE student_id = ?1
                 ORDER BY created_at ASC, id ASC"
            ))?;
            let rows = stmt.query_map(params![student_id], row_to_anomaly)?;
            let records = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }

    pub async fn anomalies_for_session(&self, session_id: &str) -> Result<Vec<AnomalyRecord>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ANOMALY_COLUMNS} FROM anomalies
                 WHERE session_id = ?1
                 ORDER BY created_at ASC, id ASC"
            ))?;
            let rows = stmt.query_map(params![session_id], row_to_anomaly)?;
            let records = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }

    /// Flips `reviewed` once; reviewing an already reviewed record keeps the
    /// first reviewer. Returns `None` when the id is unknown.
    pub async fn mark_anomaly_reviewed(
        &self,
        id: i64,
        reviewer: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AnomalyRecord>> {
        let reviewer = reviewer.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE anomalies SET reviewed = 1, reviewed_by = ?1, reviewed_at = ?2
                 WHERE id = ?3 AND reviewed = 0",
                params![reviewer, fmt_datetime(&now), id],
            )
            .with_context(|| format!("failed to review anomaly {id}"))?;
            load_anomaly(conn, id)
        })
        .await
    }
}
