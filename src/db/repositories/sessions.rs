use std::collections::HashSet;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use crate::{
    db::{
        connection::Database,
        helpers::{
            fmt_datetime, fmt_optional_datetime, invalid_column, parse_datetime, parse_lock_state,
            parse_optional_datetime, to_i64, to_u32, to_u64,
        },
        models::{CodeState, Geofence, LockState, OneTimeCode, Session},
    },
    otp::state::generate_code,
};

use super::codes::{insert_code, CodePolicy};

const SESSION_COLUMNS: &str = "id, class_id, created_at, expires_at, geofence_lat, geofence_lon,
    geofence_radius_m, beacon_uuid, pressure_baseline_hpa, require_ble, require_motion,
    require_barometer, otp_ttl_secs, max_resends, lock_state, lock_reason, archived_at";

pub(super) fn row_to_session(row: &Row) -> Result<Session, rusqlite::Error> {
    let created_at: String = row.get("created_at")?;
    let expires_at: String = row.get("expires_at")?;
    let lock_state: String = row.get("lock_state")?;
    let archived_at: Option<String> = row.get("archived_at")?;
    let otp_ttl_secs: i64 = row.get("otp_ttl_secs")?;
    let max_resends: i64 = row.get("max_resends")?;

    let lat: Option<f64> = row.get("geofence_lat")?;
    let lon: Option<f64> = row.get("geofence_lon")?;
    let radius: Option<f64> = row.get("geofence_radius_m")?;
    let geofence = match (lat, lon, radius) {
        (Some(latitude), Some(longitude), Some(radius_m)) => Some(Geofence {
            latitude,
            longitude,
            radius_m,
        }),
        _ => None,
    };

    Ok(Session {
        id: row.get("id")?,
        class_id: row.get("class_id")?,
        created_at: parse_datetime(&created_at, "created_at").map_err(invalid_column)?,
        expires_at: parse_datetime(&expires_at, "expires_at").map_err(invalid_column)?,
        geofence,
        beacon_uuid: row.get("beacon_uuid")?,
        pressure_baseline_hpa: row.get("pressure_baseline_hpa")?,
        require_ble: row.get("require_ble")?,
        require_motion: row.get("require_motion")?,
        require_barometer: row.get("require_barometer")?,
        otp_ttl_secs: to_u64(otp_ttl_secs, "otp_ttl_secs").map_err(invalid_column)?,
        max_resends: to_u32(max_resends, "max_resends").map_err(invalid_column)?,
        lock_state: parse_lock_state(&lock_state).map_err(invalid_column)?,
        lock_reason: row.get("lock_reason")?,
        archived_at: parse_optional_datetime(archived_at, "archived_at").map_err(invalid_column)?,
    })
}

pub(super) fn load_session(conn: &Connection, session_id: &str) -> Result<Option<Session>> {
    conn.query_row(
        &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
        params![session_id],
        row_to_session,
    )
    .optional()
    .with_context(|| format!("failed to load session {session_id}"))
}

fn insert_session(tx: &Transaction<'_>, session: &Session) -> Result<()> {
    let geofence = session.geofence.as_ref();
    tx.execute(
        "INSERT INTO sessions (
            id,
            class_id,
            created_at,
            expires_at,
            geofence_lat,
            geofence_lon,
            geofence_radius_m,
            beacon_uuid,
            pressure_baseline_hpa,
            require_ble,
            require_motion,
            require_barometer,
            otp_ttl_secs,
            max_resends,
            lock_state,
            lock_reason,
            archived_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            session.id,
            session.class_id,
            fmt_datetime(&session.created_at),
            fmt_datetime(&session.expires_at),
            geofence.map(|g| g.latitude),
            geofence.map(|g| g.longitude),
            geofence.map(|g| g.radius_m),
            session.beacon_uuid,
            session.pressure_baseline_hpa,
            session.require_ble,
            session.require_motion,
            session.require_barometer,
            to_i64(session.otp_ttl_secs)?,
            session.max_resends,
            session.lock_state.as_str(),
            session.lock_reason,
            fmt_optional_datetime(session.archived_at.as_ref()),
        ],
    )
    .with_context(|| format!("failed to insert session {}", session.id))?;
    Ok(())
}

impl Database {
    /// Inserts `session` and one fresh code per student currently enrolled in
    /// its class, all in one transaction.
    ///
    /// Returns `None` without writing anything when the class has no
    /// enrolled students.
    pub async fn create_session(
        &self,
        session: Session,
        policy: CodePolicy,
    ) -> Result<Option<Vec<OneTimeCode>>> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;

            let students = {
                let mut stmt = tx.prepare(
                    "SELECT student_id FROM enrollments WHERE class_id = ?1 ORDER BY student_id",
                )?;
                let rows = stmt.query_map(params![session.class_id], |row| row.get::<_, String>(0))?;
                rows.collect::<Result<Vec<_>, _>>()?
            };

            if students.is_empty() {
                return Ok(None);
            }

            insert_session(&tx, &session)?;

            let mut rng = rand::thread_rng();
            let mut taken = HashSet::with_capacity(students.len());
            let mut codes = Vec::with_capacity(students.len());
            let expires_at = session.created_at + Duration::seconds(to_i64(policy.ttl_secs)?);

            for student_id in students {
                let value = generate_code(&mut rng, policy.length, &taken)
                    .ok_or_else(|| anyhow!("code space exhausted for session {}", session.id))?;
                taken.insert(value.clone());

                let code = OneTimeCode {
                    session_id: session.id.clone(),
                    student_id,
                    code: value,
                    issued_at: session.created_at,
                    expires_at,
                    resend_count: 0,
                    max_resends: policy.max_resends,
                    state: CodeState::Issued,
                    consumed_at: None,
                };
                insert_code(&tx, &code)?;
                codes.push(code);
            }

            tx.commit()?;
            Ok(Some(codes))
        })
        .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| load_session(conn, &session_id)).await
    }

    /// Returns `false` when no session has that id.
    pub async fn set_session_lock(
        &self,
        session_id: &str,
        state: LockState,
        reason: Option<String>,
    ) -> Result<bool> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE sessions SET lock_state = ?1, lock_reason = ?2 WHERE id = ?3",
                    params![state.as_str(), reason, session_id],
                )
                .with_context(|| format!("failed to update lock state of {session_id}"))?;
            Ok(changed > 0)
        })
        .await
    }

    /// Materializes expired codes, then archives every session that can no
    /// longer accept a verification: no live code remains and either the
    /// window has closed or every enrolled student has consumed a code.
    /// A student enrolled after the start without a code yet keeps an open
    /// window alive.
    ///
    /// Returns the ids archived by this call.
    pub async fn archive_finished_sessions(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.execute(move |conn| {
            let now = fmt_datetime(&now);
            let tx = conn.transaction()?;

            tx.execute(
                "UPDATE one_time_codes SET state = ?1 WHERE state = ?2 AND expires_at <= ?3",
                params![CodeState::Expired.as_str(), CodeState::Issued.as_str(), now],
            )?;

            let ids = {
                let mut stmt = tx.prepare(
                    "SELECT s.id FROM sessions s
                     WHERE s.archived_at IS NULL
                       AND NOT EXISTS (
                           SELECT 1 FROM one_time_codes c
                           WHERE c.session_id = s.id AND c.state = ?1
                       )
                       AND (
                           s.expires_at <= ?2
                           OR (
                               NOT EXISTS (
                                   SELECT 1 FROM one_time_codes c
                                   WHERE c.session_id = s.id AND c.state <> ?3
                               )
                               AND NOT EXISTS (
                                   SELECT 1 FROM enrollments e
                                   WHERE e.class_id = s.class_id
                                     AND NOT EXISTS (
                                         SELECT 1 FROM one_time_codes c
                                         WHERE c.session_id = s.id
                                           AND c.student_id = e.student_id
                                     )
                               )
                           )
                       )",
                )?;
                let rows = stmt.query_map(
                    params![CodeState::Issued.as_str(), now, CodeState::Consumed.as_str()],
                    |row| row.get::<_, String>(0),
                )?;
                rows.collect::<Result<Vec<_>, _>>()?
            };

            for id in &ids {
                tx.execute(
                    "UPDATE sessions SET archived_at = ?1 WHERE id = ?2",
                    params![now, id],
                )?;
            }

            tx.commit()?;
            Ok(ids)
        })
        .await
    }
}
