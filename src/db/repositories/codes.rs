use std::collections::HashSet;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use crate::{
    db::{
        connection::Database,
        helpers::{
            fmt_datetime, fmt_optional_datetime, invalid_column, parse_code_state, parse_datetime,
            parse_optional_datetime, to_i64, to_u32,
        },
        models::{CodeState, OneTimeCode},
    },
    otp::state::{evaluate_code, generate_code, ConsumeOutcome},
};

use super::{lockouts::account_locked, sessions::load_session};

/// Shape of codes issued for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodePolicy {
    pub length: usize,
    pub ttl_secs: u64,
    pub max_resends: u32,
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Active(OneTimeCode),
    /// The student had no code yet (enrolled after the session started).
    Issued(OneTimeCode),
    Expired(OneTimeCode),
    Consumed,
    NotEnrolled,
}

#[derive(Debug, Clone)]
pub enum ResendOutcome {
    Reissued(OneTimeCode),
    LimitExceeded,
    AlreadyConsumed,
    NotEnrolled,
}

fn row_to_code(row: &Row) -> Result<OneTimeCode, rusqlite::Error> {
    let issued_at: String = row.get("issued_at")?;
    let expires_at: String = row.get("expires_at")?;
    let state: String = row.get("state")?;
    let consumed_at: Option<String> = row.get("consumed_at")?;
    let resend_count: i64 = row.get("resend_count")?;
    let max_resends: i64 = row.get("max_resends")?;

    Ok(OneTimeCode {
        session_id: row.get("session_id")?,
        student_id: row.get("student_id")?,
        code: row.get("code")?,
        issued_at: parse_datetime(&issued_at, "issued_at").map_err(invalid_column)?,
        expires_at: parse_datetime(&expires_at, "expires_at").map_err(invalid_column)?,
        resend_count: to_u32(resend_count, "resend_count").map_err(invalid_column)?,
        max_resends: to_u32(max_resends, "max_resends").map_err(invalid_column)?,
        state: parse_code_state(&state).map_err(invalid_column)?,
        consumed_at: parse_optional_datetime(consumed_at, "consumed_at").map_err(invalid_column)?,
    })
}

pub(super) fn insert_code(tx: &Transaction<'_>, code: &OneTimeCode) -> Result<()> {
    tx.execute(
        "INSERT INTO one_time_codes (
            session_id,
            student_id,
            code,
            issued_at,
            expires_at,
            resend_count,
            max_resends,
            state,
            consumed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            code.session_id,
            code.student_id,
            code.code,
            fmt_datetime(&code.issued_at),
            fmt_datetime(&code.expires_at),
            code.resend_count,
            code.max_resends,
            code.state.as_str(),
            fmt_optional_datetime(code.consumed_at.as_ref()),
        ],
    )
    .with_context(|| {
        format!(
            "failed to insert code for {} in session {}",
            code.student_id, code.session_id
        )
    })?;
    Ok(())
}

pub(super) fn load_code(
    conn: &Connection,
    session_id: &str,
    student_id: &str,
) -> Result<Option<OneTimeCode>> {
    conn.query_row(
        "SELECT session_id, student_id, code, issued_at, expires_at, resend_count,
                max_resends, state, consumed_at
         FROM one_time_codes
         WHERE session_id = ?1 AND student_id = ?2",
        params![session_id, student_id],
        row_to_code,
    )
    .optional()
    .with_context(|| format!("failed to load code for {student_id} in {session_id}"))
}

fn session_code_values(conn: &Connection, session_id: &str) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT code FROM one_time_codes WHERE session_id = ?1")?;
    let rows = stmt.query_map(params![session_id], |row| row.get::<_, String>(0))?;
    let values = rows.collect::<Result<HashSet<_>, _>>()?;
    Ok(values)
}

fn is_enrolled_in_session_class(
    conn: &Connection,
    session_id: &str,
    student_id: &str,
) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM enrollments e
             JOIN sessions s ON s.class_id = e.class_id
             WHERE s.id = ?1 AND e.student_id = ?2",
            params![session_id, student_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn fresh_code(
    conn: &Connection,
    session_id: &str,
    student_id: &str,
    policy: CodePolicy,
    now: DateTime<Utc>,
) -> Result<OneTimeCode> {
    let taken = session_code_values(conn, session_id)?;
    let value = generate_code(&mut rand::thread_rng(), policy.length, &taken)
        .ok_or_else(|| anyhow!("code space exhausted for session {session_id}"))?;

    Ok(OneTimeCode {
        session_id: session_id.to_string(),
        student_id: student_id.to_string(),
        code: value,
        issued_at: now,
        expires_at: now + Duration::seconds(to_i64(policy.ttl_secs)?),
        resend_count: 0,
        max_resends: policy.max_resends,
        state: CodeState::Issued,
        consumed_at: None,
    })
}

/// Runs every gate `consume_code` applies, in order, without mutating.
///
/// A consumed code is reported as such before any lock or expiry gate, so a
/// replay reads the same after the session is archived or locked.
pub(super) fn evaluate_consume(
    conn: &Connection,
    session_id: &str,
    student_id: &str,
    submitted: &str,
    now: DateTime<Utc>,
) -> Result<ConsumeOutcome> {
    let Some(session) = load_session(conn, session_id)? else {
        return Ok(ConsumeOutcome::SessionNotFound);
    };
    let code = load_code(conn, session_id, student_id)?;
    if matches!(&code, Some(code) if code.state == CodeState::Consumed) {
        return Ok(ConsumeOutcome::AlreadyConsumed);
    }
    if account_locked(conn, student_id)? {
        return Ok(ConsumeOutcome::AccountLocked);
    }
    if session.is_locked() {
        return Ok(ConsumeOutcome::SessionLocked);
    }
    if session.archived_at.is_some() || session.is_expired_at(now) {
        return Ok(ConsumeOutcome::SessionExpired);
    }
    let Some(code) = code else {
        return Ok(ConsumeOutcome::NoCode);
    };
    Ok(evaluate_code(&code, submitted, now))
}

/// Conditional `Issued -> Consumed` transition keyed on the code value.
pub(super) fn mark_consumed(
    conn: &Connection,
    session_id: &str,
    student_id: &str,
    submitted: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE one_time_codes
         SET state = ?1, consumed_at = ?2
         WHERE session_id = ?3 AND student_id = ?4 AND code = ?5 AND state = ?6",
        params![
            CodeState::Consumed.as_str(),
            fmt_datetime(&now),
            session_id,
            student_id,
            submitted.trim(),
            CodeState::Issued.as_str(),
        ],
    )?;
    Ok(changed == 1)
}

impl Database {
    /// Returns the student's current code, issuing one first if the student
    /// is enrolled in the session's class but has none.
    pub async fn fetch_or_issue_code(
        &self,
        session_id: &str,
        student_id: &str,
        policy: CodePolicy,
        now: DateTime<Utc>,
    ) -> Result<FetchOutcome> {
        let session_id = session_id.to_string();
        let student_id = student_id.to_string();
        self.execute(move |conn| {
            if let Some(code) = load_code(conn, &session_id, &student_id)? {
                return Ok(match code.effective_state(now) {
                    CodeState::Issued => FetchOutcome::Active(code),
                    CodeState::Expired => FetchOutcome::Expired(code),
                    CodeState::Consumed => FetchOutcome::Consumed,
                });
            }

            if !is_enrolled_in_session_class(conn, &session_id, &student_id)? {
                return Ok(FetchOutcome::NotEnrolled);
            }

            let tx = conn.transaction()?;
            let code = fresh_code(&tx, &session_id, &student_id, policy, now)?;
            insert_code(&tx, &code)?;
            tx.commit()?;
            Ok(FetchOutcome::Issued(code))
        })
        .await
    }

    /// Replaces the student's code with a new value and a fresh TTL.
    ///
    /// The resend budget is the one stored on the code row; a student with
    /// no code yet gets a first code without spending it.
    pub async fn resend_code(
        &self,
        session_id: &str,
        student_id: &str,
        policy: CodePolicy,
        now: DateTime<Utc>,
    ) -> Result<ResendOutcome> {
        let session_id = session_id.to_string();
        let student_id = student_id.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;

            let outcome = match load_code(&tx, &session_id, &student_id)? {
                None => {
                    if !is_enrolled_in_session_class(&tx, &session_id, &student_id)? {
                        return Ok(ResendOutcome::NotEnrolled);
                    }
                    let code = fresh_code(&tx, &session_id, &student_id, policy, now)?;
                    insert_code(&tx, &code)?;
                    ResendOutcome::Reissued(code)
                }
                Some(current) if current.state == CodeState::Consumed => {
                    return Ok(ResendOutcome::AlreadyConsumed);
                }
                Some(current) if current.resend_count >= current.max_resends => {
                    return Ok(ResendOutcome::LimitExceeded);
                }
                Some(current) => {
                    let mut next = fresh_code(&tx, &session_id, &student_id, policy, now)?;
                    next.resend_count = current.resend_count + 1;
                    next.max_resends = current.max_resends;

                    tx.execute(
                        "UPDATE one_time_codes
                         SET code = ?1, issued_at = ?2, expires_at = ?3, resend_count = ?4,
                             state = ?5, consumed_at = NULL
                         WHERE session_id = ?6 AND student_id = ?7",
                        params![
                            next.code,
                            fmt_datetime(&next.issued_at),
                            fmt_datetime(&next.expires_at),
                            next.resend_count,
                            CodeState::Issued.as_str(),
                            session_id,
                            student_id,
                        ],
                    )
                    .with_context(|| format!("failed to resend code for {student_id}"))?;
                    ResendOutcome::Reissued(next)
                }
            };

            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    /// Checks every gate and, when the code matches, marks it consumed in the
    /// same DB task. Concurrent callers therefore see exactly one `Accepted`.
    pub async fn consume_code(
        &self,
        session_id: &str,
        student_id: &str,
        submitted: &str,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome> {
        let session_id = session_id.to_string();
        let student_id = student_id.to_string();
        let submitted = submitted.to_string();
        self.execute(move |conn| {
            let outcome = evaluate_consume(conn, &session_id, &student_id, &submitted, now)?;
            if outcome != ConsumeOutcome::Accepted {
                return Ok(outcome);
            }
            if mark_consumed(conn, &session_id, &student_id, &submitted, now)? {
                Ok(ConsumeOutcome::Accepted)
            } else {
                Ok(ConsumeOutcome::AlreadyConsumed)
            }
        })
        .await
    }

    /// Same gates as [`Database::consume_code`], read-only.
    pub async fn peek_code(
        &self,
        session_id: &str,
        student_id: &str,
        submitted: &str,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome> {
        let session_id = session_id.to_string();
        let student_id = student_id.to_string();
        let submitted = submitted.to_string();
        self.execute(move |conn| evaluate_consume(conn, &session_id, &student_id, &submitted, now))
            .await
    }
}
