use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    db::{
        models::{LockState, OneTimeCode, Session, SessionOptions},
        CodePolicy, Database, FetchOutcome, ResendOutcome,
    },
    error::{VerifyError, VerifyResult},
    settings::OtpSettings,
    utils::{mask_code, Clock},
};

use super::state::ConsumeOutcome;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Code handed to a student together with its time to expiry.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedCode {
    pub code: String,
    pub remaining_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResentCode {
    pub code: String,
    pub attempts_remaining: u32,
}

/// Owns the session and one-time-code lifecycle.
#[derive(Clone)]
pub struct SessionManager {
    db: Database,
    otp: OtpSettings,
    clock: Arc<dyn Clock>,
}

impl SessionManager {
    pub fn new(db: Database, otp: OtpSettings, clock: Arc<dyn Clock>) -> Self {
        Self { db, otp, clock }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn policy_for(&self, session: &Session) -> CodePolicy {
        CodePolicy {
            length: self.otp.code_length,
            ttl_secs: session.otp_ttl_secs,
            max_resends: session.max_resends,
        }
    }

    pub async fn enroll_student(&self, class_id: &str, student_id: &str) -> VerifyResult<bool> {
        self.db
            .enroll_student(class_id, student_id, self.clock.now())
            .await
            .map_err(VerifyError::storage)
    }

    /// Opens a session for `class_id` and issues one code per enrolled student.
    pub async fn start_session(
        &self,
        class_id: &str,
        options: SessionOptions,
    ) -> VerifyResult<(Session, Vec<OneTimeCode>)> {
        let now = self.clock.now();
        let ttl_secs = options
            .otp_ttl_secs
            .filter(|secs| *secs > 0)
            .unwrap_or(self.otp.ttl_secs);
        let window_secs = options
            .window_secs
            .filter(|secs| *secs > 0)
            .unwrap_or(self.otp.session_window_secs)
            .max(1);

        let session = Session {
            id: Uuid::new_v4().to_string(),
            class_id: class_id.to_string(),
            created_at: now,
            expires_at: now + Duration::seconds(window_secs as i64),
            geofence: options.geofence,
            beacon_uuid: options.beacon_uuid,
            pressure_baseline_hpa: options.pressure_baseline_hpa,
            require_ble: options.require_ble,
            require_motion: options.require_motion,
            require_barometer: options.require_barometer,
            otp_ttl_secs: ttl_secs,
            max_resends: self.otp.max_resends,
            lock_state: LockState::Open,
            lock_reason: None,
            archived_at: None,
        };

        let policy = self.policy_for(&session);
        let codes = self
            .db
            .create_session(session.clone(), policy)
            .await
            .map_err(VerifyError::storage)?
            .ok_or_else(|| VerifyError::ClassNotFound(class_id.to_string()))?;

        log_info!(
            "session {} started for class {} with {} codes",
            session.id,
            class_id,
            codes.len()
        );
        Ok((session, codes))
    }

    /// Loads a session, failing unless it exists.
    pub async fn session(&self, session_id: &str) -> VerifyResult<Session> {
        self.db
            .get_session(session_id)
            .await
            .map_err(VerifyError::storage)?
            .ok_or_else(|| VerifyError::SessionNotFound(session_id.to_string()))
    }

    /// Loads a session that can still accept codes.
    async fn open_session(&self, session_id: &str) -> VerifyResult<Session> {
        let session = self.session(session_id).await?;
        if session.is_locked() {
            return Err(VerifyError::SessionLocked);
        }
        if session.archived_at.is_some() || session.is_expired_at(self.clock.now()) {
            return Err(VerifyError::SessionExpired);
        }
        Ok(session)
    }

    /// Returns the student's active code, issuing one if the student was
    /// enrolled after the session started. An expired code is only replaced
    /// through [`SessionManager::resend_code`].
    pub async fn issue_or_fetch_code(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> VerifyResult<IssuedCode> {
        let session = self.open_session(session_id).await?;
        let now = self.clock.now();

        let outcome = self
            .db
            .fetch_or_issue_code(session_id, student_id, self.policy_for(&session), now)
            .await
            .map_err(VerifyError::storage)?;

        match outcome {
            FetchOutcome::Active(code) => Ok(IssuedCode {
                remaining_seconds: code.remaining_secs(now),
                code: code.code,
            }),
            FetchOutcome::Issued(code) => {
                log_info!(
                    "late code {} issued to {} in session {}",
                    mask_code(&code.code),
                    student_id,
                    session_id
                );
                Ok(IssuedCode {
                    remaining_seconds: code.remaining_secs(now),
                    code: code.code,
                })
            }
            FetchOutcome::Expired(_) => Err(VerifyError::CodeExpired),
            FetchOutcome::Consumed => Err(VerifyError::CodeAlreadyConsumed),
            FetchOutcome::NotEnrolled => Err(VerifyError::StudentNotEnrolled(student_id.to_string())),
        }
    }

    /// Replaces the student's code with a new value and a fresh TTL.
    pub async fn resend_code(&self, session_id: &str, student_id: &str) -> VerifyResult<ResentCode> {
        let session = self.open_session(session_id).await?;

        let outcome = self
            .db
            .resend_code(
                session_id,
                student_id,
                self.policy_for(&session),
                self.clock.now(),
            )
            .await
            .map_err(VerifyError::storage)?;

        match outcome {
            ResendOutcome::Reissued(code) => {
                log_info!(
                    "code {} resent to {} in session {} ({} resends used)",
                    mask_code(&code.code),
                    student_id,
                    session_id,
                    code.resend_count
                );
                Ok(ResentCode {
                    attempts_remaining: code.resends_remaining(),
                    code: code.code,
                })
            }
            ResendOutcome::LimitExceeded => {
                log_warn!("resend limit reached for {} in session {}", student_id, session_id);
                Err(VerifyError::ResendLimitExceeded)
            }
            ResendOutcome::AlreadyConsumed => Err(VerifyError::CodeAlreadyConsumed),
            ResendOutcome::NotEnrolled => Err(VerifyError::StudentNotEnrolled(student_id.to_string())),
        }
    }

    /// Atomically checks and consumes a submitted code.
    ///
    /// `Ok(false)` means the value did not match; every other refusal is a
    /// typed error.
    pub async fn consume_code(
        &self,
        session_id: &str,
        student_id: &str,
        submitted: &str,
    ) -> VerifyResult<bool> {
        let outcome = self
            .db
            .consume_code(session_id, student_id, submitted, self.clock.now())
            .await
            .map_err(VerifyError::storage)?;

        if outcome == ConsumeOutcome::Accepted {
            log_info!("code consumed by {} in session {}", student_id, session_id);
        }
        outcome.into_result(session_id, student_id)
    }

    /// Read-only version of [`SessionManager::consume_code`].
    pub async fn peek_code(
        &self,
        session_id: &str,
        student_id: &str,
        submitted: &str,
    ) -> VerifyResult<ConsumeOutcome> {
        self.db
            .peek_code(session_id, student_id, submitted, self.clock.now())
            .await
            .map_err(VerifyError::storage)
    }

    pub async fn lock_session(&self, session_id: &str, reason: &str) -> VerifyResult<()> {
        let found = self
            .db
            .set_session_lock(session_id, LockState::Locked, Some(reason.to_string()))
            .await
            .map_err(VerifyError::storage)?;
        if !found {
            return Err(VerifyError::SessionNotFound(session_id.to_string()));
        }
        log_warn!("session {} locked: {}", session_id, reason);
        Ok(())
    }

    pub async fn unlock_session(&self, session_id: &str) -> VerifyResult<()> {
        let found = self
            .db
            .set_session_lock(session_id, LockState::Open, None)
            .await
            .map_err(VerifyError::storage)?;
        if !found {
            return Err(VerifyError::SessionNotFound(session_id.to_string()));
        }
        log_info!("session {} unlocked", session_id);
        Ok(())
    }

    /// Archives sessions that can no longer accept verifications.
    pub async fn archive_expired_sessions(&self) -> VerifyResult<Vec<String>> {
        let archived = self
            .db
            .archive_finished_sessions(self.clock.now())
            .await
            .map_err(VerifyError::storage)?;
        if !archived.is_empty() {
            log_info!("archived {} session(s)", archived.len());
        }
        Ok(archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;
    use chrono::Utc;
    use std::collections::HashSet;

    async fn manager_with_class(students: &[&str]) -> (tempfile::TempDir, SessionManager, Arc<ManualClock>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("rollcall.sqlite3")).unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = SessionManager::new(db, OtpSettings::default(), clock.clone());
        for student in students {
            manager.enroll_student("cs101", student).await.unwrap();
        }
        (dir, manager, clock)
    }

    #[tokio::test]
    async fn start_session_issues_one_distinct_code_per_student() {
        let students = ["ana", "ben", "cleo", "dev", "eli"];
        let (_dir, manager, _clock) = manager_with_class(&students).await;

        let (session, codes) = manager
            .start_session("cs101", SessionOptions::default())
            .await
            .unwrap();

        assert_eq!(codes.len(), students.len());
        let values: HashSet<_> = codes.iter().map(|c| c.code.clone()).collect();
        assert_eq!(values.len(), students.len());
        assert!(codes
            .iter()
            .all(|c| c.code.len() == 6 && c.code.chars().all(|ch| ch.is_ascii_digit())));
        assert!(session.expires_at > session.created_at);
    }

    #[tokio::test]
    async fn start_session_without_enrollment_is_class_not_found() {
        let (_dir, manager, _clock) = manager_with_class(&[]).await;
        let err = manager
            .start_session("cs101", SessionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::ClassNotFound(_)));
    }

    #[tokio::test]
    async fn late_enrollee_gets_a_code_on_first_fetch() {
        let (_dir, manager, _clock) = manager_with_class(&["ana"]).await;
        let (session, codes) = manager
            .start_session("cs101", SessionOptions::default())
            .await
            .unwrap();

        manager.enroll_student("cs101", "zed").await.unwrap();
        let issued = manager.issue_or_fetch_code(&session.id, "zed").await.unwrap();
        assert_ne!(issued.code, codes[0].code);
        assert_eq!(issued.remaining_seconds, 60);

        let again = manager.issue_or_fetch_code(&session.id, "zed").await.unwrap();
        assert_eq!(again.code, issued.code);
    }

    #[tokio::test]
    async fn fetch_after_ttl_reports_expired_until_resend() {
        let (_dir, manager, clock) = manager_with_class(&["ana"]).await;
        let (session, _) = manager
            .start_session("cs101", SessionOptions::default())
            .await
            .unwrap();

        clock.advance(Duration::seconds(61));
        let err = manager.issue_or_fetch_code(&session.id, "ana").await.unwrap_err();
        assert!(matches!(err, VerifyError::CodeExpired));

        let resent = manager.resend_code(&session.id, "ana").await.unwrap();
        assert_eq!(resent.attempts_remaining, 1);
        let fetched = manager.issue_or_fetch_code(&session.id, "ana").await.unwrap();
        assert_eq!(fetched.code, resent.code);
        assert_eq!(fetched.remaining_seconds, 60);
    }

    #[tokio::test]
    async fn unknown_student_is_not_enrolled() {
        let (_dir, manager, _clock) = manager_with_class(&["ana"]).await;
        let (session, _) = manager
            .start_session("cs101", SessionOptions::default())
            .await
            .unwrap();
        let err = manager
            .issue_or_fetch_code(&session.id, "mallory")
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::StudentNotEnrolled(_)));
    }

    #[tokio::test]
    async fn locked_session_refuses_codes_until_unlocked() {
        let (_dir, manager, _clock) = manager_with_class(&["ana"]).await;
        let (session, codes) = manager
            .start_session("cs101", SessionOptions::default())
            .await
            .unwrap();

        manager.lock_session(&session.id, "instructor request").await.unwrap();
        let err = manager
            .consume_code(&session.id, "ana", &codes[0].code)
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::SessionLocked));

        manager.unlock_session(&session.id).await.unwrap();
        assert!(manager
            .consume_code(&session.id, "ana", &codes[0].code)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn session_window_closes_verification() {
        let (_dir, manager, clock) = manager_with_class(&["ana"]).await;
        let options = SessionOptions {
            window_secs: Some(30),
            ..SessionOptions::default()
        };
        let (session, codes) = manager.start_session("cs101", options).await.unwrap();

        clock.advance(Duration::seconds(30));
        let err = manager
            .consume_code(&session.id, "ana", &codes[0].code)
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::SessionExpired));
    }

    #[tokio::test]
    async fn archival_waits_for_every_code_to_be_terminal() {
        let (_dir, manager, clock) = manager_with_class(&["ana", "ben"]).await;
        let (session, codes) = manager
            .start_session("cs101", SessionOptions::default())
            .await
            .unwrap();

        let ana = codes.iter().find(|c| c.student_id == "ana").unwrap();
        let ben = codes.iter().find(|c| c.student_id == "ben").unwrap();
        assert!(manager.consume_code(&session.id, "ana", &ana.code).await.unwrap());
        assert!(manager.archive_expired_sessions().await.unwrap().is_empty());

        assert!(manager.consume_code(&session.id, "ben", &ben.code).await.unwrap());
        assert_eq!(
            manager.archive_expired_sessions().await.unwrap(),
            vec![session.id.clone()]
        );
        assert!(manager.session(&session.id).await.unwrap().archived_at.is_some());

        clock.advance(Duration::hours(1));
        assert!(manager.archive_expired_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn consumed_code_replay_reads_the_same_after_archive_or_lock() {
        let (_dir, manager, _clock) = manager_with_class(&["ana"]).await;
        let (session, codes) = manager
            .start_session("cs101", SessionOptions::default())
            .await
            .unwrap();
        assert!(manager.consume_code(&session.id, "ana", &codes[0].code).await.unwrap());

        assert_eq!(
            manager.archive_expired_sessions().await.unwrap(),
            vec![session.id.clone()]
        );
        let err = manager
            .consume_code(&session.id, "ana", &codes[0].code)
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::CodeAlreadyConsumed));

        manager.lock_session(&session.id, "instructor request").await.unwrap();
        let err = manager
            .consume_code(&session.id, "ana", &codes[0].code)
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::CodeAlreadyConsumed));
        assert_eq!(
            manager.peek_code(&session.id, "ana", &codes[0].code).await.unwrap(),
            ConsumeOutcome::AlreadyConsumed
        );
    }

    #[tokio::test]
    async fn late_enrollee_without_a_code_keeps_an_open_session_alive() {
        let (_dir, manager, _clock) = manager_with_class(&["ana"]).await;
        let (session, codes) = manager
            .start_session("cs101", SessionOptions::default())
            .await
            .unwrap();
        assert!(manager.consume_code(&session.id, "ana", &codes[0].code).await.unwrap());

        manager.enroll_student("cs101", "zed").await.unwrap();
        assert!(manager.archive_expired_sessions().await.unwrap().is_empty());

        let issued = manager.issue_or_fetch_code(&session.id, "zed").await.unwrap();
        assert!(manager.consume_code(&session.id, "zed", &issued.code).await.unwrap());
        assert_eq!(
            manager.archive_expired_sessions().await.unwrap(),
            vec![session.id.clone()]
        );
    }
}
