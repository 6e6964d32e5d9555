use std::sync::Arc;

use crate::{
    anomaly::{AnomalyTracker, Attempt},
    db::{models::AnomalyType, CommitOutcome},
    error::{VerifyError, VerifyResult},
    evidence::EvidenceBundle,
    fusion::{decide, FusionPolicy, VerificationResult},
    otp::{ConsumeOutcome, SessionManager},
    scoring::{score_face, score_sensors, Factor, FaceMatcher, FactorScore},
    settings::Settings,
    utils::Clock,
    validation::{validate, IssueKind, ValidationIssue},
};

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// Runs one verification request end to end:
/// validate, gate on the code, score, fuse, commit, then bookkeeping.
#[derive(Clone)]
pub struct VerificationController {
    sessions: SessionManager,
    tracker: AnomalyTracker,
    face: Arc<dyn FaceMatcher>,
    settings: Arc<Settings>,
    clock: Arc<dyn Clock>,
}

impl VerificationController {
    pub fn new(
        sessions: SessionManager,
        tracker: AnomalyTracker,
        face: Arc<dyn FaceMatcher>,
        settings: Settings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sessions,
            tracker,
            face,
            settings: Arc::new(settings),
            clock,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn tracker(&self) -> &AnomalyTracker {
        &self.tracker
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// A fusion rejection is a normal `success: false` result; errors are
    /// reserved for requests that could not be evaluated at all.
    pub async fn verify(&self, bundle: EvidenceBundle) -> VerifyResult<VerificationResult> {
        validate(&bundle, &self.settings.validation).into_result()?;

        let session_id = bundle.session_id.trim().to_string();
        let student_id = bundle.student_id.trim().to_string();
        let session = self.sessions.session(&session_id).await?;

        let gate = self
            .sessions
            .peek_code(&session_id, &student_id, &bundle.code)
            .await?;
        if let Some(err) = gate.refusal(&session_id, &student_id) {
            return Err(err);
        }
        let code_score = if gate == ConsumeOutcome::Accepted {
            FactorScore::measured(true, 1.0)
        } else {
            FactorScore::measured(false, 0.0).with_detail("code does not match")
        };

        let frame = bundle.decode_face_frame().map_err(|err| {
            VerifyError::InvalidEvidence(vec![ValidationIssue {
                field: "face_image".into(),
                kind: IssueKind::Malformed,
                message: err.to_string(),
            }])
        })?;

        let verification = &self.settings.verification;
        let scoring = async {
            let face = score_face(
                self.face.as_ref(),
                &student_id,
                &frame,
                &self.settings.scoring,
                verification.face_retries,
                verification.retry_backoff(),
            );
            let sensors = async { score_sensors(&bundle, &session, &self.settings.scoring) };
            let (face, sensors) = tokio::join!(face, sensors);
            face.map(|face| (face, sensors))
        };

        let (face_score, mut card) = match tokio::time::timeout(verification.timeout(), scoring).await {
            Ok(scored) => scored?,
            Err(_) => {
                log_warn!(
                    "scoring for {} in session {} exceeded {} ms",
                    student_id,
                    session_id,
                    verification.timeout_ms
                );
                return Err(VerifyError::VerificationTimeout);
            }
        };
        card.insert(Factor::Otp, code_score);
        card.insert(Factor::Face, face_score);

        let policy = FusionPolicy::for_session(&session, &self.settings.fusion);
        let mut result = decide(&card, &policy, self.clock.now());

        if result.success {
            let record = self.commit(&session_id, &student_id, &bundle.code, &result).await?;
            result.attendance_id = Some(record);
        }

        log_info!(
            "verification for {} in session {}: {}",
            student_id,
            session_id,
            result.message
        );

        self.bookkeeping(Attempt {
            session_id: &session_id,
            student_id: &student_id,
            result: &result,
            location: bundle.gps,
        })
        .await;

        Ok(result)
    }

    async fn commit(
        &self,
        session_id: &str,
        student_id: &str,
        code: &str,
        result: &VerificationResult,
    ) -> VerifyResult<i64> {
        let factors_json = serde_json::to_string(&result.factors)
            .map_err(|err| VerifyError::storage(err.into()))?;
        let face_confidence = result.metric(Factor::Face);

        let outcome = self
            .sessions
            .db()
            .commit_attendance(
                session_id,
                student_id,
                code,
                face_confidence,
                factors_json,
                self.clock.now(),
            )
            .await
            .map_err(VerifyError::storage)?;

        match outcome {
            CommitOutcome::Recorded(record) => Ok(record.id),
            // `None` here means the code was replaced by a resend after the
            // pre-check.
            CommitOutcome::Rejected(refused) => Err(refused
                .refusal(session_id, student_id)
                .unwrap_or(VerifyError::CodeExpired)),
        }
    }

    /// Anomaly logging and session lockout. Failures here never change the
    /// verdict already reached.
    async fn bookkeeping(&self, attempt: Attempt<'_>) {
        let recorded = match self.tracker.record_attempt(attempt).await {
            Ok(recorded) => recorded,
            Err(err) => {
                log_error!(
                    "anomaly bookkeeping failed for {} in session {}: {err}",
                    attempt.student_id,
                    attempt.session_id
                );
                return;
            }
        };

        if !recorded.contains(&AnomalyType::ProxyAttempt) {
            return;
        }

        match self.tracker.should_lock(attempt.session_id).await {
            Ok(true) => {
                if let Err(err) = self
                    .sessions
                    .lock_session(attempt.session_id, "proxy attempt limit reached")
                    .await
                {
                    log_error!("failed to lock session {}: {err}", attempt.session_id);
                }
            }
            Ok(false) => {}
            Err(err) => log_error!("lock check failed for session {}: {err}", attempt.session_id),
        }
    }
}
