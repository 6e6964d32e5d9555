use std::sync::Arc;

use crate::{
    db::{
        models::{AccountLock, AnomalyRecord, AnomalyType, PresenceFix},
        Database,
    },
    error::{VerifyError, VerifyResult},
    evidence::GpsFix,
    fusion::{FactorRequirement, VerificationResult},
    scoring::{geofence::haversine_m, Factor, ScoringConfig},
    utils::Clock,
};

use super::AnomalyConfig;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// One finished verification attempt as seen by the tracker.
#[derive(Debug, Clone, Copy)]
pub struct Attempt<'a> {
    pub session_id: &'a str,
    pub student_id: &'a str,
    pub result: &'a VerificationResult,
    pub location: Option<GpsFix>,
}

/// Classifies attempts into anomalies and applies progressive lockout.
#[derive(Clone)]
pub struct AnomalyTracker {
    db: Database,
    config: AnomalyConfig,
    face_pass_threshold: f64,
    face_proxy_threshold: f64,
    clock: Arc<dyn Clock>,
}

impl AnomalyTracker {
    pub fn new(
        db: Database,
        config: AnomalyConfig,
        scoring: &ScoringConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            config,
            face_pass_threshold: scoring.face_pass_threshold,
            face_proxy_threshold: scoring.face_proxy_threshold,
            clock,
        }
    }

    /// Records whatever the attempt reveals and returns the anomaly kinds
    /// written, `lockout_triggered` included.
    pub async fn record_attempt(&self, attempt: Attempt<'_>) -> VerifyResult<Vec<AnomalyType>> {
        let now = self.clock.now();
        let result = attempt.result;
        let mut recorded = Vec::new();

        let face = result
            .factor(Factor::Face)
            .filter(|o| o.available)
            .and_then(|o| o.metric);
        let code_ok = result.passed(Factor::Otp);

        match face {
            Some(score) if code_ok && score < self.face_proxy_threshold => {
                let record = AnomalyRecord::new(
                    attempt.session_id,
                    Some(attempt.student_id),
                    AnomalyType::ProxyAttempt,
                    format!("correct code with face similarity {score:.2}"),
                    now,
                )
                .with_confidence("face", score);

                let tally = self
                    .db
                    .record_proxy_attempt(
                        record,
                        self.config.lockout_window(),
                        self.config.proxy_lockout_threshold,
                    )
                    .await
                    .map_err(VerifyError::storage)?;

                log_warn!(
                    "proxy attempt by {} in session {} ({} in window)",
                    attempt.student_id,
                    attempt.session_id,
                    tally.proxy_count
                );
                recorded.push(AnomalyType::ProxyAttempt);
                if tally.lockout_triggered {
                    log_warn!("account {} locked after repeated proxy attempts", attempt.student_id);
                    recorded.push(AnomalyType::LockoutTriggered);
                }
            }
            Some(score) if code_ok && score < self.face_pass_threshold => {
                let record = AnomalyRecord::new(
                    attempt.session_id,
                    Some(attempt.student_id),
                    AnomalyType::IdentityMismatch,
                    format!("correct code with ambiguous face similarity {score:.2}"),
                    now,
                )
                .with_confidence("face", score);
                self.insert(record).await?;
                recorded.push(AnomalyType::IdentityMismatch);
            }
            _ if !result.success => {
                let failed = result.failed_with(FactorRequirement::Required);
                let mut record = AnomalyRecord::new(
                    attempt.session_id,
                    Some(attempt.student_id),
                    AnomalyType::VerificationFailed,
                    result.message.clone(),
                    now,
                );
                for factor in failed {
                    if let Some(metric) = result.metric(factor) {
                        record = record.with_confidence(factor.as_str(), metric);
                    }
                }
                self.insert(record).await?;
                recorded.push(AnomalyType::VerificationFailed);
            }
            _ => {}
        }

        if result.success {
            if let Some(motion) = result.factor(Factor::Motion) {
                if motion.available && !motion.passed {
                    let mut record = AnomalyRecord::new(
                        attempt.session_id,
                        Some(attempt.student_id),
                        AnomalyType::LivenessFailed,
                        "attendance granted without a detected nod or shake",
                        now,
                    );
                    if let Some(ratio) = motion.metric {
                        record = record.with_confidence("motion", ratio);
                    }
                    self.insert(record).await?;
                    recorded.push(AnomalyType::LivenessFailed);
                }
            }
        }

        if let Some(fix) = attempt.location {
            if self.check_travel(&attempt, fix).await? {
                recorded.push(AnomalyType::ImpossibleTravel);
            }
        }

        Ok(recorded)
    }

    /// Compares this fix with the student's previous one from another
    /// session, then stores this fix as the latest.
    async fn check_travel(&self, attempt: &Attempt<'_>, fix: GpsFix) -> VerifyResult<bool> {
        let now = self.clock.now();
        let previous = self
            .db
            .last_presence(attempt.student_id)
            .await
            .map_err(VerifyError::storage)?;

        let mut flagged = false;
        if let Some(previous) = previous {
            let elapsed = now - previous.observed_at;
            if previous.session_id != attempt.session_id && elapsed <= self.config.travel_window() {
                let distance = haversine_m(
                    previous.latitude,
                    previous.longitude,
                    fix.latitude,
                    fix.longitude,
                );
                let secs = (elapsed.num_milliseconds() as f64 / 1000.0).max(1.0);
                let speed = distance / secs;
                if speed > self.config.max_speed_mps {
                    let record = AnomalyRecord::new(
                        attempt.session_id,
                        Some(attempt.student_id),
                        AnomalyType::ImpossibleTravel,
                        format!(
                            "{distance:.0} m from session {} in {secs:.0} s",
                            previous.session_id
                        ),
                        now,
                    )
                    .with_confidence("distance_m", distance)
                    .with_confidence("speed_mps", speed);
                    self.insert(record).await?;
                    log_warn!(
                        "impossible travel for {}: {:.0} m/s",
                        attempt.student_id,
                        speed
                    );
                    flagged = true;
                }
            }
        }

        self.db
            .record_presence(PresenceFix {
                student_id: attempt.student_id.to_string(),
                session_id: attempt.session_id.to_string(),
                latitude: fix.latitude,
                longitude: fix.longitude,
                observed_at: now,
            })
            .await
            .map_err(VerifyError::storage)?;

        Ok(flagged)
    }

    async fn insert(&self, record: AnomalyRecord) -> VerifyResult<i64> {
        self.db
            .insert_anomaly(record)
            .await
            .map_err(VerifyError::storage)
    }

    /// True once the session has collected enough proxy attempts to be
    /// locked.
    pub async fn should_lock(&self, session_id: &str) -> VerifyResult<bool> {
        let proxies = self
            .db
            .count_session_anomalies(session_id, AnomalyType::ProxyAttempt)
            .await
            .map_err(VerifyError::storage)?;
        Ok(proxies >= self.config.session_proxy_limit)
    }

    pub async fn unreviewed(&self, limit: u32) -> VerifyResult<Vec<AnomalyRecord>> {
        self.db
            .unreviewed_anomalies(limit)
            .await
            .map_err(VerifyError::storage)
    }

    pub async fn for_student(&self, student_id: &str) -> VerifyResult<Vec<AnomalyRecord>> {
        self.db
            .anomalies_for_student(student_id)
            .await
            .map_err(VerifyError::storage)
    }

    pub async fn for_session(&self, session_id: &str) -> VerifyResult<Vec<AnomalyRecord>> {
        self.db
            .anomalies_for_session(session_id)
            .await
            .map_err(VerifyError::storage)
    }

    pub async fn mark_reviewed(&self, id: i64, reviewer: &str) -> VerifyResult<AnomalyRecord> {
        self.db
            .mark_anomaly_reviewed(id, reviewer, self.clock.now())
            .await
            .map_err(VerifyError::storage)?
            .ok_or(VerifyError::AnomalyNotFound(id))
    }

    /// Current lock row, including the reason and last unlock time.
    pub async fn account_lock(&self, student_id: &str) -> VerifyResult<Option<AccountLock>> {
        self.db
            .account_lock(student_id)
            .await
            .map_err(VerifyError::storage)
    }

    pub async fn is_locked(&self, student_id: &str) -> VerifyResult<bool> {
        Ok(self
            .account_lock(student_id)
            .await?
            .is_some_and(|lock| lock.locked))
    }

    /// Returns `false` when the account was not locked.
    pub async fn unlock_account(&self, student_id: &str) -> VerifyResult<bool> {
        let unlocked = self
            .db
            .unlock_account(student_id, self.clock.now())
            .await
            .map_err(VerifyError::storage)?;
        if unlocked {
            log_info!("account {} unlocked", student_id);
        }
        Ok(unlocked)
    }
}
