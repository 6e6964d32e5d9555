//! Anomaly log data models.
//!
//! Anomalies are insert-only; a reviewer may flip `reviewed` exactly once.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    /// Correct code, face clearly belongs to someone else.
    ProxyAttempt,
    /// Correct code, face score in the ambiguous band.
    IdentityMismatch,
    ImpossibleTravel,
    LockoutTriggered,
    /// Attendance granted but advisory liveness evidence failed.
    LivenessFailed,
    VerificationFailed,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyType::ProxyAttempt => "proxy_attempt",
            AnomalyType::IdentityMismatch => "identity_mismatch",
            AnomalyType::ImpossibleTravel => "impossible_travel",
            AnomalyType::LockoutTriggered => "lockout_triggered",
            AnomalyType::LivenessFailed => "liveness_failed",
            AnomalyType::VerificationFailed => "verification_failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "proxy_attempt" => Some(AnomalyType::ProxyAttempt),
            "identity_mismatch" => Some(AnomalyType::IdentityMismatch),
            "impossible_travel" => Some(AnomalyType::ImpossibleTravel),
            "lockout_triggered" => Some(AnomalyType::LockoutTriggered),
            "liveness_failed" => Some(AnomalyType::LivenessFailed),
            "verification_failed" => Some(AnomalyType::VerificationFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub id: Option<i64>,
    pub session_id: String,
    pub student_id: Option<String>,
    pub anomaly_type: AnomalyType,
    pub reason: String,
    /// Named confidence values that triggered the record (e.g. `face`, `speed_mps`).
    pub confidences: BTreeMap<String, f64>,
    pub created_at: DateTime<Utc>,
    pub reviewed: bool,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

impl AnomalyRecord {
    pub fn new(
        session_id: &str,
        student_id: Option<&str>,
        anomaly_type: AnomalyType,
        reason: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            session_id: session_id.to_string(),
            student_id: student_id.map(str::to_string),
            anomaly_type,
            reason: reason.into(),
            confidences: BTreeMap::new(),
            created_at,
            reviewed: false,
            reviewed_by: None,
            reviewed_at: None,
        }
    }

    pub fn with_confidence(mut self, name: &str, value: f64) -> Self {
        self.confidences.insert(name.to_string(), value);
        self
    }
}

/// Last place a student was seen attempting verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceFix {
    pub student_id: String,
    pub session_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountLock {
    pub student_id: String,
    pub locked: bool,
    pub locked_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub unlocked_at: Option<DateTime<Utc>>,
}
