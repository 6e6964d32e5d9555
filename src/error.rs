//! Error kinds surfaced by the verification core.
//!
//! The persistence layer works in `anyhow::Result`; everything that crosses a
//! component boundary is mapped into one of these kinds so callers can tell
//! "resend" apart from "contact admin" without string matching.

use serde::Serialize;
use thiserror::Error;

use crate::validation::ValidationIssue;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("class {0} has no enrolled students")]
    ClassNotFound(String),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session has expired")]
    SessionExpired,

    #[error("session is locked")]
    SessionLocked,

    #[error("student {0} is not enrolled in this class")]
    StudentNotEnrolled(String),

    #[error("maximum resend attempts reached")]
    ResendLimitExceeded,

    #[error("one-time code has expired")]
    CodeExpired,

    #[error("one-time code has already been used")]
    CodeAlreadyConsumed,

    #[error("account is locked pending review")]
    AccountLocked,

    #[error("evidence bundle rejected ({} problem(s))", .0.len())]
    InvalidEvidence(Vec<ValidationIssue>),

    #[error("verification timed out")]
    VerificationTimeout,

    #[error("face model unavailable: {0}")]
    FaceModelUnavailable(String),

    #[error("storage unavailable: {0:#}")]
    StorageUnavailable(#[source] anyhow::Error),

    #[error("anomaly {0} not found")]
    AnomalyNotFound(i64),
}

/// Coarse grouping used by the HTTP layer and by retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    ClientInput,
    NotFound,
    State,
    Locked,
    Infrastructure,
}

impl VerifyError {
    /// Stable machine-readable code returned to clients.
    pub fn code(&self) -> &'static str {
        match self {
            VerifyError::ClassNotFound(_) => "class_not_found",
            VerifyError::SessionNotFound(_) => "session_not_found",
            VerifyError::SessionExpired => "session_expired",
            VerifyError::SessionLocked => "session_locked",
            VerifyError::StudentNotEnrolled(_) => "student_not_enrolled",
            VerifyError::ResendLimitExceeded => "resend_limit_exceeded",
            VerifyError::CodeExpired => "code_expired",
            VerifyError::CodeAlreadyConsumed => "code_already_consumed",
            VerifyError::AccountLocked => "account_locked",
            VerifyError::InvalidEvidence(_) => "invalid_evidence",
            VerifyError::VerificationTimeout => "verification_timeout",
            VerifyError::FaceModelUnavailable(_) => "face_model_unavailable",
            VerifyError::StorageUnavailable(_) => "storage_unavailable",
            VerifyError::AnomalyNotFound(_) => "anomaly_not_found",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            VerifyError::InvalidEvidence(_) => ErrorClass::ClientInput,
            VerifyError::ClassNotFound(_)
            | VerifyError::SessionNotFound(_)
            | VerifyError::StudentNotEnrolled(_)
            | VerifyError::AnomalyNotFound(_) => ErrorClass::NotFound,
            VerifyError::SessionExpired
            | VerifyError::ResendLimitExceeded
            | VerifyError::CodeExpired
            | VerifyError::CodeAlreadyConsumed => ErrorClass::State,
            VerifyError::SessionLocked | VerifyError::AccountLocked => ErrorClass::Locked,
            VerifyError::VerificationTimeout
            | VerifyError::FaceModelUnavailable(_)
            | VerifyError::StorageUnavailable(_) => ErrorClass::Infrastructure,
        }
    }

    /// Only infrastructure failures are worth retrying from the client side.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Infrastructure
    }

    pub fn storage(err: anyhow::Error) -> Self {
        VerifyError::StorageUnavailable(err)
    }
}

pub type VerifyResult<T> = Result<T, VerifyError>;
