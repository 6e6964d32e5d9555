use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::{
    db::models::{CodeState, OneTimeCode},
    error::{VerifyError, VerifyResult},
};

const MAX_GENERATION_ATTEMPTS: usize = 1_000;

/// Result of checking a submitted code against the stored one, together with
/// the session and account gates that precede it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Accepted,
    Mismatch,
    Expired,
    AlreadyConsumed,
    NoCode,
    AccountLocked,
    SessionNotFound,
    SessionLocked,
    SessionExpired,
}

impl ConsumeOutcome {
    /// The error a refused outcome maps to. `None` for `Accepted` and
    /// `Mismatch`, which are answers rather than refusals.
    pub fn refusal(self, session_id: &str, student_id: &str) -> Option<VerifyError> {
        match self {
            ConsumeOutcome::Accepted | ConsumeOutcome::Mismatch => None,
            ConsumeOutcome::Expired => Some(VerifyError::CodeExpired),
            ConsumeOutcome::AlreadyConsumed => Some(VerifyError::CodeAlreadyConsumed),
            ConsumeOutcome::NoCode => Some(VerifyError::StudentNotEnrolled(student_id.to_string())),
            ConsumeOutcome::AccountLocked => Some(VerifyError::AccountLocked),
            ConsumeOutcome::SessionNotFound => {
                Some(VerifyError::SessionNotFound(session_id.to_string()))
            }
            ConsumeOutcome::SessionLocked => Some(VerifyError::SessionLocked),
            ConsumeOutcome::SessionExpired => Some(VerifyError::SessionExpired),
        }
    }

    /// `Ok(true)` when the code was accepted, `Ok(false)` on a plain mismatch.
    pub fn into_result(self, session_id: &str, student_id: &str) -> VerifyResult<bool> {
        match self.refusal(session_id, student_id) {
            Some(err) => Err(err),
            None => Ok(self == ConsumeOutcome::Accepted),
        }
    }
}

/// Decides whether `submitted` may consume `code` at `now`.
///
/// A consumed code reports `AlreadyConsumed` even after its TTL so that a
/// replay is always distinguishable from a late first attempt.
pub fn evaluate_code(code: &OneTimeCode, submitted: &str, now: DateTime<Utc>) -> ConsumeOutcome {
    match code.effective_state(now) {
        CodeState::Consumed => ConsumeOutcome::AlreadyConsumed,
        CodeState::Expired => ConsumeOutcome::Expired,
        CodeState::Issued if codes_match(&code.code, submitted) => ConsumeOutcome::Accepted,
        CodeState::Issued => ConsumeOutcome::Mismatch,
    }
}

fn codes_match(stored: &str, submitted: &str) -> bool {
    let stored = stored.as_bytes();
    let submitted = submitted.trim().as_bytes();
    if stored.len() != submitted.len() {
        return false;
    }
    stored
        .iter()
        .zip(submitted)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Fixed-length numeric code not present in `taken`.
pub fn generate_code<R: Rng + ?Sized>(
    rng: &mut R,
    length: usize,
    taken: &HashSet<String>,
) -> Option<String> {
    for _ in 0..MAX_GENERATION_ATTEMPTS {
        let candidate: String = (0..length)
            .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
            .collect();
        if !taken.contains(&candidate) {
            return Some(candidate);
        }
    }
    None
}
