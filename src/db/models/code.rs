use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stored state of a one-time code. `Expired` is also derived on read from
/// `expires_at`, the sweeper only materializes it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CodeState {
    Issued,
    Consumed,
    Expired,
}

impl CodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeState::Issued => "Issued",
            CodeState::Consumed => "Consumed",
            CodeState::Expired => "Expired",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimeCode {
    pub session_id: String,
    pub student_id: String,
    pub code: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resend_count: u32,
    pub max_resends: u32,
    pub state: CodeState,
    pub consumed_at: Option<DateTime<Utc>>,
}

impl OneTimeCode {
    pub fn effective_state(&self, now: DateTime<Utc>) -> CodeState {
        match self.state {
            CodeState::Issued if now >= self.expires_at => CodeState::Expired,
            other => other,
        }
    }

    pub fn remaining_secs(&self, now: DateTime<Utc>) -> u64 {
        let remaining_ms = (self.expires_at - now).num_milliseconds().max(0) as u64;
        remaining_ms.div_ceil(1000)
    }

    pub fn resends_remaining(&self) -> u32 {
        self.max_resends.saturating_sub(self.resend_count)
    }
}
