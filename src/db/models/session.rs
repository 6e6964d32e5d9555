//! Attendance session data models.
//!
//! A session is one instructor-initiated attendance window for a class. It owns
//! the one-time codes issued for it and is never deleted, only archived.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LockState {
    Open,
    Locked,
}

impl LockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::Open => "Open",
            LockState::Locked => "Locked",
        }
    }
}

impl Default for LockState {
    fn default() -> Self {
        LockState::Open
    }
}

/// Circular boundary around the classroom.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Geofence {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
}

/// Explicit per-session configuration chosen by the instructor at start time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub geofence: Option<Geofence>,
    pub beacon_uuid: Option<String>,
    pub pressure_baseline_hpa: Option<f64>,
    pub require_ble: bool,
    pub require_motion: bool,
    pub require_barometer: bool,
    /// Overrides the configured code TTL for this session only.
    pub otp_ttl_secs: Option<u64>,
    /// Overrides the configured session window for this session only.
    pub window_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub class_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub geofence: Option<Geofence>,
    pub beacon_uuid: Option<String>,
    pub pressure_baseline_hpa: Option<f64>,
    pub require_ble: bool,
    pub require_motion: bool,
    pub require_barometer: bool,
    pub otp_ttl_secs: u64,
    pub max_resends: u32,
    pub lock_state: LockState,
    pub lock_reason: Option<String>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_locked(&self) -> bool {
        self.lock_state == LockState::Locked
    }
}

/// Summary returned to the instructor after starting a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub class_id: String,
    pub otp_count: usize,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
impl Session {
    /// Open session with a ten minute window and no optional factors.
    pub(crate) fn fixture() -> Self {
        let now = Utc::now();
        Self {
            id: "session-1".into(),
            class_id: "class-1".into(),
            created_at: now,
            expires_at: now + chrono::Duration::minutes(10),
            geofence: None,
            beacon_uuid: None,
            pressure_baseline_hpa: None,
            require_ble: false,
            require_motion: false,
            require_barometer: false,
            otp_ttl_secs: 60,
            max_resends: 2,
            lock_state: LockState::Open,
            lock_reason: None,
            archived_at: None,
        }
    }
}
