use chrono::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Proxy attempts inside the rolling window that lock the account.
    pub proxy_lockout_threshold: u32,
    pub lockout_window_hours: i64,
    /// Proxy attempts in one session that lock the session.
    pub session_proxy_limit: u32,
    /// Fastest plausible movement between two attempts (m/s).
    pub max_speed_mps: f64,
    /// Attempts further apart than this are never compared for travel.
    pub travel_window_hours: i64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            proxy_lockout_threshold: 3,
            lockout_window_hours: 24,
            session_proxy_limit: 5,
            max_speed_mps: 40.0,
            travel_window_hours: 2,
        }
    }
}

impl AnomalyConfig {
    pub fn lockout_window(&self) -> Duration {
        Duration::hours(self.lockout_window_hours)
    }

    pub fn travel_window(&self) -> Duration {
        Duration::hours(self.travel_window_hours)
    }
}
