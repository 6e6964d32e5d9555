use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Insert-only record written when a verification succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub session_id: String,
    pub student_id: String,
    pub face_confidence: Option<f64>,
    /// Serialized per-factor outcome map, kept for later review.
    pub factors_json: String,
    pub recorded_at: DateTime<Utc>,
}
