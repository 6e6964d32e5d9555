use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    evidence::{BleReading, EvidenceBundle, GpsFix, MotionSample},
    fusion::{FactorOutcome, VerificationResult},
    scoring::Factor,
    validation::ValidationIssue,
};

/// RSSI may arrive as a single reading or as a series.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RssiInput {
    Single(f64),
    Series(Vec<f64>),
}

impl RssiInput {
    fn into_samples(self) -> Vec<f64> {
        match self {
            RssiInput::Single(value) => vec![value],
            RssiInput::Series(values) => values,
        }
    }
}

/// Identifiers default to empty so that missing fields surface as
/// validation issues instead of a body rejection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VerifyRequest {
    pub student_id: String,
    pub session_id: String,
    pub otp: String,
    pub face_image: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub gps_accuracy: Option<f64>,
    pub ble_rssi: Option<RssiInput>,
    pub ble_beacon_uuid: Option<String>,
    pub motion_samples: Option<Vec<MotionSample>>,
    pub gyro_samples: Option<Vec<MotionSample>>,
    pub barometric_pressure: Option<f64>,
    pub client_timestamp: Option<DateTime<Utc>>,
}

impl VerifyRequest {
    pub fn into_bundle(self) -> EvidenceBundle {
        // A lone coordinate is kept as NaN so validation rejects it.
        let gps = match (self.latitude, self.longitude) {
            (None, None) => None,
            (latitude, longitude) => Some(GpsFix {
                latitude: latitude.unwrap_or(f64::NAN),
                longitude: longitude.unwrap_or(f64::NAN),
                accuracy_m: self.gps_accuracy,
            }),
        };

        let ble = match (self.ble_rssi, self.ble_beacon_uuid) {
            (None, None) => None,
            (rssi, beacon_uuid) => Some(BleReading {
                rssi_samples: rssi.map(RssiInput::into_samples).unwrap_or_default(),
                beacon_uuid,
            }),
        };

        EvidenceBundle {
            session_id: self.session_id,
            student_id: self.student_id,
            code: self.otp,
            face_image: self.face_image,
            gps,
            ble,
            accel: self.motion_samples,
            gyro: self.gyro_samples,
            pressure_hpa: self.barometric_pressure,
            client_timestamp: self.client_timestamp,
        }
    }
}

/// Flat summary kept for clients that only read booleans. Optional factors
/// appear only when they were measured.
#[derive(Debug, Clone, Serialize)]
pub struct FactorSummary {
    pub otp_verified: bool,
    pub face_verified: bool,
    pub face_confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geofence_verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_meters: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ble_verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ble_rssi: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motion_verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barometer_verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure_delta_hpa: Option<f64>,
}

impl FactorSummary {
    fn from_result(result: &VerificationResult) -> Self {
        let measured = |factor: Factor| result.factor(factor).filter(|o| o.available);
        let passed = |factor: Factor| measured(factor).map(|o| o.passed);
        let metric = |factor: Factor| measured(factor).and_then(|o| o.metric);

        Self {
            otp_verified: result.passed(Factor::Otp),
            face_verified: result.passed(Factor::Face),
            face_confidence: metric(Factor::Face),
            geofence_verified: passed(Factor::Geofence),
            distance_meters: metric(Factor::Geofence),
            ble_verified: passed(Factor::Ble),
            ble_rssi: metric(Factor::Ble),
            motion_verified: passed(Factor::Motion),
            barometer_verified: passed(Factor::Barometer),
            pressure_delta_hpa: metric(Factor::Barometer),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyResponse {
    pub success: bool,
    pub factors: FactorSummary,
    pub factor_details: BTreeMap<Factor, FactorOutcome>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attendance_id: Option<i64>,
}

impl From<VerificationResult> for VerifyResponse {
    fn from(result: VerificationResult) -> Self {
        Self {
            success: result.success,
            factors: FactorSummary::from_result(&result),
            factor_details: result.factors,
            message: result.message,
            timestamp: result.timestamp,
            attendance_id: result.attendance_id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<ValidationIssue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OtpResponse {
    pub otp: String,
    pub remaining_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResendRequest {
    pub session_id: String,
    pub student_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResendResponse {
    pub otp: String,
    pub attempts_remaining: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LockRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewRequest {
    pub reviewer: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrollRequest {
    pub student_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AnomalyQuery {
    pub limit: Option<u32>,
    pub student_id: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub message: String,
}

impl StatusResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: "success".into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}
