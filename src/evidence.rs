//! Raw evidence submitted with one verification attempt.
//!
//! Bundles are never persisted. Frames and sensor series are dropped once
//! scoring finishes.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Reported horizontal accuracy in meters, when the device gives one.
    pub accuracy_m: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BleReading {
    /// Oldest first.
    pub rssi_samples: Vec<f64>,
    pub beacon_uuid: Option<String>,
}

/// One timestamped 3-axis reading. Timestamps are client milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub session_id: String,
    pub student_id: String,
    pub code: String,
    /// Base64 image, optionally wrapped in a `data:` URL.
    pub face_image: String,
    pub gps: Option<GpsFix>,
    pub ble: Option<BleReading>,
    pub accel: Option<Vec<MotionSample>>,
    pub gyro: Option<Vec<MotionSample>>,
    pub pressure_hpa: Option<f64>,
    pub client_timestamp: Option<DateTime<Utc>>,
}

impl EvidenceBundle {
    /// Raw bytes of the face frame.
    pub fn decode_face_frame(&self) -> Result<Vec<u8>, base64::DecodeError> {
        let payload = match self.face_image.split_once(";base64,") {
            Some((prefix, data)) if prefix.starts_with("data:") => data,
            _ => self.face_image.as_str(),
        };
        STANDARD.decode(payload.trim())
    }
}
