//! Structural checks run on every evidence bundle before any scorer sees it.
//!
//! All checks run; a bundle is reported with every problem found rather than
//! the first one, so a client can fix its payload in a single round trip.

use image::GrayImage;
use serde::Serialize;

use crate::{
    error::{VerifyError, VerifyResult},
    evidence::{EvidenceBundle, MotionSample},
    settings::ValidationSettings,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Missing,
    Malformed,
    OutOfRange,
    TooFewSamples,
    NonMonotonic,
    LowQuality,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub field: String,
    pub kind: IssueKind,
    pub message: String,
}

impl ValidationIssue {
    fn new(field: &str, kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Valid,
    Invalid(Vec<ValidationIssue>),
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid)
    }

    pub fn into_result(self) -> VerifyResult<()> {
        match self {
            ValidationOutcome::Valid => Ok(()),
            ValidationOutcome::Invalid(issues) => Err(VerifyError::InvalidEvidence(issues)),
        }
    }
}

pub fn validate(bundle: &EvidenceBundle, settings: &ValidationSettings) -> ValidationOutcome {
    let mut issues = Vec::new();

    check_identifiers(bundle, &mut issues);
    check_face_frame(bundle, settings, &mut issues);
    check_gps(bundle, settings, &mut issues);
    if let Some(samples) = &bundle.accel {
        check_series("accel", samples, settings.min_motion_samples, &mut issues);
    }
    if let Some(samples) = &bundle.gyro {
        check_series("gyro", samples, settings.min_motion_samples, &mut issues);
    }
    check_ble(bundle, settings, &mut issues);
    check_pressure(bundle, settings, &mut issues);

    if issues.is_empty() {
        ValidationOutcome::Valid
    } else {
        ValidationOutcome::Invalid(issues)
    }
}

fn check_identifiers(bundle: &EvidenceBundle, issues: &mut Vec<ValidationIssue>) {
    if bundle.session_id.trim().is_empty() {
        issues.push(ValidationIssue::new("session_id", IssueKind::Missing, "session id is required"));
    }
    if bundle.student_id.trim().is_empty() {
        issues.push(ValidationIssue::new("student_id", IssueKind::Missing, "student id is required"));
    }

    let code = bundle.code.trim();
    if code.is_empty() {
        issues.push(ValidationIssue::new("otp", IssueKind::Missing, "one-time code is required"));
    } else if !code.chars().all(|c| c.is_ascii_digit()) {
        issues.push(ValidationIssue::new("otp", IssueKind::Malformed, "one-time code must be numeric"));
    }
}

fn check_face_frame(
    bundle: &EvidenceBundle,
    settings: &ValidationSettings,
    issues: &mut Vec<ValidationIssue>,
) {
    if bundle.face_image.trim().is_empty() {
        issues.push(ValidationIssue::new("face_image", IssueKind::Missing, "face frame is required"));
        return;
    }

    let bytes = match bundle.decode_face_frame() {
        Ok(bytes) => bytes,
        Err(err) => {
            issues.push(ValidationIssue::new(
                "face_image",
                IssueKind::Malformed,
                format!("face frame is not valid base64: {err}"),
            ));
            return;
        }
    };

    match image::load_from_memory(&bytes) {
        Ok(frame) if frame.width() > 0 && frame.height() > 0 => {
            check_frame_quality(&frame.to_luma8(), settings, issues);
        }
        Ok(_) => issues.push(ValidationIssue::new(
            "face_image",
            IssueKind::Malformed,
            "face frame has no pixels",
        )),
        Err(err) => issues.push(ValidationIssue::new(
            "face_image",
            IssueKind::Malformed,
            format!("face frame is not a decodable image: {err}"),
        )),
    }
}

/// Luma statistics of a frame: mean, standard deviation and the variance of
/// the 4-neighbour Laplacian over interior pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameQuality {
    pub brightness: f64,
    pub contrast: f64,
    pub sharpness: f64,
}

pub fn frame_quality(luma: &GrayImage) -> FrameQuality {
    let pixels = luma.as_raw();
    let count = pixels.len().max(1) as f64;
    let brightness = pixels.iter().map(|&p| f64::from(p)).sum::<f64>() / count;
    let contrast = (pixels
        .iter()
        .map(|&p| (f64::from(p) - brightness).powi(2))
        .sum::<f64>()
        / count)
        .sqrt();

    let (width, height) = luma.dimensions();
    let mut responses = Vec::new();
    for y in 1..height.saturating_sub(1) {
        for x in 1..width.saturating_sub(1) {
            let at = |dx: i64, dy: i64| {
                f64::from(luma.get_pixel((x as i64 + dx) as u32, (y as i64 + dy) as u32)[0])
            };
            responses.push(at(-1, 0) + at(1, 0) + at(0, -1) + at(0, 1) - 4.0 * at(0, 0));
        }
    }
    let sharpness = if responses.is_empty() {
        0.0
    } else {
        let n = responses.len() as f64;
        let mean = responses.iter().sum::<f64>() / n;
        responses.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n
    };

    FrameQuality {
        brightness,
        contrast,
        sharpness,
    }
}

fn check_frame_quality(
    luma: &GrayImage,
    settings: &ValidationSettings,
    issues: &mut Vec<ValidationIssue>,
) {
    let quality = frame_quality(luma);

    if quality.brightness < settings.min_brightness || quality.brightness > settings.max_brightness {
        issues.push(ValidationIssue::new(
            "face_image",
            IssueKind::OutOfRange,
            format!(
                "face frame brightness {:.1} outside [{}, {}]",
                quality.brightness, settings.min_brightness, settings.max_brightness
            ),
        ));
    }
    if quality.contrast < settings.min_contrast {
        issues.push(ValidationIssue::new(
            "face_image",
            IssueKind::LowQuality,
            format!(
                "face frame contrast {:.1} below {}",
                quality.contrast, settings.min_contrast
            ),
        ));
    }
    if quality.sharpness < settings.min_sharpness {
        issues.push(ValidationIssue::new(
            "face_image",
            IssueKind::LowQuality,
            format!(
                "face frame is blurry (sharpness {:.1} below {})",
                quality.sharpness, settings.min_sharpness
            ),
        ));
    }
}

fn check_gps(
    bundle: &EvidenceBundle,
    settings: &ValidationSettings,
    issues: &mut Vec<ValidationIssue>,
) {
    let Some(fix) = bundle.gps else {
        return;
    };

    if !fix.latitude.is_finite() || !(-90.0..=90.0).contains(&fix.latitude) {
        issues.push(ValidationIssue::new(
            "latitude",
            IssueKind::OutOfRange,
            format!("latitude {} outside [-90, 90]", fix.latitude),
        ));
    }
    if !fix.longitude.is_finite() || !(-180.0..=180.0).contains(&fix.longitude) {
        issues.push(ValidationIssue::new(
            "longitude",
            IssueKind::OutOfRange,
            format!("longitude {} outside [-180, 180]", fix.longitude),
        ));
    }
    if let Some(accuracy) = fix.accuracy_m {
        if !accuracy.is_finite() || accuracy < 0.0 || accuracy > settings.max_gps_accuracy_m {
            issues.push(ValidationIssue::new(
                "gps_accuracy",
                IssueKind::OutOfRange,
                format!(
                    "accuracy {accuracy} m exceeds the {} m ceiling",
                    settings.max_gps_accuracy_m
                ),
            ));
        }
    }
}

/// Motion series must be long enough and strictly increasing in time.
/// Out-of-order samples are rejected, never re-sorted.
fn check_series(
    field: &str,
    samples: &[MotionSample],
    min_samples: usize,
    issues: &mut Vec<ValidationIssue>,
) {
    if samples.len() < min_samples {
        issues.push(ValidationIssue::new(
            field,
            IssueKind::TooFewSamples,
            format!("{} samples, at least {min_samples} required", samples.len()),
        ));
    }

    if samples
        .iter()
        .any(|s| !(s.x.is_finite() && s.y.is_finite() && s.z.is_finite() && s.timestamp.is_finite()))
    {
        issues.push(ValidationIssue::new(field, IssueKind::Malformed, "non-finite sample value"));
    }

    if let Some(idx) = samples
        .windows(2)
        .position(|pair| pair[1].timestamp <= pair[0].timestamp)
    {
        issues.push(ValidationIssue::new(
            field,
            IssueKind::NonMonotonic,
            format!("timestamp at index {} does not increase", idx + 1),
        ));
    }
}

fn check_ble(
    bundle: &EvidenceBundle,
    settings: &ValidationSettings,
    issues: &mut Vec<ValidationIssue>,
) {
    let Some(reading) = &bundle.ble else {
        return;
    };

    if reading.rssi_samples.is_empty() {
        issues.push(ValidationIssue::new("ble_rssi", IssueKind::TooFewSamples, "no RSSI samples"));
        return;
    }

    let out_of_range = reading
        .rssi_samples
        .iter()
        .filter(|rssi| {
            !rssi.is_finite() || **rssi < settings.min_rssi_dbm || **rssi > settings.max_rssi_dbm
        })
        .count();
    if out_of_range > 0 {
        issues.push(ValidationIssue::new(
            "ble_rssi",
            IssueKind::OutOfRange,
            format!(
                "{out_of_range} RSSI sample(s) outside [{}, {}] dBm",
                settings.min_rssi_dbm, settings.max_rssi_dbm
            ),
        ));
    }
}

fn check_pressure(
    bundle: &EvidenceBundle,
    settings: &ValidationSettings,
    issues: &mut Vec<ValidationIssue>,
) {
    let Some(pressure) = bundle.pressure_hpa else {
        return;
    };
    if !pressure.is_finite()
        || pressure < settings.min_pressure_hpa
        || pressure > settings.max_pressure_hpa
    {
        issues.push(ValidationIssue::new(
            "barometric_pressure",
            IssueKind::OutOfRange,
            format!(
                "pressure {pressure} hPa outside [{}, {}]",
                settings.min_pressure_hpa, settings.max_pressure_hpa
            ),
        ));
    }
}
