use crate::evidence::{EvidenceBundle, MotionSample};

use super::{FactorScore, ScoringConfig};

/// Largest change in vertical acceleration between consecutive samples.
pub fn nod_magnitude(accel: &[MotionSample]) -> f64 {
    accel
        .windows(2)
        .map(|pair| (pair[1].z - pair[0].z).abs())
        .fold(0.0, f64::max)
}

/// Largest absolute yaw rate.
pub fn shake_magnitude(gyro: &[MotionSample]) -> f64 {
    gyro.iter().map(|s| s.y.abs()).fold(0.0, f64::max)
}

/// Liveness passes on either a nod or a head shake. The metric is the
/// stronger gesture as a multiple of its threshold.
pub fn score(bundle: &EvidenceBundle, config: &ScoringConfig) -> FactorScore {
    let accel = bundle.accel.as_deref().unwrap_or(&[]);
    let gyro = bundle.gyro.as_deref().unwrap_or(&[]);
    if accel.len() < 2 && gyro.is_empty() {
        return FactorScore::unavailable("no motion samples");
    }

    let nod = nod_magnitude(accel);
    let shake = shake_magnitude(gyro);
    let nodded = nod > config.nod_threshold;
    let shook = shake > config.shake_threshold;

    let ratio = (nod / config.nod_threshold).max(shake / config.shake_threshold);
    let detail = match (nodded, shook) {
        (true, true) => "nod and shake detected",
        (true, false) => "nod detected",
        (false, true) => "shake detected",
        (false, false) => "no deliberate movement",
    };
    FactorScore::measured(nodded || shook, ratio).with_detail(detail)
}
