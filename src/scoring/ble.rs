use crate::{db::models::Session, evidence::EvidenceBundle};

use super::{FactorScore, ScoringConfig};

/// Mean of the most recent `window` samples.
pub fn recent_average(samples: &[f64], window: usize) -> Option<f64> {
    let window = window.max(1);
    let recent = &samples[samples.len().saturating_sub(window)..];
    if recent.is_empty() {
        return None;
    }
    Some(recent.iter().sum::<f64>() / recent.len() as f64)
}

/// Log-distance path loss estimate in meters.
pub fn estimate_distance_m(rssi: f64, tx_power: f64, path_loss_exponent: f64) -> f64 {
    10f64.powf((tx_power - rssi) / (10.0 * path_loss_exponent))
}

pub fn score(bundle: &EvidenceBundle, session: &Session, config: &ScoringConfig) -> FactorScore {
    let Some(reading) = &bundle.ble else {
        return FactorScore::unavailable("no BLE reading");
    };
    let Some(average) = recent_average(&reading.rssi_samples, config.ble_window) else {
        return FactorScore::unavailable("no RSSI samples");
    };

    if let (Some(expected), Some(seen)) = (&session.beacon_uuid, &reading.beacon_uuid) {
        if !expected.eq_ignore_ascii_case(seen) {
            return FactorScore::measured(false, average)
                .with_detail(format!("heard beacon {seen}, session beacon is {expected}"));
        }
    }

    let distance = estimate_distance_m(average, config.ble_tx_power_dbm, config.ble_path_loss_exponent);
    FactorScore::measured(average > config.ble_rssi_threshold_dbm, average)
        .with_detail(format!("~{distance:.1} m from beacon"))
}
