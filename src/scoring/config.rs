use serde::{Deserialize, Serialize};

/// Thresholds for the individual scorers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Face similarity at or above this passes.
    pub face_pass_threshold: f64,
    /// Face similarity below this, with a correct code, is treated as a proxy.
    pub face_proxy_threshold: f64,

    /// Average RSSI must be strictly above this to count as in the room.
    pub ble_rssi_threshold_dbm: f64,
    /// Calibrated RSSI at one meter, used only for the distance estimate.
    pub ble_tx_power_dbm: f64,
    pub ble_path_loss_exponent: f64,
    /// Number of most recent samples averaged.
    pub ble_window: usize,

    /// Largest vertical acceleration change that counts as a nod (m/s²).
    pub nod_threshold: f64,
    /// Largest yaw rate that counts as a head shake (rad/s).
    pub shake_threshold: f64,

    pub barometer_tolerance_hpa: f64,

    /// Used when a session geofence carries no usable radius.
    pub default_geofence_radius_m: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            face_pass_threshold: 0.6,
            face_proxy_threshold: 0.3,
            ble_rssi_threshold_dbm: -70.0,
            ble_tx_power_dbm: -59.0,
            ble_path_loss_exponent: 2.0,
            ble_window: 10,
            nod_threshold: 0.5,
            shake_threshold: 0.3,
            barometer_tolerance_hpa: 0.5,
            default_geofence_radius_m: 50.0,
        }
    }
}
