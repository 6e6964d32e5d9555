//! Per-factor scorers.
//!
//! Every scorer turns evidence plus session configuration into a
//! [`FactorScore`]. Missing data yields `available: false`, never an error;
//! only the face scorer, which calls out to a model service, can fail.

pub mod barometer;
pub mod ble;
pub mod config;
pub mod face;
pub mod geofence;
pub mod motion;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{db::models::Session, evidence::EvidenceBundle};

pub use config::ScoringConfig;
pub use face::{score_face, FaceMatcher, HttpFaceMatcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Factor {
    Otp,
    Face,
    Geofence,
    Ble,
    Motion,
    Barometer,
}

impl Factor {
    pub const ALL: [Factor; 6] = [
        Factor::Otp,
        Factor::Face,
        Factor::Geofence,
        Factor::Ble,
        Factor::Motion,
        Factor::Barometer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Factor::Otp => "otp",
            Factor::Face => "face",
            Factor::Geofence => "geofence",
            Factor::Ble => "ble",
            Factor::Motion => "motion",
            Factor::Barometer => "barometer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactorScore {
    pub available: bool,
    pub passed: bool,
    /// Factor-specific measurement: meters, dBm, similarity, ratio or hPa.
    pub metric: Option<f64>,
    pub detail: Option<String>,
}

impl FactorScore {
    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self {
            available: false,
            passed: false,
            metric: None,
            detail: Some(detail.into()),
        }
    }

    pub fn measured(passed: bool, metric: f64) -> Self {
        Self {
            available: true,
            passed,
            metric: Some(metric),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

pub type ScoreCard = BTreeMap<Factor, FactorScore>;

/// Runs every scorer that needs no I/O.
pub fn score_sensors(bundle: &EvidenceBundle, session: &Session, config: &ScoringConfig) -> ScoreCard {
    let mut card = ScoreCard::new();
    card.insert(Factor::Geofence, geofence::score(bundle, session, config));
    card.insert(Factor::Ble, ble::score(bundle, session, config));
    card.insert(Factor::Motion, motion::score(bundle, config));
    card.insert(Factor::Barometer, barometer::score(bundle, session, config));
    card
}
