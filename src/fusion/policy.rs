use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{db::models::Session, scoring::Factor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorRequirement {
    /// Must be available and pass.
    Required,
    /// Reported and logged, never blocks.
    Advisory,
    /// Not evaluated for this session.
    Disabled,
}

/// Configurable defaults, refined per session by [`FusionPolicy::for_session`].
/// The one-time code is always required.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionDefaults {
    pub face: FactorRequirement,
    pub geofence_when_configured: FactorRequirement,
    pub ble: FactorRequirement,
    pub motion: FactorRequirement,
    pub barometer_when_baseline: FactorRequirement,
}

impl Default for FusionDefaults {
    fn default() -> Self {
        Self {
            face: FactorRequirement::Required,
            geofence_when_configured: FactorRequirement::Required,
            ble: FactorRequirement::Advisory,
            motion: FactorRequirement::Advisory,
            barometer_when_baseline: FactorRequirement::Advisory,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusionPolicy {
    requirements: BTreeMap<Factor, FactorRequirement>,
}

impl FusionPolicy {
    /// Explicit `require_*` flags on the session win over the defaults, even
    /// when the session lacks the configuration the factor would need.
    pub fn for_session(session: &Session, defaults: &FusionDefaults) -> Self {
        let geofence = if session.geofence.is_some() {
            defaults.geofence_when_configured
        } else {
            FactorRequirement::Disabled
        };
        let ble = if session.require_ble {
            FactorRequirement::Required
        } else {
            defaults.ble
        };
        let motion = if session.require_motion {
            FactorRequirement::Required
        } else {
            defaults.motion
        };
        let barometer = if session.require_barometer {
            FactorRequirement::Required
        } else if session.pressure_baseline_hpa.is_some() {
            defaults.barometer_when_baseline
        } else {
            FactorRequirement::Disabled
        };

        Self::from_pairs([
            (Factor::Otp, FactorRequirement::Required),
            (Factor::Face, defaults.face),
            (Factor::Geofence, geofence),
            (Factor::Ble, ble),
            (Factor::Motion, motion),
            (Factor::Barometer, barometer),
        ])
    }

    /// Factors not listed are disabled.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (Factor, FactorRequirement)>) -> Self {
        Self {
            requirements: pairs.into_iter().collect(),
        }
    }

    pub fn requirement(&self, factor: Factor) -> FactorRequirement {
        self.requirements
            .get(&factor)
            .copied()
            .unwrap_or(FactorRequirement::Disabled)
    }
}
