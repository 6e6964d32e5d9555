use crate::{db::models::Session, evidence::EvidenceBundle};

use super::{FactorScore, ScoringConfig};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Passes when the fix lies within the session radius, boundary included.
pub fn score(bundle: &EvidenceBundle, session: &Session, config: &ScoringConfig) -> FactorScore {
    let Some(fence) = session.geofence else {
        return FactorScore::unavailable("session has no geofence");
    };
    let Some(fix) = bundle.gps else {
        return FactorScore::unavailable("no location fix");
    };

    let radius = if fence.radius_m.is_finite() && fence.radius_m > 0.0 {
        fence.radius_m
    } else {
        config.default_geofence_radius_m
    };

    let distance = haversine_m(fence.latitude, fence.longitude, fix.latitude, fix.longitude);
    FactorScore::measured(distance <= radius, distance)
        .with_detail(format!("{distance:.1} m from center, radius {radius:.0} m"))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{db::models::Geofence, evidence::GpsFix};

    fn fenced(latitude: f64, longitude: f64, radius_m: f64) -> Session {
        Session {
            geofence: Some(Geofence {
                latitude,
                longitude,
                radius_m,
            }),
            ..Session::fixture()
        }
    }

    fn at(latitude: f64, longitude: f64) -> EvidenceBundle {
        EvidenceBundle {
            gps: Some(GpsFix {
                latitude,
                longitude,
                accuracy_m: Some(5.0),
            }),
            ..EvidenceBundle::default()
        }
    }

    #[test]
    fn one_degree_of_latitude_is_about_111_km() {
        let d = haversine_m(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111_195.0).abs() < 1.0, "got {d}");
    }

    #[test]
    fn boundary_is_inclusive_and_one_meter_beyond_fails() {
        let fix = at(40.7130, -74.0060);
        let distance = haversine_m(40.7128, -74.0060, 40.7130, -74.0060);

        let on_edge = score(&fix, &fenced(40.7128, -74.0060, distance), &ScoringConfig::default());
        assert!(on_edge.passed);

        let short = score(&fix, &fenced(40.7128, -74.0060, distance - 1.0), &ScoringConfig::default());
        assert!(short.available);
        assert!(!short.passed);
    }

    #[test]
    fn missing_fence_or_fix_is_unavailable() {
        let config = ScoringConfig::default();
        let no_fence = score(&at(1.0, 1.0), &Session::fixture(), &config);
        assert!(!no_fence.available);

        let no_fix = score(&EvidenceBundle::default(), &fenced(1.0, 1.0, 100.0), &config);
        assert!(!no_fix.available);
        assert!(!no_fix.passed);
    }

    #[test]
    fn unusable_radius_falls_back_to_default() {
        let config = ScoringConfig::default();
        let result = score(&at(0.0, 0.0003), &fenced(0.0, 0.0, 0.0), &config);
        // ~33 m away, inside the 50 m default
        assert!(result.passed);
    }

    proptest! {
        #[test]
        fn distance_is_symmetric_and_non_negative(
            lat1 in -89.0f64..89.0,
            lon1 in -179.0f64..179.0,
            lat2 in -89.0f64..89.0,
            lon2 in -179.0f64..179.0,
        ) {
            let forward = haversine_m(lat1, lon1, lat2, lon2);
            let back = haversine_m(lat2, lon2, lat1, lon1);
            prop_assert!(forward >= 0.0);
            prop_assert!((forward - back).abs() < 1e-6);
            prop_assert!(forward <= std::f64::consts::PI * EARTH_RADIUS_M + 1.0);
        }

        #[test]
        fn pass_iff_within_radius(
            dlat in -0.01f64..0.01,
            dlon in -0.01f64..0.01,
            radius in 1.0f64..2_000.0,
        ) {
            let fence = fenced(51.5, -0.12, radius);
            let result = score(&at(51.5 + dlat, -0.12 + dlon), &fence, &ScoringConfig::default());
            let distance = result.metric.unwrap();
            prop_assert_eq!(result.passed, distance <= radius);
        }
    }
}
