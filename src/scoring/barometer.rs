use crate::{db::models::Session, evidence::EvidenceBundle};

use super::{FactorScore, ScoringConfig};

/// Approximate altitude change per hPa near sea level.
pub const METERS_PER_HPA: f64 = -8.5;

/// Floor check: the reading must sit within tolerance of the classroom
/// baseline captured when the session started.
pub fn score(bundle: &EvidenceBundle, session: &Session, config: &ScoringConfig) -> FactorScore {
    let Some(baseline) = session.pressure_baseline_hpa else {
        return FactorScore::unavailable("session has no pressure baseline");
    };
    let Some(pressure) = bundle.pressure_hpa else {
        return FactorScore::unavailable("no pressure reading");
    };

    let offset = pressure - baseline;
    let delta = offset.abs();
    FactorScore::measured(delta <= config.barometer_tolerance_hpa, delta)
        .with_detail(format!("~{:+.1} m from classroom floor", offset * METERS_PER_HPA))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_baseline(baseline: Option<f64>) -> Session {
        Session {
            pressure_baseline_hpa: baseline,
            ..Session::fixture()
        }
    }

    fn reading(pressure: f64) -> EvidenceBundle {
        EvidenceBundle {
            pressure_hpa: Some(pressure),
            ..EvidenceBundle::default()
        }
    }

    #[test]
    fn same_floor_passes_other_floor_fails() {
        let config = ScoringConfig::default();
        let session = with_baseline(Some(1013.2));

        let same = score(&reading(1013.4), &session, &config);
        assert!(same.passed);

        // one storey (~3.5 m) is about 0.4 hPa; two storeys should fail
        let upstairs = score(&reading(1012.2), &session, &config);
        assert!(upstairs.available);
        assert!(!upstairs.passed);
        assert!((upstairs.metric.unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn missing_baseline_or_reading_is_unavailable() {
        let config = ScoringConfig::default();
        assert!(!score(&reading(1013.0), &with_baseline(None), &config).available);
        assert!(!score(&EvidenceBundle::default(), &with_baseline(Some(1013.0)), &config).available);
    }
}
