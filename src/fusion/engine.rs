use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::scoring::{Factor, FactorScore, ScoreCard};

use super::policy::{FactorRequirement, FusionPolicy};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactorOutcome {
    pub requirement: FactorRequirement,
    pub available: bool,
    pub passed: bool,
    pub metric: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    pub success: bool,
    /// Every factor, including disabled and unavailable ones.
    pub factors: BTreeMap<Factor, FactorOutcome>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub attendance_id: Option<i64>,
}

impl VerificationResult {
    pub fn factor(&self, factor: Factor) -> Option<&FactorOutcome> {
        self.factors.get(&factor)
    }

    pub fn passed(&self, factor: Factor) -> bool {
        self.factor(factor).is_some_and(|o| o.passed)
    }

    pub fn metric(&self, factor: Factor) -> Option<f64> {
        self.factor(factor).and_then(|o| o.metric)
    }

    pub fn failed_with(&self, requirement: FactorRequirement) -> Vec<Factor> {
        self.factors
            .iter()
            .filter(|(_, o)| o.requirement == requirement && !o.passed)
            .map(|(factor, _)| *factor)
            .collect()
    }
}

fn join(factors: &[Factor]) -> String {
    factors
        .iter()
        .map(Factor::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Combines factor scores under `policy`.
///
/// Success iff every required factor is available and passed. Scores are
/// reported as-is and never averaged into the verdict.
pub fn decide(scores: &ScoreCard, policy: &FusionPolicy, now: DateTime<Utc>) -> VerificationResult {
    let factors: BTreeMap<Factor, FactorOutcome> = Factor::ALL
        .iter()
        .map(|factor| {
            let score = scores
                .get(factor)
                .cloned()
                .unwrap_or_else(|| FactorScore::unavailable("not evaluated"));
            let requirement = policy.requirement(*factor);
            let outcome = FactorOutcome {
                requirement,
                available: score.available,
                passed: score.available && score.passed,
                metric: score.metric,
                detail: score.detail,
            };
            (*factor, outcome)
        })
        .collect();

    let mut result = VerificationResult {
        success: false,
        factors,
        message: String::new(),
        timestamp: now,
        attendance_id: None,
    };

    let failed_required = result.failed_with(FactorRequirement::Required);
    result.success = failed_required.is_empty();
    result.message = if result.success {
        let advisory: Vec<Factor> = result
            .failed_with(FactorRequirement::Advisory)
            .into_iter()
            .filter(|f| result.factors[f].available)
            .collect();
        if advisory.is_empty() {
            "Attendance verified".to_string()
        } else {
            format!("Attendance verified (advisory checks failed: {})", join(&advisory))
        }
    } else {
        format!("Verification failed: {}", join(&failed_required))
    };
    result
}
