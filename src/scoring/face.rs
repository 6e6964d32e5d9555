use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::{VerifyError, VerifyResult};

use super::{FactorScore, ScoringConfig};

const ENABLE_LOGS: bool = true;

use crate::log_warn;

/// Black-box face similarity model.
///
/// Returns a similarity in `[0, 1]` between the frame and the student's
/// enrolled reference.
#[async_trait]
pub trait FaceMatcher: Send + Sync {
    async fn similarity(&self, student_id: &str, frame: &[u8]) -> Result<f64>;
}

#[derive(Serialize)]
struct SimilarityRequest<'a> {
    student_id: &'a str,
    image: String,
}

#[derive(Deserialize)]
struct SimilarityResponse {
    similarity: f64,
}

/// [`FaceMatcher`] backed by an HTTP model service.
pub struct HttpFaceMatcher {
    client: reqwest::Client,
    url: String,
}

impl HttpFaceMatcher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build face model HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl FaceMatcher for HttpFaceMatcher {
    async fn similarity(&self, student_id: &str, frame: &[u8]) -> Result<f64> {
        let response = self
            .client
            .post(&self.url)
            .json(&SimilarityRequest {
                student_id,
                image: STANDARD.encode(frame),
            })
            .send()
            .await
            .context("face model request failed")?;

        if !response.status().is_success() {
            bail!("face model rejected request: {}", response.status());
        }

        let body: SimilarityResponse = response
            .json()
            .await
            .context("face model returned an unreadable body")?;
        Ok(body.similarity)
    }
}

/// Scores the frame, retrying infrastructure failures with linear backoff.
pub async fn score_face(
    matcher: &dyn FaceMatcher,
    student_id: &str,
    frame: &[u8],
    config: &ScoringConfig,
    retries: u32,
    backoff: Duration,
) -> VerifyResult<FactorScore> {
    let mut attempt = 0;
    loop {
        let err = match matcher.similarity(student_id, frame).await {
            Ok(similarity) if similarity.is_finite() => {
                let similarity = similarity.clamp(0.0, 1.0);
                return Ok(FactorScore::measured(
                    similarity >= config.face_pass_threshold,
                    similarity,
                ));
            }
            Ok(similarity) => anyhow::anyhow!("face model returned {similarity}"),
            Err(err) => err,
        };

        if attempt >= retries {
            return Err(VerifyError::FaceModelUnavailable(format!("{err:#}")));
        }
        attempt += 1;
        log_warn!(
            "face scoring attempt {} for {} failed: {err:#}",
            attempt,
            student_id
        );
        tokio::time::sleep(backoff * attempt).await;
    }
}
