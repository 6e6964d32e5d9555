use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use crate::{
    db::models::{AnomalyRecord, SessionInfo, SessionOptions},
    error::{ErrorClass, VerifyError},
    verify::VerificationController,
};

use super::dto::{
    AnomalyQuery, EnrollRequest, ErrorResponse, HealthResponse, LockRequest, OtpResponse,
    ResendRequest, ResendResponse, ReviewRequest, StatusResponse, VerifyRequest, VerifyResponse,
};

const ENABLE_LOGS: bool = true;

use crate::log_error;

const DEFAULT_ANOMALY_LIMIT: u32 = 50;
const MAX_ANOMALY_LIMIT: u32 = 500;

pub struct AppState {
    pub controller: VerificationController,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<T, ApiError>;

pub(crate) fn status_for(err: &VerifyError) -> StatusCode {
    match (err, err.class()) {
        (VerifyError::ResendLimitExceeded, _) => StatusCode::TOO_MANY_REQUESTS,
        (VerifyError::VerificationTimeout, _) => StatusCode::GATEWAY_TIMEOUT,
        (_, ErrorClass::ClientInput) => StatusCode::BAD_REQUEST,
        (_, ErrorClass::NotFound) => StatusCode::NOT_FOUND,
        (_, ErrorClass::State) => StatusCode::CONFLICT,
        (_, ErrorClass::Locked) => StatusCode::LOCKED,
        (_, ErrorClass::Infrastructure) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn api_error(err: VerifyError) -> ApiError {
    let status = status_for(&err);
    if status.is_server_error() {
        log_error!("request failed: {err}");
    }

    let message = err.to_string();
    let error = err.code().to_string();
    let reasons = match err {
        VerifyError::InvalidEvidence(issues) => issues,
        _ => Vec::new(),
    };
    (
        status,
        Json(ErrorResponse {
            error,
            message,
            reasons,
        }),
    )
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: "invalid_request".into(),
            message: message.into(),
            reasons: Vec::new(),
        }),
    )
}

/// Parses an optional JSON body. An empty body yields the defaults.
fn optional_body<T>(body: &Bytes) -> ApiResult<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse_body(body)
}

/// Parses a JSON body that must be present.
fn required_body<T>(body: &Bytes) -> ApiResult<T>
where
    T: serde::de::DeserializeOwned,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(bad_request("request body is required"));
    }
    parse_body(body)
}

fn parse_body<T>(body: &Bytes) -> ApiResult<T>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_slice(body).map_err(|err| bad_request(format!("invalid JSON body: {err}")))
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn verify(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Json<VerifyResponse>> {
    let request: VerifyRequest = required_body(&body)?;
    let result = state
        .controller
        .verify(request.into_bundle())
        .await
        .map_err(api_error)?;
    Ok(Json(result.into()))
}

pub async fn start_session(
    State(state): State<Arc<AppState>>,
    Path(class_id): Path<String>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<SessionInfo>)> {
    let options: SessionOptions = optional_body(&body)?;
    let (session, codes) = state
        .controller
        .sessions()
        .start_session(&class_id, options)
        .await
        .map_err(api_error)?;

    Ok((
        StatusCode::CREATED,
        Json(SessionInfo {
            session_id: session.id,
            class_id: session.class_id,
            otp_count: codes.len(),
            expires_at: session.expires_at,
        }),
    ))
}

pub async fn get_otp(
    State(state): State<Arc<AppState>>,
    Path((session_id, student_id)): Path<(String, String)>,
) -> ApiResult<Json<OtpResponse>> {
    let issued = state
        .controller
        .sessions()
        .issue_or_fetch_code(&session_id, &student_id)
        .await
        .map_err(api_error)?;
    Ok(Json(OtpResponse {
        otp: issued.code,
        remaining_seconds: issued.remaining_seconds,
    }))
}

pub async fn resend_otp(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Json<ResendResponse>> {
    let request: ResendRequest = required_body(&body)?;
    let resent = state
        .controller
        .sessions()
        .resend_code(&request.session_id, &request.student_id)
        .await
        .map_err(api_error)?;
    Ok(Json(ResendResponse {
        otp: resent.code,
        attempts_remaining: resent.attempts_remaining,
    }))
}

pub async fn lock_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<StatusResponse>> {
    let request: LockRequest = optional_body(&body)?;
    let reason = request
        .reason
        .filter(|reason| !reason.trim().is_empty())
        .unwrap_or_else(|| "locked by instructor".to_string());

    state
        .controller
        .sessions()
        .lock_session(&session_id, &reason)
        .await
        .map_err(api_error)?;
    Ok(Json(StatusResponse::ok(format!("session {session_id} locked"))))
}

pub async fn unlock_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    state
        .controller
        .sessions()
        .unlock_session(&session_id)
        .await
        .map_err(api_error)?;
    Ok(Json(StatusResponse::ok(format!("session {session_id} unlocked"))))
}

pub async fn unlock_student(
    State(state): State<Arc<AppState>>,
    Path(student_id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    let unlocked = state
        .controller
        .tracker()
        .unlock_account(&student_id)
        .await
        .map_err(api_error)?;

    let message = if unlocked {
        format!("account {student_id} unlocked")
    } else {
        format!("account {student_id} was not locked")
    };
    Ok(Json(StatusResponse::ok(message)))
}

/// Lists anomalies for a session or a student, or the unreviewed queue when
/// neither filter is given.
pub async fn list_anomalies(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnomalyQuery>,
) -> ApiResult<Json<Vec<AnomalyRecord>>> {
    let tracker = state.controller.tracker();
    let records = match (query.session_id, query.student_id) {
        (Some(session_id), _) => tracker.for_session(&session_id).await,
        (None, Some(student_id)) => tracker.for_student(&student_id).await,
        (None, None) => {
            let limit = query
                .limit
                .unwrap_or(DEFAULT_ANOMALY_LIMIT)
                .clamp(1, MAX_ANOMALY_LIMIT);
            tracker.unreviewed(limit).await
        }
    }
    .map_err(api_error)?;
    Ok(Json(records))
}

pub async fn review_anomaly(
    State(state): State<Arc<AppState>>,
    Path(anomaly_id): Path<i64>,
    body: Bytes,
) -> ApiResult<Json<AnomalyRecord>> {
    let request: ReviewRequest = required_body(&body)?;
    let reviewer = request.reviewer.trim();
    if reviewer.is_empty() {
        return Err(bad_request("reviewer is required"));
    }

    let record = state
        .controller
        .tracker()
        .mark_reviewed(anomaly_id, reviewer)
        .await
        .map_err(api_error)?;
    Ok(Json(record))
}

pub async fn enroll_student(
    State(state): State<Arc<AppState>>,
    Path(class_id): Path<String>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<StatusResponse>)> {
    let request: EnrollRequest = required_body(&body)?;
    let student_id = request.student_id.trim();
    if student_id.is_empty() || class_id.trim().is_empty() {
        return Err(bad_request("class_id and student_id are required"));
    }

    let created = state
        .controller
        .sessions()
        .enroll_student(&class_id, student_id)
        .await
        .map_err(api_error)?;

    if created {
        Ok((
            StatusCode::CREATED,
            Json(StatusResponse::ok(format!("{student_id} enrolled in {class_id}"))),
        ))
    } else {
        Ok((
            StatusCode::OK,
            Json(StatusResponse::ok(format!("{student_id} already enrolled in {class_id}"))),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::{
        anomaly::AnomalyTracker,
        db::Database,
        otp::SessionManager,
        scoring::FaceMatcher,
        settings::Settings,
        utils::{Clock, ManualClock},
        validation::tests::png_frame,
    };

    fn json_body(value: serde_json::Value) -> Bytes {
        Bytes::from(value.to_string())
    }

    struct FixedMatcher(f64);

    #[async_trait]
    impl FaceMatcher for FixedMatcher {
        async fn similarity(&self, _student_id: &str, _frame: &[u8]) -> Result<f64> {
            Ok(self.0)
        }
    }

    fn app_state(face: f64) -> (tempfile::TempDir, Arc<AppState>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("api.sqlite3")).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let settings = Settings::default();

        let sessions = SessionManager::new(db.clone(), settings.otp.clone(), clock.clone());
        let tracker = AnomalyTracker::new(
            db,
            settings.anomaly.clone(),
            &settings.scoring,
            clock.clone(),
        );
        let controller = VerificationController::new(
            sessions,
            tracker,
            Arc::new(FixedMatcher(face)),
            settings,
            clock,
        );
        (dir, Arc::new(AppState { controller }))
    }

    async fn enrolled_session(state: &Arc<AppState>, student: &str) -> String {
        enroll_student(
            State(state.clone()),
            Path("cs101".into()),
            json_body(json!({ "student_id": student })),
        )
        .await
        .unwrap();

        let (status, Json(info)) =
            start_session(State(state.clone()), Path("cs101".into()), Bytes::new())
                .await
                .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(info.otp_count, 1);
        info.session_id
    }

    #[test]
    fn error_statuses_follow_error_class() {
        assert_eq!(
            status_for(&VerifyError::InvalidEvidence(Vec::new())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&VerifyError::SessionNotFound("s".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&VerifyError::ResendLimitExceeded),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(status_for(&VerifyError::CodeAlreadyConsumed), StatusCode::CONFLICT);
        assert_eq!(status_for(&VerifyError::AccountLocked), StatusCode::LOCKED);
        assert_eq!(
            status_for(&VerifyError::VerificationTimeout),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&VerifyError::FaceModelUnavailable("down".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn starting_a_session_for_an_empty_class_is_not_found() {
        let (_dir, state) = app_state(0.9);
        let (status, Json(body)) =
            start_session(State(state), Path("ghost".into()), Bytes::new())
                .await
                .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.error, "class_not_found");
    }

    #[tokio::test]
    async fn malformed_session_options_are_rejected() {
        let (_dir, state) = app_state(0.9);
        let (status, _) = start_session(
            State(state),
            Path("cs101".into()),
            Bytes::from_static(b"{not json"),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn verify_round_trip_through_handlers() {
        let (_dir, state) = app_state(0.9);
        let session_id = enrolled_session(&state, "ana").await;

        let Json(otp) = get_otp(
            State(state.clone()),
            Path((session_id.clone(), "ana".into())),
        )
        .await
        .unwrap();
        assert_eq!(otp.otp.len(), 6);

        let request = json_body(json!({
            "student_id": "ana",
            "session_id": session_id,
            "otp": otp.otp,
            "face_image": png_frame(),
        }));
        let Json(response) = verify(State(state.clone()), request.clone())
            .await
            .unwrap();
        assert!(response.success);
        assert!(response.factors.otp_verified);
        assert!(response.factors.face_verified);
        assert!(response.factors.ble_verified.is_none());
        assert!(response.attendance_id.is_some());

        let (status, Json(body)) = verify(State(state), request).await.unwrap_err();
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.error, "code_already_consumed");
    }

    #[tokio::test]
    async fn invalid_bundle_lists_reasons() {
        let (_dir, state) = app_state(0.9);
        let (status, Json(body)) = verify(State(state), json_body(json!({})))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error, "invalid_evidence");
        assert!(!body.reasons.is_empty());
    }

    #[tokio::test]
    async fn resend_limit_maps_to_too_many_requests() {
        let (_dir, state) = app_state(0.9);
        let session_id = enrolled_session(&state, "ana").await;
        let request = json_body(json!({ "session_id": session_id, "student_id": "ana" }));

        for remaining in [1, 0] {
            let Json(resent) = resend_otp(State(state.clone()), request.clone())
                .await
                .unwrap();
            assert_eq!(resent.attempts_remaining, remaining);
        }
        let (status, _) = resend_otp(State(state), request).await.unwrap_err();
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn locked_session_refuses_codes() {
        let (_dir, state) = app_state(0.9);
        let session_id = enrolled_session(&state, "ana").await;

        lock_session(State(state.clone()), Path(session_id.clone()), Bytes::new())
            .await
            .unwrap();
        let (status, Json(body)) = get_otp(
            State(state.clone()),
            Path((session_id.clone(), "ana".into())),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::LOCKED);
        assert_eq!(body.error, "session_locked");

        unlock_session(State(state.clone()), Path(session_id.clone()))
            .await
            .unwrap();
        assert!(get_otp(State(state), Path((session_id, "ana".into())))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn review_requires_reviewer_and_existing_anomaly() {
        let (_dir, state) = app_state(0.9);
        let (status, _) = review_anomaly(
            State(state.clone()),
            Path(1),
            json_body(json!({ "reviewer": "  " })),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, Json(body)) = review_anomaly(
            State(state),
            Path(42),
            json_body(json!({ "reviewer": "dean" })),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.error, "anomaly_not_found");
    }

    #[tokio::test]
    async fn failed_verification_shows_up_in_anomaly_queue() {
        let (_dir, state) = app_state(0.2);
        let session_id = enrolled_session(&state, "ana").await;
        let Json(otp) = get_otp(
            State(state.clone()),
            Path((session_id.clone(), "ana".into())),
        )
        .await
        .unwrap();

        let Json(response) = verify(
            State(state.clone()),
            json_body(json!({
                "student_id": "ana",
                "session_id": session_id,
                "otp": otp.otp,
                "face_image": png_frame(),
            })),
        )
        .await
        .unwrap();
        assert!(!response.success);
        assert!(response.attendance_id.is_none());

        let Json(queue) = list_anomalies(State(state.clone()), Query(AnomalyQuery::default()))
            .await
            .unwrap();
        assert!(queue
            .iter()
            .any(|record| record.anomaly_type == crate::db::models::AnomalyType::ProxyAttempt));

        let Json(for_session) = list_anomalies(
            State(state),
            Query(AnomalyQuery {
                session_id: Some(session_id),
                ..AnomalyQuery::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(for_session.len(), queue.len());
    }

    #[tokio::test]
    async fn unlocking_an_unlocked_student_is_harmless() {
        let (_dir, state) = app_state(0.9);
        let Json(body) = unlock_student(State(state), Path("ana".into()))
            .await
            .unwrap();
        assert!(body.message.contains("was not locked"));
    }

    #[tokio::test]
    async fn malformed_or_missing_bodies_are_bad_requests() {
        let (_dir, state) = app_state(0.9);

        let (status, Json(body)) = verify(
            State(state.clone()),
            json_body(json!({ "ble_rssi": "strong" })),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error, "invalid_request");

        let (status, Json(body)) = resend_otp(State(state.clone()), json_body(json!({})))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error, "invalid_request");

        let (status, Json(body)) =
            enroll_student(State(state.clone()), Path("cs101".into()), Bytes::new())
                .await
                .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.message, "request body is required");

        let (status, _) = review_anomaly(State(state), Path(1), Bytes::from_static(b"[1, 2"))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn router_answers_bad_json_with_an_error_body() {
        let (_dir, state) = app_state(0.9);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, crate::api::router(state)).await.unwrap();
        });

        let response = reqwest::Client::new()
            .post(format!("http://{addr}/verify"))
            .header("content-type", "application/json")
            .body(r#"{"student_id": "ana", "ble_rssi": "strong"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.starts_with("application/json"));

        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"], "invalid_request");
        assert!(body["message"].as_str().unwrap().contains("invalid JSON body"));

        server.abort();
    }
}
