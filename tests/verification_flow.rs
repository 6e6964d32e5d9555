mod common;

use std::time::Duration;

use rollcall_lib::{
    db::models::{AnomalyType, Geofence, SessionOptions},
    error::VerifyError,
    evidence::GpsFix,
    scoring::Factor,
    settings::Settings,
};

use common::{bundle, Harness};

const CLASSROOM: Geofence = Geofence {
    latitude: 37.4275,
    longitude: -122.1697,
    radius_m: 100.0,
};

fn geofenced() -> SessionOptions {
    SessionOptions {
        geofence: Some(CLASSROOM),
        ..SessionOptions::default()
    }
}

/// About 40 m due north of the classroom center.
fn nearby_fix() -> GpsFix {
    GpsFix {
        latitude: CLASSROOM.latitude + 0.00036,
        longitude: CLASSROOM.longitude,
        accuracy_m: Some(8.0),
    }
}

#[tokio::test]
async fn student_inside_geofence_is_marked_present() {
    let harness = Harness::new(0.85);
    let session_id = harness.open_session("cs101", &["ana"], geofenced()).await;
    let code = harness.code_for(&session_id, "ana").await;

    let mut evidence = bundle(&session_id, "ana", &code);
    evidence.gps = Some(nearby_fix());

    let result = harness.controller.verify(evidence).await.unwrap();
    assert!(result.success, "{}", result.message);
    assert!(result.passed(Factor::Otp));
    assert!(result.passed(Factor::Face));
    assert!(result.passed(Factor::Geofence));
    let distance = result.metric(Factor::Geofence).unwrap();
    assert!((35.0..45.0).contains(&distance), "distance {distance}");
    assert!(!result.factor(Factor::Ble).unwrap().available);

    let record = harness
        .db
        .get_attendance(&session_id, "ana")
        .await
        .unwrap()
        .expect("attendance row");
    assert_eq!(Some(record.id), result.attendance_id);
    assert_eq!(record.face_confidence, Some(0.85));

    let replay = harness
        .controller
        .verify(bundle(&session_id, "ana", &code))
        .await
        .unwrap_err();
    assert!(matches!(replay, VerifyError::CodeAlreadyConsumed));
}

#[tokio::test]
async fn student_outside_geofence_is_rejected() {
    let harness = Harness::new(0.9);
    let session_id = harness.open_session("cs101", &["ana"], geofenced()).await;
    let code = harness.code_for(&session_id, "ana").await;

    let mut evidence = bundle(&session_id, "ana", &code);
    evidence.gps = Some(GpsFix {
        latitude: CLASSROOM.latitude + 0.01,
        longitude: CLASSROOM.longitude,
        accuracy_m: Some(8.0),
    });

    let result = harness.controller.verify(evidence).await.unwrap();
    assert!(!result.success);
    assert!(!result.passed(Factor::Geofence));
    assert!(result.attendance_id.is_none());

    // The code survives a failed attempt.
    assert!(harness
        .sessions()
        .consume_code(&session_id, "ana", &code)
        .await
        .unwrap());
}

#[tokio::test]
async fn wrong_code_is_a_failed_verification() {
    let harness = Harness::new(0.9);
    let session_id = harness
        .open_session("cs101", &["ana"], SessionOptions::default())
        .await;
    let code = harness.code_for(&session_id, "ana").await;
    let wrong = if code == "000000" { "111111" } else { "000000" };

    let result = harness
        .controller
        .verify(bundle(&session_id, "ana", wrong))
        .await
        .unwrap();
    assert!(!result.success);
    assert!(!result.passed(Factor::Otp));

    let anomalies = harness.controller.tracker().for_session(&session_id).await.unwrap();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].anomaly_type, AnomalyType::VerificationFailed);
}

#[tokio::test]
async fn low_face_score_with_valid_code_is_a_proxy_attempt() {
    let harness = Harness::new(0.2);
    let session_id = harness
        .open_session("cs101", &["ana"], SessionOptions::default())
        .await;
    let code = harness.code_for(&session_id, "ana").await;

    let result = harness
        .controller
        .verify(bundle(&session_id, "ana", &code))
        .await
        .unwrap();
    assert!(!result.success);
    assert!(result.passed(Factor::Otp));
    assert!(!result.passed(Factor::Face));
    assert!(harness
        .db
        .get_attendance(&session_id, "ana")
        .await
        .unwrap()
        .is_none());

    let anomalies = harness.controller.tracker().for_student("ana").await.unwrap();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].anomaly_type, AnomalyType::ProxyAttempt);
    assert_eq!(anomalies[0].confidences.get("face"), Some(&0.2));
}

#[tokio::test]
async fn third_proxy_attempt_locks_the_account() {
    let harness = Harness::new(0.2);
    let session_id = harness
        .open_session("cs101", &["ana"], SessionOptions::default())
        .await;
    let code = harness.code_for(&session_id, "ana").await;

    for _ in 0..3 {
        let result = harness
            .controller
            .verify(bundle(&session_id, "ana", &code))
            .await
            .unwrap();
        assert!(!result.success);
    }
    assert!(harness.controller.tracker().is_locked("ana").await.unwrap());

    let err = harness
        .sessions()
        .consume_code(&session_id, "ana", &code)
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::AccountLocked));

    let err = harness
        .controller
        .verify(bundle(&session_id, "ana", &code))
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::AccountLocked));

    let kinds: Vec<_> = harness
        .controller
        .tracker()
        .for_student("ana")
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.anomaly_type)
        .collect();
    assert_eq!(
        kinds
            .iter()
            .filter(|kind| **kind == AnomalyType::ProxyAttempt)
            .count(),
        3
    );
    assert!(kinds.contains(&AnomalyType::LockoutTriggered));

    // An unlock restores access.
    assert!(harness.controller.tracker().unlock_account("ana").await.unwrap());
    assert!(harness
        .sessions()
        .consume_code(&session_id, "ana", &code)
        .await
        .unwrap());
}

#[tokio::test]
async fn invalid_bundle_changes_nothing() {
    let harness = Harness::new(0.9);
    let session_id = harness
        .open_session("cs101", &["ana"], SessionOptions::default())
        .await;
    let code = harness.code_for(&session_id, "ana").await;

    let mut evidence = bundle(&session_id, "ana", &code);
    evidence.face_image = "not-an-image".into();
    evidence.pressure_hpa = Some(-3.0);

    let err = harness.controller.verify(evidence).await.unwrap_err();
    let VerifyError::InvalidEvidence(issues) = err else {
        panic!("expected invalid evidence, got {err:?}");
    };
    assert!(issues.iter().any(|issue| issue.field == "face_image"));

    assert!(harness
        .controller
        .tracker()
        .for_session(&session_id)
        .await
        .unwrap()
        .is_empty());
    assert!(harness
        .sessions()
        .consume_code(&session_id, "ana", &code)
        .await
        .unwrap());
}

#[tokio::test]
async fn slow_face_model_times_out_without_committing() {
    let mut settings = Settings::default();
    settings.verification.timeout_ms = 100;
    let harness = Harness::with(0.95, Duration::from_secs(2), settings);
    let session_id = harness
        .open_session("cs101", &["ana"], SessionOptions::default())
        .await;
    let code = harness.code_for(&session_id, "ana").await;

    let err = harness
        .controller
        .verify(bundle(&session_id, "ana", &code))
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::VerificationTimeout));
    assert!(err.is_retryable());

    assert!(harness
        .db
        .attendance_for_session(&session_id)
        .await
        .unwrap()
        .is_empty());
    assert!(harness
        .sessions()
        .consume_code(&session_id, "ana", &code)
        .await
        .unwrap());
}

#[tokio::test]
async fn locked_session_refuses_verification() {
    let harness = Harness::new(0.9);
    let session_id = harness
        .open_session("cs101", &["ana"], SessionOptions::default())
        .await;
    let code = harness.code_for(&session_id, "ana").await;

    harness
        .sessions()
        .lock_session(&session_id, "suspicious activity")
        .await
        .unwrap();
    let err = harness
        .controller
        .verify(bundle(&session_id, "ana", &code))
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::SessionLocked));
}

#[tokio::test]
async fn replay_after_archive_or_lock_still_reads_as_consumed() {
    let harness = Harness::new(0.9);
    let session_id = harness.open_session("cs101", &["ana"], SessionOptions::default()).await;
    let code = harness.code_for(&session_id, "ana").await;

    let result = harness
        .controller
        .verify(bundle(&session_id, "ana", &code))
        .await
        .unwrap();
    assert!(result.success, "{}", result.message);

    let archived = harness.sessions().archive_expired_sessions().await.unwrap();
    assert_eq!(archived, vec![session_id.clone()]);
    let replay = harness
        .controller
        .verify(bundle(&session_id, "ana", &code))
        .await
        .unwrap_err();
    assert!(matches!(replay, VerifyError::CodeAlreadyConsumed), "{replay:?}");

    harness
        .sessions()
        .lock_session(&session_id, "instructor request")
        .await
        .unwrap();
    let replay = harness
        .controller
        .verify(bundle(&session_id, "ana", &code))
        .await
        .unwrap_err();
    assert!(matches!(replay, VerifyError::CodeAlreadyConsumed), "{replay:?}");
}

#[tokio::test]
async fn anomaly_storage_failure_does_not_change_the_verdict() {
    let harness = Harness::new(0.9);
    let session_id = harness.open_session("cs101", &["ana"], geofenced()).await;
    let code = harness.code_for(&session_id, "ana").await;

    harness
        .db
        .execute(|conn| {
            conn.execute_batch("DROP TABLE anomalies; DROP TABLE presence_fixes;")?;
            Ok(())
        })
        .await
        .unwrap();

    let mut evidence = bundle(&session_id, "ana", &code);
    evidence.gps = Some(nearby_fix());
    let result = harness.controller.verify(evidence).await.unwrap();
    assert!(result.success, "{}", result.message);
    assert!(result.attendance_id.is_some());

    let record = harness.db.get_attendance(&session_id, "ana").await.unwrap();
    assert_eq!(record.map(|r| r.id), result.attendance_id);
}
