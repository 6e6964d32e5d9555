#![allow(dead_code)]

use std::{io::Cursor, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use rollcall_lib::{
    anomaly::AnomalyTracker,
    db::{models::SessionOptions, Database},
    evidence::EvidenceBundle,
    otp::SessionManager,
    scoring::FaceMatcher,
    settings::Settings,
    utils::{Clock, ManualClock},
    verify::VerificationController,
};

/// Face model stand-in that always answers with the same similarity,
/// optionally after a delay.
pub struct FixedFace {
    pub similarity: f64,
    pub delay: Duration,
}

#[async_trait]
impl FaceMatcher for FixedFace {
    async fn similarity(&self, _student_id: &str, _frame: &[u8]) -> Result<f64> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.similarity)
    }
}

pub struct Harness {
    pub _dir: tempfile::TempDir,
    pub db: Database,
    pub clock: Arc<ManualClock>,
    pub controller: VerificationController,
}

impl Harness {
    pub fn new(similarity: f64) -> Self {
        Self::with(similarity, Duration::ZERO, Settings::default())
    }

    pub fn with(similarity: f64, delay: Duration, settings: Settings) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("rollcall.sqlite3")).unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let shared: Arc<dyn Clock> = clock.clone();

        let sessions = SessionManager::new(db.clone(), settings.otp.clone(), shared.clone());
        let tracker = AnomalyTracker::new(
            db.clone(),
            settings.anomaly.clone(),
            &settings.scoring,
            shared.clone(),
        );
        let controller = VerificationController::new(
            sessions,
            tracker,
            Arc::new(FixedFace { similarity, delay }),
            settings,
            shared,
        );

        Self {
            _dir: dir,
            db,
            clock,
            controller,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        self.controller.sessions()
    }

    /// Enrolls `students` in `class_id` and starts a session for it.
    pub async fn open_session(
        &self,
        class_id: &str,
        students: &[&str],
        options: SessionOptions,
    ) -> String {
        for student in students {
            self.sessions().enroll_student(class_id, student).await.unwrap();
        }
        let (session, codes) = self
            .sessions()
            .start_session(class_id, options)
            .await
            .unwrap();
        assert_eq!(codes.len(), students.len());
        session.id
    }

    pub async fn code_for(&self, session_id: &str, student_id: &str) -> String {
        self.sessions()
            .issue_or_fetch_code(session_id, student_id)
            .await
            .unwrap()
            .code
    }
}

pub fn png_frame() -> String {
    let img = image::GrayImage::from_fn(16, 16, |x, y| {
        image::Luma([if (x + y) % 2 == 0 { 40 } else { 220 }])
    });
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    STANDARD.encode(bytes)
}

pub fn bundle(session_id: &str, student_id: &str, code: &str) -> EvidenceBundle {
    EvidenceBundle {
        session_id: session_id.into(),
        student_id: student_id.into(),
        code: code.into(),
        face_image: png_frame(),
        ..EvidenceBundle::default()
    }
}
