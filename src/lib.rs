pub mod anomaly;
pub mod api;
pub mod db;
pub mod error;
pub mod evidence;
pub mod fusion;
pub mod otp;
pub mod scoring;
pub mod settings;
pub mod utils;
pub mod validation;
pub mod verify;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use log::{info, warn};

use anomaly::AnomalyTracker;
use api::AppState;
use db::Database;
use otp::{ArchiveSweeper, SessionManager};
use scoring::HttpFaceMatcher;
use settings::SettingsStore;
use utils::{Clock, SystemClock};
use verify::VerificationController;

const DEFAULT_SETTINGS_PATH: &str = "rollcall.settings.json";

/// Boots the service and serves until ctrl-c.
pub async fn run() -> anyhow::Result<()> {
    // Reads RUST_LOG when set
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("Rollcall starting up...");

    let settings_path = std::env::var("ROLLCALL_SETTINGS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_SETTINGS_PATH));
    let store = SettingsStore::new(settings_path)?;
    let mut settings = store.snapshot();
    settings.apply_env_overrides();

    let database = Database::new(settings.server.database_path.clone())?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let sessions = SessionManager::new(database.clone(), settings.otp.clone(), clock.clone());
    let tracker = AnomalyTracker::new(
        database,
        settings.anomaly.clone(),
        &settings.scoring,
        clock.clone(),
    );
    let face = HttpFaceMatcher::new(
        settings.server.face_model_url.clone(),
        settings.verification.timeout(),
    )?;

    // Sessions that ran out while the service was down.
    match sessions.archive_expired_sessions().await {
        Ok(archived) if !archived.is_empty() => {
            warn!("Archived {} session(s) left open by a previous run", archived.len());
        }
        Ok(_) => {}
        Err(err) => warn!("Startup archival pass failed: {err}"),
    }

    let sweeper = ArchiveSweeper::spawn(
        sessions.clone(),
        Duration::from_secs(settings.otp.archive_sweep_secs.max(1)),
    );

    let bind_addr = settings.server.bind_addr.clone();
    let controller =
        VerificationController::new(sessions, tracker, Arc::new(face), settings, clock);
    let app = api::router(Arc::new(AppState { controller }));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!("Listening on {bind_addr}");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed");

    sweeper.stop().await;
    info!("Rollcall stopped");
    served
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {err}");
    }
}
