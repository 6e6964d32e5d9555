use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, sync::RwLock, time::Duration};

use crate::{anomaly::AnomalyConfig, fusion::FusionDefaults, scoring::ScoringConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OtpSettings {
    /// Number of digits in every issued code.
    pub code_length: usize,
    pub ttl_secs: u64,
    pub max_resends: u32,
    /// How long a session accepts verifications after it is started.
    pub session_window_secs: u64,
    pub archive_sweep_secs: u64,
}

impl Default for OtpSettings {
    fn default() -> Self {
        Self {
            code_length: 6,
            ttl_secs: 60,
            max_resends: 2,
            session_window_secs: 600,
            archive_sweep_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    pub max_gps_accuracy_m: f64,
    pub min_motion_samples: usize,
    pub min_rssi_dbm: f64,
    pub max_rssi_dbm: f64,
    pub min_pressure_hpa: f64,
    pub max_pressure_hpa: f64,
    /// Mean luma band a usable face frame must fall in.
    pub min_brightness: f64,
    pub max_brightness: f64,
    /// Minimum luma standard deviation.
    pub min_contrast: f64,
    /// Minimum variance of the Laplacian response.
    pub min_sharpness: f64,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            max_gps_accuracy_m: 200.0,
            min_motion_samples: 50,
            min_rssi_dbm: -100.0,
            max_rssi_dbm: 0.0,
            min_pressure_hpa: 900.0,
            max_pressure_hpa: 1100.0,
            min_brightness: 40.0,
            max_brightness: 220.0,
            min_contrast: 30.0,
            min_sharpness: 50.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationSettings {
    /// Upper bound on the scoring phase, face model call included.
    pub timeout_ms: u64,
    pub face_retries: u32,
    pub face_retry_backoff_ms: u64,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            face_retries: 2,
            face_retry_backoff_ms: 200,
        }
    }
}

impl VerificationSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.face_retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_addr: String,
    pub database_path: PathBuf,
    /// Endpoint of the face-similarity model service.
    pub face_model_url: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".into(),
            database_path: PathBuf::from("rollcall.sqlite3"),
            face_model_url: "http://127.0.0.1:8500/similarity".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub otp: OtpSettings,
    pub validation: ValidationSettings,
    pub scoring: ScoringConfig,
    pub fusion: FusionDefaults,
    pub anomaly: AnomalyConfig,
    pub verification: VerificationSettings,
    pub server: ServerSettings,
}

impl Settings {
    /// Environment overrides for the values operators change most often.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("ROLLCALL_BIND_ADDR") {
            self.server.bind_addr = addr;
        }
        if let Ok(path) = std::env::var("ROLLCALL_DB_PATH") {
            self.server.database_path = PathBuf::from(path);
        }
        if let Ok(url) = std::env::var("ROLLCALL_FACE_MODEL_URL") {
            self.server.face_model_url = url;
        }
        if let Some(ttl) = env_u64("ROLLCALL_OTP_TTL_SECS") {
            self.otp.ttl_secs = ttl;
        }
        if let Some(timeout) = env_u64("ROLLCALL_VERIFY_TIMEOUT_MS") {
            self.verification.timeout_ms = timeout;
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("Ignoring {key}={raw}: {err}");
            None
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<Settings>,
}

impl SettingsStore {
    /// Loads settings from `path`, writing the defaults there on first run.
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Invalid settings file {}", path.display()))?
        } else {
            let defaults = Settings::default();
            persist(&path, &defaults)?;
            defaults
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn snapshot(&self) -> Settings {
        match self.data.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn reload(&self) -> Result<()> {
        let contents = fs::read_to_string(&self.path)?;
        let data: Settings = serde_json::from_str(&contents)?;
        let mut guard = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = data;
        Ok(())
    }
}

fn persist(path: &PathBuf, data: &Settings) -> Result<()> {
    let serialized = serde_json::to_string_pretty(data)?;
    fs::write(path, serialized)
        .with_context(|| format!("Failed to write settings to {}", path.display()))
}
