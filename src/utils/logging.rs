//! Conditional logging macros gated by a module-level `ENABLE_LOGS` flag,
//! plus redaction helpers for values that must never reach the log in clear.
//!
//! Usage:
//! ```rust,ignore
//! const ENABLE_LOGS: bool = true;
//!
//! use crate::{log_info, log_warn};
//!
//! log_info!("session {} opened", session_id);
//! ```

/// Info log that only fires when the calling module sets `ENABLE_LOGS`.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

/// Warn log that only fires when the calling module sets `ENABLE_LOGS`.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

/// Error log that only fires when the calling module sets `ENABLE_LOGS`.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}

/// Masks every digit of a one-time code except the last one.
pub fn mask_code(code: &str) -> String {
    let len = code.chars().count();
    code.chars()
        .enumerate()
        .map(|(idx, ch)| if idx + 1 == len { ch } else { '*' })
        .collect()
}
