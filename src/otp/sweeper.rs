use tokio::{
    task::JoinHandle,
    time::{Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use super::manager::SessionManager;

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info};

/// Periodically materializes expired codes and archives finished sessions.
pub async fn archive_loop(manager: SessionManager, every: Duration, cancel_token: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = manager.archive_expired_sessions().await {
                    log_error!("session archival sweep failed: {err}");
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("archival sweeper shutting down");
                break;
            }
        }
    }
}

pub struct ArchiveSweeper {
    handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

impl ArchiveSweeper {
    pub fn spawn(manager: SessionManager, every: Duration) -> Self {
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(archive_loop(manager, every, cancel_token.clone()));
        Self {
            handle,
            cancel_token,
        }
    }

    pub async fn stop(self) {
        self.cancel_token.cancel();
        if let Err(err) = self.handle.await {
            log_error!("archival sweeper failed to join: {err}");
        }
    }
}
