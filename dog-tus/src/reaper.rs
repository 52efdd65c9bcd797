use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::{ResumableUploads, TusCoordinator, TusResult};

/// Background sweep that destroys sessions past their deadline
pub struct ExpirationReaper {
    coordinator: TusCoordinator,
    interval: Duration,
}

impl ExpirationReaper {
    /// Reaper ticking at the coordinator's configured interval
    pub fn new(coordinator: TusCoordinator) -> Self {
        let interval = coordinator.config().reaper_interval;
        Self { coordinator, interval }
    }

    pub fn with_interval(coordinator: TusCoordinator, interval: Duration) -> Self {
        Self { coordinator, interval }
    }

    /// Run forever
    pub async fn start(self) {
        let mut ticker = interval(self.interval);

        info!("Starting upload expiration reaper with interval: {:?}", self.interval);

        loop {
            ticker.tick().await;

            match self.reap_expired(Utc::now()).await {
                Ok(0) => debug!("No expired uploads found"),
                Ok(count) => info!("Expired {} uploads", count),
                Err(e) => warn!("Error during upload expiration: {}", e),
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.start())
    }

    /// Run one sweep (for testing)
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> TusResult<usize> {
        let mut expired = 0;
        for key in self.coordinator.expired_keys(now).await? {
            debug!("Expiring upload: {}", key);
            match self.coordinator.expire(&key, now).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => warn!(key = %key, error = %e, "Failed to expire upload"),
            }
        }
        Ok(expired)
    }
}
