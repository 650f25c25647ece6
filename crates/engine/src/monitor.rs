use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, info};

use crate::service::WalletService;
use quorum_types::Result;

/// Periodically confirms broadcast proposals once their transaction is mined.
pub struct ConfirmationMonitor {
    service: Arc<WalletService>,
    poll_interval: Duration,
}

impl ConfirmationMonitor {
    pub fn new(service: Arc<WalletService>, poll_interval: Duration) -> Self {
        Self {
            service,
            poll_interval,
        }
    }

    /// Start the polling loop. Never returns unless the task is cancelled.
    pub async fn run(self) -> Result<()> {
        info!(
            "Confirmation monitor started poll_interval_secs={}",
            self.poll_interval.as_secs()
        );

        let mut interval = time::interval(self.poll_interval);
        loop {
            interval.tick().await;
            match self.run_once().await {
                Ok(0) => debug!("Confirmation cycle found nothing new"),
                Ok(confirmed) => info!("Confirmation cycle completed confirmed={}", confirmed),
                Err(e) => error!("Confirmation cycle failed: {}", e),
            }
        }
    }

    /// One pass over every wallet with broadcast proposals.
    ///
    /// A failing wallet is logged and skipped; the others are still checked.
    pub async fn run_once(&self) -> Result<usize> {
        let wallet_ids = self.service.wallets_awaiting_confirmation().await?;
        let mut confirmed = 0;

        for wallet_id in wallet_ids {
            match self.service.refresh_confirmations(&wallet_id).await {
                Ok(count) => confirmed += count,
                Err(e) => error!(
                    "Failed to refresh confirmations wallet_id={}: {}",
                    wallet_id, e
                ),
            }
        }
        Ok(confirmed)
    }
}
