//! Expiry reaper.
//!
//! A background task that periodically lists every upload in the metadata
//! store and removes incomplete uploads whose last activity is older than
//! the configured TTL. Failures are logged and the schedule continues.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use metrics::counter;
use tracing::{debug, info, warn};

use crate::engine::UploadEngine;
use crate::metrics::UPLOADS_REAPED_TOTAL;

pub struct ExpiryReaper {
    engine: Arc<UploadEngine>,
    interval: Duration,
}

impl ExpiryReaper {
    pub fn new(engine: Arc<UploadEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// One sweep as of `now`. Returns how many uploads were removed.
    pub async fn sweep_at(&self, now: SystemTime) -> anyhow::Result<usize> {
        let ids = self.engine.metadata().list().await?;
        let mut reaped = 0;
        for id in &ids {
            match self.engine.reap_if_expired(id, now).await {
                Ok(true) => reaped += 1,
                Ok(false) => {}
                Err(e) => warn!(id = %id, error = %e, "failed to reap upload"),
            }
        }
        if reaped > 0 {
            counter!(UPLOADS_REAPED_TOTAL).increment(reaped as u64);
        }
        debug!(scanned = ids.len(), reaped, "expiry sweep complete");
        Ok(reaped)
    }

    pub async fn sweep(&self) -> anyhow::Result<usize> {
        self.sweep_at(SystemTime::now()).await
    }

    /// Run sweeps forever on a fixed interval. The first sweep happens
    /// immediately, which also clears leftovers from before a restart.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match self.sweep().await {
                    Ok(0) => {}
                    Ok(reaped) => info!(reaped, "removed expired uploads"),
                    Err(e) => warn!(error = %e, "expiry sweep failed"),
                }
            }
        })
    }
}
