//! Sync queue draining and periodic maintenance.

use std::time::Instant;
use tracing::{debug, info};

use crate::key::StorageKey;
use crate::resilience::sync_queue::DrainReport;

use super::{DataHandler, HandlerError};

impl DataHandler {
    /// Deliver every queued write now, ignoring debounce and backoff.
    ///
    /// Keeps draining until the queue is empty or a pass stops making
    /// progress (breaker rejection or a failed delivery); whatever is left
    /// stays queued for the background worker.
    #[tracing::instrument(skip(self))]
    pub async fn flush(&self) -> Result<DrainReport, HandlerError> {
        self.tracker
            .track("sync", async {
                self.ensure_open()?;
                let start = Instant::now();
                let mut report = DrainReport::default();
                loop {
                    let pass = self.drain_pass(true).await;
                    let progressing = !pass.delivered.is_empty()
                        && pass.retried == 0
                        && pass.dead_lettered == 0
                        && pass.rejected == 0;
                    report.merge(pass);
                    if !progressing {
                        break;
                    }
                }
                crate::metrics::record_flush_duration(start.elapsed());
                info!(
                    delivered = report.delivered.len(),
                    retried = report.retried,
                    rejected = report.rejected,
                    "Flush complete"
                );
                Ok(report)
            })
            .await
    }

    /// One worker tick: deliver due items, then drop expired cache entries.
    pub(super) async fn sync_tick(&self) {
        let start = Instant::now();
        let report = self.drain_pass(false).await;
        if report.attempted() > 0 {
            crate::metrics::record_flush_duration(start.elapsed());
        }

        let expired = self.cache.purge_expired();
        if expired > 0 {
            debug!(expired, "Expired cache entries purged");
        }
    }

    /// Single batch through the breaker. Cache entries whose writes all
    /// reached the remote are marked clean.
    pub(super) async fn drain_pass(&self, force: bool) -> DrainReport {
        let report = self
            .queue
            .drain_to(
                self.remote.as_ref(),
                &self.breaker,
                self.config.remote_timeout(),
                self.config.sync_batch_size,
                force,
            )
            .await;
        self.mark_synced(&report.delivered).await;
        report
    }

    async fn mark_synced(&self, delivered: &[StorageKey]) {
        for key in delivered {
            if !self.queue.has_unsynced(key).await {
                self.cache.mark_clean(key);
            }
        }
    }
}
