//! Background eviction.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::policy::EvictionPolicy;
use crate::store::DiskCache;

/// Run [`DiskCache::sweep`] every `interval` until `cancel` fires.
///
/// The first sweep runs one interval after spawning.
pub fn spawn_sweeper(
    cache: DiskCache,
    policy: EvictionPolicy,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let interval = interval.max(Duration::from_millis(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("cache sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match cache.sweep(&policy).await {
                        Ok(report) if report.removed() > 0 || report.temp_files_removed > 0 => {
                            info!(
                                removed = report.removed(),
                                temp_files_removed = report.temp_files_removed,
                                bytes_freed = report.bytes_freed,
                                remaining_entries = report.remaining_entries,
                                remaining_bytes = report.remaining_bytes,
                                "cache sweep evicted entries"
                            );
                        }
                        Ok(_) => debug!("cache sweep found nothing to evict"),
                        Err(e) => warn!(error = %e, "cache sweep failed"),
                    }
                }
            }
        }
    })
}
