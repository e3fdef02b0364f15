//! Background maintenance: a single periodic task that reaps expired
//! entries and refreshes aggregate metrics, grounded in the teacher's
//! `start_health_check_task` shape (a `tokio::spawn`'d loop over
//! `tokio::time::interval`).

use std::sync::Arc;
use std::time::Duration;

use cache_storage::StorageBackend;
use cache_tier::Sweepable;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, instrument};

/// Owns the single background maintenance task for a [`crate::context::FabricContext`].
///
/// Only one instance is ever spawned per context; dropping the handle
/// (or calling [`Self::stop`]) aborts the loop.
#[derive(Debug)]
pub struct BackgroundMaintenance {
    handle: JoinHandle<()>,
}

impl BackgroundMaintenance {
    /// Spawns the maintenance loop at `interval_period`.
    ///
    /// Each tick walks `tier`'s in-process entries and drops those with
    /// `now >= expires_at` (§4.7 step 1, §4.2.3's eager eviction path),
    /// then reaps `storage`'s expired cache metadata and refreshes
    /// aggregate metrics (§4.7 steps 2-3).
    #[must_use]
    pub fn spawn(
        storage: Arc<dyn StorageBackend>,
        tier: Arc<dyn Sweepable>,
        interval_period: Duration,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = interval(interval_period);
            loop {
                ticker.tick().await;
                if let Err(e) = run_sweep(&storage, &tier).await {
                    error!(error = %e, "background maintenance sweep failed");
                }
            }
        });
        Self { handle }
    }

    /// Aborts the background loop. Safe to call more than once.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for BackgroundMaintenance {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[instrument(skip(storage, tier))]
async fn run_sweep(
    storage: &Arc<dyn StorageBackend>,
    tier: &Arc<dyn Sweepable>,
) -> cache_core::error::Result<()> {
    let evicted = tier.sweep_expired().await;
    let reaped = storage.reap_expired_cache().await?;
    let stats = storage.stats().await?;
    info!(
        evicted,
        reaped,
        live_entries = stats.live_entries,
        bar_rows = stats.bar_rows,
        "background maintenance sweep complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_storage::InMemoryBackend;
    use cache_tier::CacheTierManager;

    #[tokio::test]
    async fn spawns_and_stops_without_panicking() {
        let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        let tier: Arc<dyn Sweepable> = Arc::new(CacheTierManager::<u32>::new(storage.clone(), 100));
        let maintenance = BackgroundMaintenance::spawn(storage, tier, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(35)).await;
        maintenance.stop();
    }

    #[tokio::test]
    async fn tick_eagerly_reaps_an_expired_in_process_entry_without_an_access() {
        let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        let manager: Arc<CacheTierManager<u32>> =
            Arc::new(CacheTierManager::new(storage.clone(), 100));
        manager
            .set("k", 1, Duration::from_millis(5), cache_core::types::DataType::Analysis)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let tier: Arc<dyn Sweepable> = manager.clone();
        let maintenance = BackgroundMaintenance::spawn(storage, tier, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(40)).await;
        maintenance.stop();

        assert!(manager.stats().evictions >= 1);
    }
}
