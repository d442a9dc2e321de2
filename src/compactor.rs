use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::observability::WAL_COMPACTIONS_TOTAL;
use crate::store::Store;

/// Background task that rewrites the WAL once `threshold` appends have
/// accumulated since the last compaction.
pub async fn run_compactor(store: Arc<Store>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}

/// One compactor pass. Returns whether a compaction ran.
pub async fn compact_if_due(store: &Arc<Store>, threshold: u64) -> bool {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match store.compact().await {
        Ok(()) => {
            metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
            info!(appends, "WAL compacted");
            true
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            false
        }
    }
}
