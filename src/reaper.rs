use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::engine::{now_ms, Engine};
use crate::observability;

/// Background task that periodically cancels pending reservations whose
/// confirmation grace period has lapsed.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        let cancelled = engine.cancel_expired_pending(now_ms()).await;
        for id in &cancelled {
            info!("cancelled expired pending reservation {id}");
        }
        if !cancelled.is_empty() {
            metrics::counter!(observability::EXPIRED_CANCELLED_TOTAL)
                .increment(cancelled.len() as u64);
        }
    }
}

/// Background task that rewrites the WAL once enough appends have
/// accumulated since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}
