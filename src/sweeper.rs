use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::booking::Bookings;
use crate::observability;
use crate::store::{MemoryStore, Store};

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the WAL once enough commits have piled up
/// since the last compaction. A threshold of 0 disables it.
pub async fn run_compactor(store: MemoryStore, threshold: u64) {
    if threshold == 0 {
        return;
    }
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let appends = store.appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact().await {
            Ok(()) => info!("compacted WAL after {appends} commits"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}

/// Background task that completes reservations whose end time has passed,
/// in the server's local wall-clock time.
pub async fn run_sweeper<S: Store>(bookings: Arc<Bookings<S>>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        sweep_once(&bookings, Local::now().naive_local()).await;
    }
}

pub async fn sweep_once<S: Store>(bookings: &Bookings<S>, now: NaiveDateTime) -> usize {
    match bookings.sweep_finished(now).await {
        Ok(0) => 0,
        Ok(n) => {
            metrics::counter!(observability::SWEEP_COMPLETED_TOTAL).increment(n as u64);
            info!("completed {n} finished reservation(s)");
            n
        }
        Err(e) => {
            tracing::warn!("sweep failed: {e}");
            0
        }
    }
}
