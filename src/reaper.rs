use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::MIN_SWEEP_INTERVAL_MS;
use crate::engine::Engine;

/// Background task that expires idle carts and unpaid waitlist promotions.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let every = every.max(Duration::from_millis(MIN_SWEEP_INTERVAL_MS));
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep_once(&engine).await;
    }
}

/// One sweep over the tenant. Returns how many rows were expired.
pub async fn sweep_once(engine: &Engine) -> usize {
    let mut expired = 0;
    for cart_id in engine.stale_carts() {
        match engine.expire_cart(cart_id).await {
            Ok(true) => expired += 1,
            Ok(false) => {}
            // Raced with a checkout or cancel; nothing left to do.
            Err(e) => debug!("reaper skip cart {cart_id}: {e}"),
        }
    }
    for entry_id in engine.lapsed_promotions() {
        match engine.expire_promotion(entry_id).await {
            Ok(true) => expired += 1,
            Ok(false) => {}
            Err(e) => debug!("reaper skip waitlist entry {entry_id}: {e}"),
        }
    }
    if expired > 0 {
        info!(expired, "sweep finished");
    }
    expired
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        if engine.wal_appends_since_compact().await < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("WAL compacted"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
