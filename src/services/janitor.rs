//! Background cache maintenance.
//!
//! One long-running task: wake on an interval, trigger eviction when the
//! cache is close to its cap, and collect idle variant locks. Stops cleanly
//! when the shutdown channel fires.

use crate::services::cache::StreamCache;
use crate::services::coordinator::GenerationGate;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Eviction kicks in at 90% of the cap so a burst of puts does not overshoot
/// far past the limit before the next tick.
const PRESSURE_NUMERATOR: u64 = 9;
const PRESSURE_DENOMINATOR: u64 = 10;

pub fn spawn(
    cache: Arc<StreamCache>,
    gate: Arc<GenerationGate>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "cache janitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    run_once(&cache, &gate).await;
                }
                _ = shutdown.changed() => {
                    info!("cache janitor stopping");
                    break;
                }
            }
        }
    })
}

async fn run_once(cache: &StreamCache, gate: &GenerationGate) {
    let used = cache.current_bytes();
    let cap = cache.max_bytes();
    if used * PRESSURE_DENOMINATOR > cap * PRESSURE_NUMERATOR {
        let evicted = cache.evict().await;
        info!(
            used_bytes = used,
            cap_bytes = cap,
            evicted,
            remaining_bytes = cache.current_bytes(),
            "cache pressure eviction"
        );
    } else {
        debug!(used_bytes = used, cap_bytes = cap, "cache within budget");
    }
    gate.gc();
}
