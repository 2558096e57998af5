use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::cache::DiskCache;
use super::stats::StatsCollector;
use crate::net::NetManager;

/// Periodically enforce the cache budget and prune finished tasks from the tree.
///
/// The first pass runs one `interval` after spawning. Stops when `token` is cancelled.
pub fn spawn_sweeper(
    cache: Arc<DiskCache>,
    net: Arc<NetManager>,
    stats: Arc<StatsCollector>,
    interval: Duration,
    task_retention: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = token.cancelled() => {
                    debug!("sweeper stopped");
                    return;
                }
            }
            sweep_once(&cache, &net, &stats, task_retention);
        }
    })
}

/// A single maintenance pass.
pub fn sweep_once(
    cache: &DiskCache,
    net: &NetManager,
    stats: &StatsCollector,
    task_retention: Duration,
) {
    match cache.evict_to_budget() {
        Ok(report) => stats.record_eviction(report.removed, report.freed_bytes),
        Err(e) => warn!("sweeper eviction failed: {:#}", e),
    }
    let pruned = net.remove_finished(task_retention);
    if pruned > 0 {
        debug!("sweeper pruned {} finished tasks", pruned);
    }
}
