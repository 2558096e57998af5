// Live statistics aggregation: cache hit rates, download throughput, worker counts.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

struct StatsSample {
    at: Instant,
    download_bytes: u64,
    serve_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub joins: u64,
    pub downloaded_bytes: u64,
    pub served_bytes: u64,
    pub download_bps: u64,
    pub serve_bps: u64,
    pub active_workers: u32,
    pub evictions: u64,
    pub evicted_bytes: u64,
    pub cached_bytes: u64,
    /// Share of requests answered without a new download (hits and joins).
    pub hit_rate: f64,
}

pub struct StatsCollector {
    hits: AtomicU64,
    misses: AtomicU64,
    joins: AtomicU64,
    download_bytes_total: AtomicU64,
    serve_bytes_total: AtomicU64,
    active_workers: AtomicU32,
    evictions: AtomicU64,
    evicted_bytes: AtomicU64,
    last_sample: Mutex<StatsSample>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            joins: AtomicU64::new(0),
            download_bytes_total: AtomicU64::new(0),
            serve_bytes_total: AtomicU64::new(0),
            active_workers: AtomicU32::new(0),
            evictions: AtomicU64::new(0),
            evicted_bytes: AtomicU64::new(0),
            last_sample: Mutex::new(StatsSample {
                at: Instant::now(),
                download_bytes: 0,
                serve_bytes: 0,
            }),
        }
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A request attached to a download that was already in flight.
    pub fn record_join(&self) {
        self.joins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_downloaded(&self, bytes: u64) {
        self.download_bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_served(&self, bytes: u64) {
        self.serve_bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_eviction(&self, entries: usize, bytes: u64) {
        self.evictions.fetch_add(entries as u64, Ordering::Relaxed);
        self.evicted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn increment_workers(&self) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_workers(&self) {
        self.active_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, cached_bytes: u64) -> StatsSnapshot {
        let now = Instant::now();
        let current_download = self.download_bytes_total.load(Ordering::Relaxed);
        let current_serve = self.serve_bytes_total.load(Ordering::Relaxed);

        let (download_bps, serve_bps) = {
            let mut sample = self.last_sample.lock();
            let elapsed = now.duration_since(sample.at).as_secs_f64();

            let (dbps, sbps) = if elapsed > 0.1 {
                let d = ((current_download - sample.download_bytes) as f64 / elapsed) as u64;
                let s = ((current_serve - sample.serve_bytes) as f64 / elapsed) as u64;
                (d, s)
            } else {
                (0, 0)
            };

            // Update sample for next call
            sample.at = now;
            sample.download_bytes = current_download;
            sample.serve_bytes = current_serve;

            (dbps, sbps)
        };

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let joins = self.joins.load(Ordering::Relaxed);
        let requests = hits + misses + joins;
        let hit_rate = if requests > 0 {
            (hits + joins) as f64 / requests as f64
        } else {
            0.0
        };

        StatsSnapshot {
            hits,
            misses,
            joins,
            downloaded_bytes: current_download,
            served_bytes: current_serve,
            download_bps,
            serve_bps,
            active_workers: self.active_workers.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            evicted_bytes: self.evicted_bytes.load(Ordering::Relaxed),
            cached_bytes,
            hit_rate,
        }
    }

    pub fn total_downloaded(&self) -> u64 {
        self.download_bytes_total.load(Ordering::Relaxed)
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
