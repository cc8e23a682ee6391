// Live pipeline counters for block downloads, failures, deliveries and throughput.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

struct StatsSample {
    at: Instant,
    download_bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub download_bps: u64,
    pub bytes_downloaded: u64,
    pub blocks_downloaded: u64,
    pub blocks_failed: u64,
    pub images_delivered: u64,
    pub active_downloads: u32,
}

pub struct PipelineStats {
    download_bytes_total: AtomicU64,
    blocks_downloaded: AtomicU64,
    blocks_failed: AtomicU64,
    images_delivered: AtomicU64,
    active_downloads: AtomicU32,
    last_sample: Mutex<StatsSample>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            download_bytes_total: AtomicU64::new(0),
            blocks_downloaded: AtomicU64::new(0),
            blocks_failed: AtomicU64::new(0),
            images_delivered: AtomicU64::new(0),
            active_downloads: AtomicU32::new(0),
            last_sample: Mutex::new(StatsSample {
                at: Instant::now(),
                download_bytes: 0,
            }),
        }
    }

    /// Record one block whose payload of `bytes` was persisted.
    pub fn record_block(&self, bytes: u64) {
        self.download_bytes_total.fetch_add(bytes, Ordering::Relaxed);
        self.blocks_downloaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.blocks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.images_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_downloads(&self) {
        self.active_downloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_downloads(&self) {
        self.active_downloads.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let now = Instant::now();
        let current_download = self.download_bytes_total.load(Ordering::Relaxed);

        let download_bps = {
            let mut sample = self.last_sample.lock();
            let elapsed = now.duration_since(sample.at).as_secs_f64();
            let bps = if elapsed > 0.1 {
                ((current_download - sample.download_bytes) as f64 / elapsed) as u64
            } else {
                0
            };

            // Update sample for next call
            sample.at = now;
            sample.download_bytes = current_download;
            bps
        };

        StatsSnapshot {
            download_bps,
            bytes_downloaded: current_download,
            blocks_downloaded: self.blocks_downloaded.load(Ordering::Relaxed),
            blocks_failed: self.blocks_failed.load(Ordering::Relaxed),
            images_delivered: self.images_delivered.load(Ordering::Relaxed),
            active_downloads: self.active_downloads.load(Ordering::Relaxed),
        }
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_basic() {
        let stats = PipelineStats::new();
        stats.record_block(1000);
        stats.record_block(500);
        stats.record_failure();
        stats.record_delivered();

        stats.increment_downloads();
        stats.increment_downloads();
        stats.decrement_downloads();

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_downloaded, 1500);
        assert_eq!(snap.blocks_downloaded, 2);
        assert_eq!(snap.blocks_failed, 1);
        assert_eq!(snap.images_delivered, 1);
        assert_eq!(snap.active_downloads, 1);
    }
}
