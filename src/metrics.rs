//! Metrics sink for pool, transfer, cache, compression and retry events.
//!
//! Components receive an `Arc<dyn MetricsSink>` at construction; nothing here
//! is process-global.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// How many transfer latencies are kept for percentile estimation.
const LATENCY_WINDOW: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    Listing,
    Capability,
    Network,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferRecord {
    pub operation: &'static str,
    pub bytes: u64,
    pub duration: Duration,
    pub success: bool,
}

pub trait MetricsSink: Send + Sync {
    fn pool_hit(&self, server_key: &str);
    fn pool_miss(&self, server_key: &str);
    fn queue_wait(&self, server_key: &str, waited: Duration);
    fn transfer(&self, record: TransferRecord);
    fn cache_hit(&self, kind: CacheKind);
    fn cache_miss(&self, kind: CacheKind);
    fn cache_eviction(&self, kind: CacheKind, count: usize);
    fn compression_ratio(&self, original: u64, compressed: u64);
    fn retry(&self, operation: &str, reason: &str);

    /// Aggregated view, for sinks that keep one.
    fn snapshot(&self) -> Option<MetricsSnapshot> {
        None
    }
}

/// Discards everything.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn pool_hit(&self, _: &str) {}
    fn pool_miss(&self, _: &str) {}
    fn queue_wait(&self, _: &str, _: Duration) {}
    fn transfer(&self, _: TransferRecord) {}
    fn cache_hit(&self, _: CacheKind) {}
    fn cache_miss(&self, _: CacheKind) {}
    fn cache_eviction(&self, _: CacheKind, _: usize) {}
    fn compression_ratio(&self, _: u64, _: u64) {}
    fn retry(&self, _: &str, _: &str) {}
}

#[derive(Default)]
pub struct InMemoryMetrics {
    pool_hits: AtomicU64,
    pool_misses: AtomicU64,
    queue_wait_total_ms: AtomicU64,
    queue_waits: AtomicU64,
    transfers_ok: AtomicU64,
    transfers_failed: AtomicU64,
    bytes_transferred: AtomicU64,
    transfer_time_ms: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_evictions: AtomicU64,
    compressed_original: AtomicU64,
    compressed_output: AtomicU64,
    latencies: Mutex<VecDeque<Duration>>,
    retries: Mutex<HashMap<String, u64>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub avg_queue_wait_ms: f64,
    pub transfers_ok: u64,
    pub transfers_failed: u64,
    pub bytes_transferred: u64,
    /// Bytes per second over successful transfers.
    pub avg_speed: f64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub compression_ratio: Option<f64>,
    pub retries_by_reason: HashMap<String, u64>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summary(&self) -> MetricsSnapshot {
        let queue_waits = self.queue_waits.load(Ordering::Relaxed);
        let bytes = self.bytes_transferred.load(Ordering::Relaxed);
        let time_ms = self.transfer_time_ms.load(Ordering::Relaxed);
        let original = self.compressed_original.load(Ordering::Relaxed);
        let compressed = self.compressed_output.load(Ordering::Relaxed);

        let mut latencies: Vec<Duration> = self
            .latencies
            .lock()
            .map(|window| window.iter().copied().collect())
            .unwrap_or_default();
        latencies.sort_unstable();

        MetricsSnapshot {
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
            pool_misses: self.pool_misses.load(Ordering::Relaxed),
            avg_queue_wait_ms: if queue_waits == 0 {
                0.0
            } else {
                self.queue_wait_total_ms.load(Ordering::Relaxed) as f64 / queue_waits as f64
            },
            transfers_ok: self.transfers_ok.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
            bytes_transferred: bytes,
            avg_speed: if time_ms == 0 {
                0.0
            } else {
                bytes as f64 / (time_ms as f64 / 1000.0)
            },
            p50_latency_ms: percentile(&latencies, 0.50),
            p95_latency_ms: percentile(&latencies, 0.95),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
            compression_ratio: (original > 0).then(|| compressed as f64 / original as f64),
            retries_by_reason: self
                .retries
                .lock()
                .map(|retries| retries.clone())
                .unwrap_or_default(),
        }
    }
}

fn percentile(sorted: &[Duration], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted[rank.min(sorted.len() - 1)].as_millis() as u64
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl MetricsSink for InMemoryMetrics {
    fn pool_hit(&self, _server_key: &str) {
        self.pool_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn pool_miss(&self, _server_key: &str) {
        self.pool_misses.fetch_add(1, Ordering::Relaxed);
    }

    fn queue_wait(&self, _server_key: &str, waited: Duration) {
        self.queue_waits.fetch_add(1, Ordering::Relaxed);
        self.queue_wait_total_ms
            .fetch_add(millis(waited), Ordering::Relaxed);
    }

    fn transfer(&self, record: TransferRecord) {
        if record.success {
            self.transfers_ok.fetch_add(1, Ordering::Relaxed);
            self.bytes_transferred
                .fetch_add(record.bytes, Ordering::Relaxed);
            self.transfer_time_ms
                .fetch_add(millis(record.duration), Ordering::Relaxed);
        } else {
            self.transfers_failed.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut window) = self.latencies.lock() {
            if window.len() == LATENCY_WINDOW {
                window.pop_front();
            }
            window.push_back(record.duration);
        }
    }

    fn cache_hit(&self, _kind: CacheKind) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn cache_miss(&self, _kind: CacheKind) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    fn cache_eviction(&self, _kind: CacheKind, count: usize) {
        self.cache_evictions
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    fn compression_ratio(&self, original: u64, compressed: u64) {
        self.compressed_original
            .fetch_add(original, Ordering::Relaxed);
        self.compressed_output
            .fetch_add(compressed, Ordering::Relaxed);
    }

    fn retry(&self, operation: &str, reason: &str) {
        if let Ok(mut retries) = self.retries.lock() {
            *retries
                .entry(format!("{}:{}", operation, reason))
                .or_insert(0) += 1;
        }
    }

    fn snapshot(&self) -> Option<MetricsSnapshot> {
        Some(self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ms: u64, bytes: u64, success: bool) -> TransferRecord {
        TransferRecord {
            operation: "upload",
            bytes,
            duration: Duration::from_millis(ms),
            success,
        }
    }

    #[test]
    fn test_transfer_counters_and_speed() {
        let metrics = InMemoryMetrics::new();
        metrics.transfer(record(1000, 4096, true));
        metrics.transfer(record(1000, 4096, true));
        metrics.transfer(record(50, 0, false));

        let snap = metrics.summary();
        assert_eq!(snap.transfers_ok, 2);
        assert_eq!(snap.transfers_failed, 1);
        assert_eq!(snap.bytes_transferred, 8192);
        assert!((snap.avg_speed - 4096.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_latency_percentiles() {
        let metrics = InMemoryMetrics::new();
        for ms in 1..=100 {
            metrics.transfer(record(ms, 1, true));
        }
        let snap = metrics.summary();
        assert_eq!(snap.p50_latency_ms, 51);
        assert_eq!(snap.p95_latency_ms, 95);
    }

    #[test]
    fn test_compression_ratio_and_retries() {
        let metrics = InMemoryMetrics::new();
        assert!(metrics.summary().compression_ratio.is_none());

        metrics.compression_ratio(1000, 250);
        metrics.retry("download", "data_channel");
        metrics.retry("download", "data_channel");

        let snap = metrics.summary();
        assert_eq!(snap.compression_ratio, Some(0.25));
        assert_eq!(snap.retries_by_reason.get("download:data_channel"), Some(&2));
    }
}
