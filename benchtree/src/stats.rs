//! Per-thread statistics and latency histograms.
//!
//! Every cell has exactly one writer: the worker thread owning the
//! [`ThreadStats`] block (coroutines of one thread share it, they never run
//! concurrently). The driver reads all blocks on a timer with relaxed loads
//! and resets them with `swap(0)`, so a report is eventually consistent but
//! never loses an increment.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};

/// Number of latency buckets; bucket width is [`LATENCY_BUCKET_NS`].
pub const LATENCY_WINDOWS: usize = 100_000;
/// Width of one latency bucket (a tenth of a microsecond).
pub const LATENCY_BUCKET_NS: u64 = 100;

/// Bucket of an elapsed time, saturating at the last bucket.
#[inline]
pub fn latency_bucket(elapsed: Duration) -> usize {
    let bucket = elapsed.as_nanos() / LATENCY_BUCKET_NS as u128;
    (bucket.min(LATENCY_WINDOWS as u128 - 1)) as usize
}

/// Debug counters of the tree layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    CacheHit,
    CacheMiss,
    TryLock,
    LockFail,
    TryRead,
    ReadRetry,
}

const COUNTERS: usize = 6;

/// Statistics block of one worker thread.
#[repr(C, align(64))]
pub struct ThreadStats {
    counters: [AtomicU64; COUNTERS],
    /// Requests generated, per coroutine.
    requests: Box<[AtomicU64]>,
    /// `coro_count * LATENCY_WINDOWS` buckets.
    latency: Box<[AtomicU64]>,
}

impl ThreadStats {
    pub fn new(coro_count: usize) -> Self {
        let coro_count = coro_count.max(1);
        Self {
            counters: Default::default(),
            requests: (0..coro_count).map(|_| AtomicU64::new(0)).collect(),
            latency: (0..coro_count * LATENCY_WINDOWS)
                .map(|_| AtomicU64::new(0))
                .collect(),
        }
    }

    #[inline]
    pub fn coro_count(&self) -> usize {
        self.requests.len()
    }

    #[inline]
    pub fn incr(&self, counter: Counter) {
        self.counters[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    /// Count one generated request for `coro_id`.
    #[inline]
    pub fn record_request(&self, coro_id: usize) {
        self.requests[coro_id].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn requests(&self, coro_id: usize) -> u64 {
        self.requests[coro_id].load(Ordering::Relaxed)
    }

    /// Record one completed request of `coro_id`.
    #[inline]
    pub fn record_latency(&self, coro_id: usize, elapsed: Duration) {
        let idx = coro_id * LATENCY_WINDOWS + latency_bucket(elapsed);
        self.latency[idx].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn latency_count(&self, coro_id: usize, bucket: usize) -> u64 {
        self.latency[coro_id * LATENCY_WINDOWS + bucket].load(Ordering::Relaxed)
    }
}

/// Snapshot of the debug counters summed over threads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub cache_hit: u64,
    pub cache_miss: u64,
    pub try_lock: u64,
    pub lock_fail: u64,
    pub try_read: u64,
    pub read_retry: u64,
}

impl CounterSnapshot {
    pub fn cache_hit_rate(&self) -> f64 {
        ratio(self.cache_hit, self.cache_hit + self.cache_miss)
    }

    pub fn lock_fail_rate(&self) -> f64 {
        ratio(self.lock_fail, self.try_lock)
    }

    pub fn read_retry_rate(&self) -> f64 {
        ratio(self.read_retry, self.try_read)
    }

    pub fn merge(&mut self, other: &CounterSnapshot) {
        self.cache_hit += other.cache_hit;
        self.cache_miss += other.cache_miss;
        self.try_lock += other.try_lock;
        self.lock_fail += other.lock_fail;
        self.try_read += other.try_read;
        self.read_retry += other.read_retry;
    }
}

fn ratio(n: u64, d: u64) -> f64 {
    if d == 0 { 0.0 } else { n as f64 / d as f64 }
}

/// Latency histogram summed over threads and coroutines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyHistogram {
    buckets: Vec<u64>,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            buckets: vec![0; LATENCY_WINDOWS],
        }
    }
}

impl LatencyHistogram {
    #[inline]
    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    pub fn total(&self) -> u64 {
        self.buckets.iter().sum()
    }

    /// Latency of the `q`-quantile as a bucket lower bound.
    pub fn percentile(&self, q: f64) -> Option<Duration> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        let target = ((total as f64 * q).ceil() as u64).max(1);
        let mut seen = 0;
        for (i, n) in self.buckets.iter().enumerate() {
            seen += n;
            if seen >= target {
                return Some(Duration::from_nanos(i as u64 * LATENCY_BUCKET_NS));
            }
        }
        None
    }

    /// Write `<bucket µs with one decimal>\t<count>` lines.
    pub fn write_to(&self, w: &mut impl Write) -> std::io::Result<()> {
        for (i, n) in self.buckets.iter().enumerate() {
            writeln!(w, "{:.1}\t{}", i as f64 / 10.0, n)?;
        }
        Ok(())
    }

    /// Write the histogram to `<dir>/epoch_<epoch>.lat`.
    pub fn save(&self, dir: &Path, epoch: u32) -> Result<PathBuf> {
        let path = dir.join(format!("epoch_{epoch}.lat"));
        let report_err = |e: std::io::Error| Error::ReportWrite {
            path: path.clone(),
            source: Box::new(e),
        };
        let mut w = BufWriter::new(File::create(&path).map_err(report_err)?);
        self.write_to(&mut w).map_err(report_err)?;
        w.flush().map_err(report_err)?;
        Ok(path)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Statistics of every worker thread of this process.
///
/// Handed to each worker by reference; the worker only touches its own
/// block.
pub struct StatsRegistry {
    threads: Box<[ThreadStats]>,
}

impl StatsRegistry {
    pub fn new(thread_count: usize, coro_count: usize) -> Self {
        Self {
            threads: (0..thread_count).map(|_| ThreadStats::new(coro_count)).collect(),
        }
    }

    #[inline]
    pub fn thread(&self, thread_id: usize) -> &ThreadStats {
        &self.threads[thread_id]
    }

    #[inline]
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Requests generated so far, all threads and coroutines.
    pub fn total_requests(&self) -> u64 {
        self.threads
            .iter()
            .flat_map(|t| t.requests.iter())
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Sum the debug counters without resetting them.
    pub fn counters(&self) -> CounterSnapshot {
        self.collect_counters(|c| c.load(Ordering::Relaxed))
    }

    /// Sum the debug counters and reset them for the next interval.
    pub fn take_counters(&self) -> CounterSnapshot {
        self.collect_counters(|c| c.swap(0, Ordering::Relaxed))
    }

    fn collect_counters(&self, read: impl Fn(&AtomicU64) -> u64) -> CounterSnapshot {
        let mut s = CounterSnapshot::default();
        for t in self.threads.iter() {
            let c = &t.counters;
            s.merge(&CounterSnapshot {
                cache_hit: read(&c[Counter::CacheHit as usize]),
                cache_miss: read(&c[Counter::CacheMiss as usize]),
                try_lock: read(&c[Counter::TryLock as usize]),
                lock_fail: read(&c[Counter::LockFail as usize]),
                try_read: read(&c[Counter::TryRead as usize]),
                read_retry: read(&c[Counter::ReadRetry as usize]),
            });
        }
        s
    }

    /// Sum all latency histograms and zero them, so each report only covers
    /// its own interval.
    pub fn take_latency(&self) -> LatencyHistogram {
        let mut all = LatencyHistogram::default();
        for t in self.threads.iter() {
            for chunk in t.latency.chunks(LATENCY_WINDOWS) {
                for (sum, cell) in all.buckets.iter_mut().zip(chunk) {
                    *sum += cell.swap(0, Ordering::Relaxed);
                }
            }
        }
        all
    }
}
