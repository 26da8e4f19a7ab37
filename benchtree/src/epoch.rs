use std::time::{Duration, Instant};

use crate::error::Result;
use crate::stats::CounterSnapshot;
use crate::transport::Cluster;

/// Throughput and debug ratios of one reporting interval.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: u32,
    pub node_id: u32,
    pub requests: u64,
    pub elapsed_us: u64,
    pub node_mops: f64,
    /// Sum over all nodes; only meaningful on node 0.
    pub cluster_mops: f64,
    pub cache_hit_rate: f64,
    pub lock_fail_rate: f64,
    pub read_retry_rate: f64,
    pub tree_height: u32,
}

/// Turns successive request-counter readings into per-interval reports.
pub struct EpochSampler {
    last_requests: u64,
    last_at: Instant,
    next_epoch: u32,
    reports: Vec<EpochReport>,
}

impl EpochSampler {
    /// `start_requests` is the counter value when measurement begins.
    pub fn new(start_requests: u64) -> Self {
        Self {
            last_requests: start_requests,
            last_at: Instant::now(),
            next_epoch: 1,
            reports: Vec::new(),
        }
    }

    /// Index the next report will carry. Epochs are numbered from 1.
    #[inline]
    pub fn next_epoch(&self) -> u32 {
        self.next_epoch
    }

    /// Close the current interval. Every node must call this the same number
    /// of times since the cluster throughput is a collective sum.
    pub fn sample<C: Cluster + ?Sized>(
        &mut self,
        total_requests: u64,
        counters: CounterSnapshot,
        cluster: &C,
        tree_height: u32,
    ) -> Result<&EpochReport> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_at);
        let requests = total_requests.saturating_sub(self.last_requests);
        self.last_at = now;
        self.last_requests = total_requests;

        let node_mops = mops(requests, elapsed);
        // Reduced as integer kops.
        let cluster_kops = cluster.sum((node_mops * 1000.0) as u64)?;

        self.reports.push(EpochReport {
            epoch: self.next_epoch,
            node_id: cluster.node_id(),
            requests,
            elapsed_us: elapsed.as_micros() as u64,
            node_mops,
            cluster_mops: cluster_kops as f64 / 1000.0,
            cache_hit_rate: counters.cache_hit_rate(),
            lock_fail_rate: counters.lock_fail_rate(),
            read_retry_rate: counters.read_retry_rate(),
            tree_height,
        });
        self.next_epoch += 1;
        Ok(&self.reports[self.reports.len() - 1])
    }

    pub fn reports(&self) -> &[EpochReport] {
        &self.reports
    }

    /// Reports with `trim` intervals dropped from each end.
    pub fn steady_state(&self, trim: usize) -> &[EpochReport] {
        let len = self.reports.len();
        if len <= trim * 2 {
            return &[];
        }
        &self.reports[trim..len - trim]
    }

    pub fn into_reports(self) -> Vec<EpochReport> {
        self.reports
    }
}

/// Requests per microsecond.
pub fn mops(requests: u64, elapsed: Duration) -> f64 {
    let us = elapsed.as_micros();
    if us == 0 { 0.0 } else { requests as f64 / us as f64 }
}
