//! Command line and validated run configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::arena::{ArenaGeometry, PER_CORO_RDMA_BUF};
use crate::error::{Error, Result};
use crate::sim::SimConfig;
use crate::workload::{KeyDistribution, WorkloadType};

/// Threads per node that load the initial key set.
pub const LOADER_NUM: usize = 8;
/// Progress is logged every this many loaded entries.
pub const LOAD_HEARTBEAT: usize = 100_000;
/// Upper bound on coroutine slots per worker thread.
pub const MAX_CORO_NUM: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "benchtree")]
#[command(about = "YCSB benchmark for a B+-tree over one-sided RDMA")]
pub struct Cli {
    /// Number of nodes in the cluster
    pub node_count: u32,

    /// Worker threads per node
    pub thread_count: usize,

    /// Coroutine slots per worker thread
    pub coro_count: usize,

    /// Key type of the workload
    pub workload_type: WorkloadType,

    /// Workload index (a, b, c, d, e, ...); `e` is the scan workload
    pub workload_idx: String,

    /// Override the range size of every scan
    pub fix_range_size: Option<u64>,

    /// Directory holding load_* and txn_* files
    #[arg(long, default_value = "../ycsb/workloads")]
    pub workload_dir: PathBuf,

    /// Directory for per-epoch latency files
    #[arg(long, default_value = "../us_lat")]
    pub latency_dir: PathBuf,

    /// Reporting intervals before stopping
    #[arg(long, default_value = "10")]
    pub epochs: u32,

    /// Reporting interval in milliseconds
    #[arg(long, default_value = "500")]
    pub interval_ms: u64,

    /// Write per-epoch throughput to this parquet file (node 0 only)
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Issue one request at a time per thread
    #[arg(long)]
    pub no_coro: bool,

    /// RDMA device index used for core placement
    #[arg(long, default_value = "0")]
    pub device_index: usize,

    /// Generate transactions instead of reading txn files; nothing is loaded
    #[arg(long)]
    pub synthetic: bool,

    /// Key range of synthetic transactions
    #[arg(long, default_value = "100000")]
    pub key_range: u64,

    /// Read ratio of synthetic transactions
    #[arg(long, default_value = "0.5")]
    pub read_ratio: f64,

    /// Key distribution of synthetic transactions
    #[arg(long, default_value = "uniform")]
    pub distribution: KeyDistribution,

    /// Synthetic transactions per thread
    #[arg(long, default_value = "100000")]
    pub pattern_len: usize,

    /// Leaves of the simulated index
    #[arg(long, default_value = "16384")]
    pub leaf_count: usize,

    /// Minimum completion delay of the simulated transport, in polls
    #[arg(long, default_value = "1")]
    pub min_delay: u32,

    /// Maximum completion delay of the simulated transport, in polls
    #[arg(long, default_value = "4")]
    pub max_delay: u32,
}

/// Where transactions come from.
#[derive(Debug, Clone)]
pub enum TxnSource {
    Files,
    Synthetic {
        key_range: u64,
        read_ratio: f64,
        distribution: KeyDistribution,
        pattern_len: usize,
    },
}

#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub node_count: u32,
    pub thread_count: usize,
    pub coro_count: usize,
    pub workload_type: WorkloadType,
    pub workload_idx: String,
    pub fix_range_size: Option<u64>,
    pub workload_dir: PathBuf,
    pub latency_dir: PathBuf,
    pub epochs: u32,
    pub interval: Duration,
    pub output: Option<PathBuf>,
    pub use_coro: bool,
    pub device_index: usize,
    pub pin_threads: bool,
    pub source: TxnSource,
    pub geometry: ArenaGeometry,
    pub arena_budget: usize,
    pub sim: SimConfig,
}

impl BenchConfig {
    /// Scan workloads always run one request at a time.
    #[inline]
    pub fn is_scan(&self) -> bool {
        self.workload_idx == "e"
    }

    #[inline]
    pub fn coro_mode(&self) -> bool {
        self.use_coro && !self.is_scan()
    }

    /// Threads per node that run the load phase.
    #[inline]
    pub fn loader_count(&self) -> usize {
        self.thread_count.min(LOADER_NUM)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));
        if self.node_count == 0 {
            return invalid("node count must be at least 1".into());
        }
        if self.thread_count == 0 {
            return invalid("thread count must be at least 1".into());
        }
        if self.coro_count == 0 || self.coro_count > MAX_CORO_NUM {
            return invalid(format!(
                "coroutine count must be in 1..={MAX_CORO_NUM}, got {}",
                self.coro_count
            ));
        }
        if self.epochs == 0 {
            return invalid("at least one epoch is required".into());
        }
        if self.interval.is_zero() {
            return invalid("interval must be positive".into());
        }
        if self.workload_type.is_str() && self.is_scan() {
            return invalid("string workloads do not support scans".into());
        }
        if let TxnSource::Synthetic {
            key_range,
            read_ratio,
            pattern_len,
            ..
        } = self.source
        {
            if key_range == 0 || pattern_len == 0 {
                return invalid("synthetic key range and length must be positive".into());
            }
            if !(0.0..=1.0).contains(&read_ratio) {
                return invalid(format!("read ratio must be in [0, 1], got {read_ratio}"));
            }
        }
        if self.sim.page_size != self.geometry.page_size {
            return invalid("simulated page size must match the arena page size".into());
        }
        if self.sim.leaf_count == 0 || self.sim.min_delay > self.sim.max_delay {
            return invalid("invalid simulator geometry".into());
        }
        if !self.geometry.fits(self.arena_budget) {
            return invalid(format!(
                "scratch arena needs {} bytes, per-coroutine budget is {}",
                self.geometry.span(),
                self.arena_budget
            ));
        }
        Ok(())
    }
}

impl TryFrom<Cli> for BenchConfig {
    type Error = Error;

    fn try_from(cli: Cli) -> Result<Self> {
        let geometry = ArenaGeometry::default();
        let source = if cli.synthetic {
            TxnSource::Synthetic {
                key_range: cli.key_range,
                read_ratio: cli.read_ratio,
                distribution: cli.distribution,
                pattern_len: cli.pattern_len,
            }
        } else {
            TxnSource::Files
        };
        let config = BenchConfig {
            node_count: cli.node_count,
            thread_count: cli.thread_count,
            coro_count: cli.coro_count,
            workload_type: cli.workload_type,
            workload_idx: cli.workload_idx,
            fix_range_size: cli.fix_range_size,
            workload_dir: cli.workload_dir,
            latency_dir: cli.latency_dir,
            epochs: cli.epochs,
            interval: Duration::from_millis(cli.interval_ms),
            output: cli.output,
            use_coro: !cli.no_coro,
            device_index: cli.device_index,
            pin_threads: true,
            source,
            geometry,
            arena_budget: PER_CORO_RDMA_BUF,
            sim: SimConfig {
                leaf_count: cli.leaf_count,
                page_size: geometry.page_size,
                min_delay: cli.min_delay,
                max_delay: cli.max_delay,
            },
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<BenchConfig> {
        let cli = Cli::try_parse_from(std::iter::once("benchtree").chain(args.iter().copied()))
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        BenchConfig::try_from(cli)
    }

    #[test]
    fn test_positional_args() {
        let c = parse(&["2", "4", "8", "randint", "a"]).unwrap();
        assert_eq!(c.node_count, 2);
        assert_eq!(c.thread_count, 4);
        assert_eq!(c.coro_count, 8);
        assert_eq!(c.fix_range_size, None);
        assert!(c.coro_mode());
        assert_eq!(c.epochs, 10);
        assert_eq!(c.interval, Duration::from_millis(500));

        let c = parse(&["1", "1", "1", "randint", "e", "100"]).unwrap();
        assert_eq!(c.fix_range_size, Some(100));
        assert!(c.is_scan());
        assert!(!c.coro_mode());
    }

    #[test]
    fn test_loader_count_capped() {
        assert_eq!(parse(&["1", "16", "1", "randint", "a"]).unwrap().loader_count(), 8);
        assert_eq!(parse(&["1", "3", "1", "randint", "a"]).unwrap().loader_count(), 3);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(parse(&["1", "1", "1", "email", "e"]).is_err());
        assert!(parse(&["1", "0", "1", "randint", "a"]).is_err());
        assert!(parse(&["1", "1", "65", "randint", "a"]).is_err());
        assert!(parse(&["1", "1", "1", "bogus", "a"]).is_err());
        assert!(parse(&["1", "1", "1", "randint", "a", "--synthetic", "--read-ratio", "2"]).is_err());
        assert!(parse(&["1", "1", "1", "randint", "a", "--min-delay", "5", "--max-delay", "1"]).is_err());
    }
}
