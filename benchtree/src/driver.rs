//! Per-node benchmark driver: spawns pinned workers, samples throughput and
//! latency every interval, stops the workers after the last epoch.

use std::path::PathBuf;
use std::time::Instant;

use crate::affinity;
use crate::config::BenchConfig;
use crate::epoch::{EpochReport, EpochSampler};
use crate::error::{Error, Result};
use crate::parquet_out::{self, RunInfo};
use crate::sim::SimTree;
use crate::stats::{CounterSnapshot, StatsRegistry};
use crate::transport::{Cluster, LocalCluster};
use crate::tree::TreeIndex;
use crate::worker::{self, RunSignals, WorkerEnv};

/// Outcome of one node's run.
#[derive(Debug)]
pub struct RunSummary {
    pub node_id: u32,
    pub reports: Vec<EpochReport>,
    /// Requests generated after the warm-up.
    pub total_requests: u64,
    /// Debug counters summed over all epochs.
    pub counters: CounterSnapshot,
    pub latency_files: Vec<PathBuf>,
}

/// Run the benchmark on this node. Every node of `cluster` must call this
/// with the same configuration.
///
/// A node that fails aborts the cluster, so the other nodes return
/// [`Error::ClusterAborted`] instead of waiting for it in a collective.
pub fn run<T: TreeIndex, C: Cluster + ?Sized>(
    config: &BenchConfig,
    cluster: &C,
    tree: &T,
) -> Result<RunSummary> {
    run_node(config, cluster, tree).inspect_err(|e| {
        if !matches!(e, Error::ClusterAborted) {
            tracing::error!(node_id = cluster.node_id(), error = %e, "node failed");
            cluster.abort();
        }
    })
}

fn run_node<T: TreeIndex, C: Cluster + ?Sized>(
    config: &BenchConfig,
    cluster: &C,
    tree: &T,
) -> Result<RunSummary> {
    config.validate()?;
    if config.node_count != cluster.node_count() {
        return Err(Error::InvalidConfig(format!(
            "configured for {} nodes, cluster has {}",
            config.node_count,
            cluster.node_count()
        )));
    }
    let node_id = cluster.node_id();
    std::fs::create_dir_all(&config.latency_dir)?;

    tracing::info!(
        node_id,
        threads = config.thread_count,
        coros = config.coro_count,
        workload = config.workload_type.as_str(),
        idx = %config.workload_idx,
        coro_mode = config.coro_mode(),
        "starting benchmark"
    );

    let stats = StatsRegistry::new(config.thread_count, config.coro_count);
    let signals = RunSignals::new();
    let cores = if config.pin_threads {
        let available = affinity::available_cores(config.device_index);
        affinity::worker_cores(&available, config.thread_count)
    } else {
        vec![None; config.thread_count]
    };

    cluster.barrier("benchmark")?;
    let env = WorkerEnv {
        config,
        tree,
        cluster,
        stats: &stats,
        signals: &signals,
        started: Instant::now(),
    };

    let mut sampler = EpochSampler::new(0);
    let mut totals = CounterSnapshot::default();
    let mut latency_files = Vec::with_capacity(config.epochs as usize);
    let mut start_requests = 0;

    std::thread::scope(|s| -> Result<()> {
        for (thread_id, core) in cores.iter().copied().enumerate() {
            let env = &env;
            let spawned = std::thread::Builder::new()
                .name(format!("worker-{thread_id}"))
                .spawn_scoped(s, move || {
                    if let Some(core_id) = core {
                        affinity::pin_thread(core_id, thread_id);
                    }
                    if let Err(e) = worker::thread_run(env, thread_id) {
                        tracing::error!(thread_id, error = %e, "worker failed");
                        std::process::exit(1);
                    }
                });
            if let Err(e) = spawned {
                tracing::error!(thread_id, error = %e, "cannot spawn worker thread");
                std::process::exit(1);
            }
        }

        signals.wait_ready();
        // Load-phase activity is not part of any epoch.
        stats.take_counters();
        stats.take_latency();
        start_requests = stats.total_requests();
        sampler = EpochSampler::new(start_requests);

        loop {
            std::thread::sleep(config.interval);
            let total = stats.total_requests();
            let counters = stats.take_counters();
            totals.merge(&counters);

            let epoch = sampler.next_epoch();
            match stats.take_latency().save(&config.latency_dir, epoch) {
                Ok(path) => latency_files.push(path),
                Err(e) => {
                    signals.stop();
                    return Err(e);
                }
            }

            let report = match sampler.sample(total, counters, cluster, tree.height()) {
                Ok(report) => report,
                Err(e) => {
                    signals.stop();
                    return Err(e);
                }
            };
            tracing::debug!(node_id, throughput = report.node_mops, "node throughput");
            if node_id == 0 {
                tracing::info!(
                    epoch = report.epoch,
                    cluster_mops = format_args!("{:.3}", report.cluster_mops),
                    cache_hit_rate = report.cache_hit_rate,
                    lock_fail_rate = report.lock_fail_rate,
                    read_retry_rate = report.read_retry_rate,
                    tree_height = report.tree_height,
                    "epoch passed"
                );
            }
            if epoch >= config.epochs {
                signals.stop();
                return Ok(());
            }
        }
    })?;
    tracing::debug!(node_id, "all worker threads joined");

    let total_requests = stats.total_requests() - start_requests;
    tracing::info!(
        node_id,
        requests = total_requests,
        cache_hit_rate = totals.cache_hit_rate(),
        lock_fail_rate = totals.lock_fail_rate(),
        read_retry_rate = totals.read_retry_rate(),
        "benchmark finished"
    );
    if node_id == 0 {
        let trim = usize::from(sampler.reports().len() > 2);
        let steady = sampler.steady_state(trim);
        if !steady.is_empty() {
            let avg = steady.iter().map(|r| r.cluster_mops).sum::<f64>() / steady.len() as f64;
            tracing::info!(
                epochs = steady.len(),
                cluster_mops = format_args!("{avg:.3}"),
                "steady state"
            );
        }
    }
    cluster.barrier("fin")?;

    let reports = sampler.into_reports();
    if let (0, Some(path)) = (node_id, &config.output) {
        let info = RunInfo {
            workload: config.workload_type.as_str(),
            mode: if config.coro_mode() { "coro" } else { "sync" },
            node_count: config.node_count,
            threads: config.thread_count as u32,
            coros: config.coro_count as u32,
        };
        parquet_out::write_parquet(path, &parquet_out::rows_from_reports(&info, &reports))?;
        tracing::info!(path = %path.display(), "results written");
    }

    Ok(RunSummary {
        node_id,
        reports,
        total_requests,
        counters: totals,
        latency_files,
    })
}

/// Run every node of the cluster inside this process, all on one simulated
/// index. Summaries are ordered by node id. If nodes fail, the error of the
/// node that aborted the run is returned.
pub fn run_local(config: &BenchConfig) -> Result<Vec<RunSummary>> {
    config.validate()?;
    let tree = SimTree::new(config.sim);
    let nodes = LocalCluster::group(config.node_count);

    let mut node_config = config.clone();
    // Nodes would compete for the same cores.
    node_config.pin_threads &= config.node_count == 1;

    std::thread::scope(|s| {
        let handles: Vec<_> = nodes
            .iter()
            .map(|node| {
                let mut c = node_config.clone();
                if config.node_count > 1 {
                    c.latency_dir = config.latency_dir.join(format!("node_{}", node.node_id()));
                }
                let tree = &tree;
                s.spawn(move || run(&c, node, tree))
            })
            .collect();
        let results: Vec<Result<RunSummary>> = handles
            .into_iter()
            .map(|h| match h.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect();

        let mut summaries = Vec::with_capacity(results.len());
        let mut aborted = None;
        for result in results {
            match result {
                Ok(summary) => summaries.push(summary),
                Err(Error::ClusterAborted) => aborted = Some(Error::ClusterAborted),
                Err(e) => return Err(e),
            }
        }
        match aborted {
            Some(e) => Err(e),
            None => Ok(summaries),
        }
    })
}
