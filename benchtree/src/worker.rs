//! Worker thread lifecycle: register, load, read transactions, warm-up
//! handshake, run until stopped.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Instant;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::config::{BenchConfig, LOAD_HEARTBEAT, TxnSource};
use crate::engine::Engine;
use crate::error::Result;
use crate::generator::{CoroIdentity, ReplayGenerator};
use crate::request::{VALUE_MAX, VALUE_MIN, WorkloadEntry};
use crate::stats::StatsRegistry;
use crate::transport::Cluster;
use crate::tree::TreeIndex;
use crate::workload;

/// Flags shared by the workers of one node and its driver thread.
pub struct RunSignals {
    /// Workers done with loading; `-1` once the node may start.
    warmup_cnt: AtomicI64,
    ready: AtomicBool,
    stop: AtomicBool,
}

impl Default for RunSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl RunSignals {
    pub fn new() -> Self {
        Self {
            warmup_cnt: AtomicI64::new(0),
            ready: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Spin until worker 0 has finished the warm-up handshake.
    pub fn wait_ready(&self) {
        while !self.is_ready() {
            std::hint::spin_loop();
        }
    }

    #[inline]
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    #[inline]
    pub fn stop_flag(&self) -> &AtomicBool {
        &self.stop
    }

    /// Called by every worker once its transactions are in memory. Worker 0
    /// waits for the others, syncs with the cluster, then releases everyone.
    fn warmup<C: Cluster + ?Sized>(
        &self,
        thread_id: usize,
        thread_count: usize,
        cluster: &C,
        started: Instant,
    ) -> Result<()> {
        self.warmup_cnt.fetch_add(1, Ordering::AcqRel);
        if thread_id == 0 {
            while self.warmup_cnt.load(Ordering::Acquire) != thread_count as i64 {
                std::hint::spin_loop();
            }
            tracing::info!(node = cluster.node_id(), "node finished warm-up");
            cluster.barrier("warm_finish")?;
            tracing::info!(secs = started.elapsed().as_secs(), "warm-up time");
            self.ready.store(true, Ordering::Release);
            self.warmup_cnt.store(-1, Ordering::Release);
        }
        while self.warmup_cnt.load(Ordering::Acquire) != -1 {
            std::hint::spin_loop();
        }
        Ok(())
    }
}

/// Everything a worker thread borrows from its node.
pub struct WorkerEnv<'a, T: TreeIndex, C: Cluster + ?Sized> {
    pub config: &'a BenchConfig,
    pub tree: &'a T,
    pub cluster: &'a C,
    pub stats: &'a StatsRegistry,
    pub signals: &'a RunSignals,
    pub started: Instant,
}

impl<T: TreeIndex, C: Cluster + ?Sized> WorkerEnv<'_, T, C> {
    fn identity(&self, thread_id: usize, coro_id: usize, coro_count: usize) -> CoroIdentity {
        CoroIdentity {
            node_id: self.cluster.node_id(),
            node_count: self.cluster.node_count(),
            thread_id,
            thread_count: self.config.thread_count,
            coro_id,
            coro_count,
        }
    }
}

/// Body of worker thread `thread_id`. Errors are fatal to the process.
pub fn thread_run<T: TreeIndex, C: Cluster + ?Sized>(
    env: &WorkerEnv<'_, T, C>,
    thread_id: usize,
) -> Result<()> {
    let config = env.config;
    let node_id = env.cluster.node_id() as usize;
    let endpoint = env.tree.register_thread(thread_id);
    let stats = env.stats.thread(thread_id);
    let engine =
        Engine::new(env.tree, &endpoint, stats).with_arena(config.geometry, config.arena_budget);

    let worker_id = config.thread_count * node_id + thread_id;
    tracing::debug!(thread_id, worker_id, "worker registered");

    if matches!(config.source, TxnSource::Files) && thread_id < config.loader_count() {
        load(&engine, config, config.loader_count() * node_id + thread_id)?;
    }

    let requests = transactions(config, worker_id)?;
    tracing::debug!(thread_id, requests = requests.len(), "transactions ready");

    env.signals.warmup(thread_id, config.thread_count, env.cluster, env.started)?;

    let stop = env.signals.stop_flag();
    if config.coro_mode() {
        let generators = (0..config.coro_count)
            .map(|c| {
                let id = env.identity(thread_id, c, config.coro_count);
                ReplayGenerator::new(&requests, id, stats)
            })
            .collect::<Vec<_>>();
        engine.run_coroutines(generators, stop);
    } else {
        let id = env.identity(thread_id, 0, 1);
        engine.run_sync(ReplayGenerator::new(&requests, id, stats), stop);
    }

    tracing::debug!(thread_id, "worker exit");
    Ok(())
}

fn load<T: TreeIndex>(engine: &Engine<'_, T>, config: &BenchConfig, loader_id: usize) -> Result<()> {
    let path = workload::load_path(
        &config.workload_dir,
        config.workload_type,
        &config.workload_idx,
        loader_id as u64,
    );
    tracing::info!(loader_id, path = %path.display(), "loading");
    let keys = workload::read_load_file(&path, config.workload_type)?;

    let mut rng = SmallRng::seed_from_u64(loader_id as u64);
    let mut session = engine.sync_session();
    for (i, key) in keys.iter().enumerate() {
        session.insert(key, rng.random_range(VALUE_MIN..=VALUE_MAX));
        if (i + 1) % LOAD_HEARTBEAT == 0 {
            tracing::info!(loader_id, loaded = i + 1, "load entries loaded");
        }
    }
    tracing::info!(loader_id, entries = keys.len(), "load finished");
    Ok(())
}

fn transactions(config: &BenchConfig, worker_id: usize) -> Result<Vec<WorkloadEntry>> {
    match config.source {
        TxnSource::Files => {
            let path = workload::txn_path(
                &config.workload_dir,
                config.workload_type,
                &config.workload_idx,
                worker_id as u64,
            );
            workload::read_txn_file(&path, config.workload_type, config.fix_range_size)
        }
        TxnSource::Synthetic {
            key_range,
            read_ratio,
            distribution,
            pattern_len,
        } => Ok(workload::generate_pattern(
            key_range,
            read_ratio,
            distribution,
            pattern_len,
            worker_id as u64,
        )),
    }
}
