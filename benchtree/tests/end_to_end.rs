use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use benchtree::Error;
use benchtree::arena::ArenaGeometry;
use benchtree::config::{BenchConfig, TxnSource};
use benchtree::driver;
use benchtree::engine::Engine;
use benchtree::generator::{CoroIdentity, ReplayGenerator, RequestGen};
use benchtree::request::{Key, Request};
use benchtree::sim::{SimConfig, SimTree};
use benchtree::stats::{Counter, LATENCY_WINDOWS, StatsRegistry, ThreadStats};
use benchtree::tree::TreeIndex;
use benchtree::workload::{self, KeyDistribution, WorkloadType};

fn write(dir: &Path, name: &str, body: &str) {
    fs::write(dir.join(name), body).unwrap();
}

/// Two threads, two coroutines each, four load lines and eight transaction
/// lines per thread.
fn write_workload(dir: &Path) {
    write(dir, "load_randint_workloada0", "INSERT 1\nINSERT 2\n");
    write(dir, "load_randint_workloada1", "INSERT 3\n\nINSERT 4\n");
    for worker in 0..2 {
        let body: String = (0..8)
            .map(|i| match i % 4 {
                0 => format!("READ {}\n", i % 4 + 1),
                1 => format!("UPDATE {}\n", i % 4 + 1),
                2 => format!("INSERT {}\n", 100 + worker * 10 + i),
                _ => format!("READ {}\n", i % 4 + 1),
            })
            .collect();
        write(dir, &format!("txn_randint_workloada{worker}"), &body);
    }
}

fn config(dir: &Path) -> BenchConfig {
    let geometry = ArenaGeometry::default();
    BenchConfig {
        node_count: 1,
        thread_count: 2,
        coro_count: 2,
        workload_type: WorkloadType::Randint,
        workload_idx: "a".into(),
        fix_range_size: None,
        workload_dir: dir.to_path_buf(),
        latency_dir: dir.join("us_lat"),
        epochs: 2,
        interval: Duration::from_millis(50),
        output: Some(dir.join("out.parquet")),
        use_coro: true,
        device_index: 0,
        pin_threads: false,
        source: TxnSource::Files,
        geometry,
        arena_budget: benchtree::arena::PER_CORO_RDMA_BUF,
        sim: SimConfig {
            leaf_count: 64,
            page_size: geometry.page_size,
            ..SimConfig::default()
        },
    }
}

#[test]
fn test_generators_split_thread_sequences() {
    let dir = tempfile::tempdir().unwrap();
    write_workload(dir.path());
    let stats = StatsRegistry::new(2, 2);

    for thread_id in 0..2 {
        let path = workload::txn_path(dir.path(), WorkloadType::Randint, "a", thread_id as u64);
        let requests = workload::read_txn_file(&path, WorkloadType::Randint, None).unwrap();
        assert_eq!(requests.len(), 8);

        let mut seen = Vec::new();
        for coro_id in 0..2 {
            let id = CoroIdentity {
                node_id: 0,
                node_count: 1,
                thread_id,
                thread_count: 2,
                coro_id,
                coro_count: 2,
            };
            let mut g = ReplayGenerator::new(&requests, id, stats.thread(thread_id));
            for n in 1..=4 {
                seen.push(g.next());
                assert_eq!(g.wrapped(), n == 4);
            }
        }
        let t = stats.thread(thread_id);
        assert_eq!(t.requests(0) + t.requests(1), 8);
        // Each first-pass request came out exactly once.
        let mut keys: Vec<Key> = seen.iter().map(|r| r.key().clone()).collect();
        let mut expected: Vec<Key> = requests.iter().map(|e| e.key.clone()).collect();
        keys.sort();
        expected.sort();
        assert_eq!(keys, expected);
    }
    assert_eq!(stats.total_requests(), 16);
}

#[test]
fn test_load_then_search_synchronously() {
    let dir = tempfile::tempdir().unwrap();
    write_workload(dir.path());
    let tree = SimTree::new(SimConfig {
        leaf_count: 8,
        ..SimConfig::default()
    });
    let endpoint = tree.register_thread(0);
    let stats = ThreadStats::new(1);
    let engine = Engine::new(&tree, &endpoint, &stats);
    let mut session = engine.sync_session();

    for loader in 0..2 {
        let path = workload::load_path(dir.path(), WorkloadType::Randint, "a", loader);
        for key in workload::read_load_file(&path, WorkloadType::Randint).unwrap() {
            session.insert(&key, 7);
        }
    }
    for k in 1..=4 {
        assert_eq!(session.search(&Key::Int(k)), Some(7));
    }
    assert_eq!(session.search(&Key::Int(5)), None);
    assert_eq!(tree.entry_count(), 4);
}

/// Replays a fixed script and raises `stop` once every script is drained.
struct Script<'a> {
    requests: VecDeque<Request>,
    remaining: &'a AtomicUsize,
    stop: &'a AtomicBool,
}

impl RequestGen for Script<'_> {
    fn next(&mut self) -> Request {
        match self.requests.pop_front() {
            Some(r) => {
                if self.remaining.fetch_sub(1, Ordering::Relaxed) == 1 {
                    self.stop.store(true, Ordering::Relaxed);
                }
                r
            }
            None => Request::Search { key: Key::Int(0) },
        }
    }
}

#[test]
fn test_coroutines_share_one_leaf() {
    let tree = SimTree::new(SimConfig {
        leaf_count: 2,
        min_delay: 0,
        max_delay: 6,
        ..SimConfig::default()
    });
    let endpoint = tree.register_thread(0);
    let stats = ThreadStats::new(4);
    let engine = Engine::new(&tree, &endpoint, &stats);

    let remaining = AtomicUsize::new(4 * 8);
    let stop = AtomicBool::new(false);
    let scripts: Vec<Script<'_>> = (0..4u64)
        .map(|c| Script {
            requests: (0..8u64)
                .map(|i| Request::Insert {
                    key: Key::Int(i * 4 + c),
                    value: 1000 + i * 4 + c,
                })
                .collect(),
            remaining: &remaining,
            stop: &stop,
        })
        .collect();
    engine.run_coroutines(scripts, &stop);

    assert_eq!(endpoint.outstanding(), 0);
    assert_eq!(tree.entry_count(), 32);
    let mut session = engine.sync_session();
    for k in 0..32 {
        assert_eq!(session.search(&Key::Int(k)), Some(1000 + k));
    }
    assert!(stats.get(Counter::TryLock) >= 32);
    assert!(stats.get(Counter::LockFail) > 0, "coroutines on one leaf must contend");
    for c in 0..4 {
        let recorded: u64 = (0..LATENCY_WINDOWS).map(|b| stats.latency_count(c, b)).sum();
        assert!(recorded >= 8, "coroutine {c} recorded {recorded} requests");
    }
}

/// One 4-line load file, one 8-line transaction file alternating reads and
/// updates on keys 1-4, replayed by 2 threads with 2 coroutines each.
#[test]
fn test_four_key_load_eight_line_replay() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "load_randint_workloada0", "INSERT 1\nINSERT 2\nINSERT 3\nINSERT 4\n");
    let txn: String = (0..8)
        .map(|i| {
            let op = if i % 2 == 0 { "READ" } else { "UPDATE" };
            format!("{op} {}\n", i % 4 + 1)
        })
        .collect();
    write(dir.path(), "txn_randint_workloada0", &txn);

    let tree = SimTree::new(SimConfig {
        leaf_count: 8,
        ..SimConfig::default()
    });
    let loader_ep = tree.register_thread(0);
    let loader_stats = ThreadStats::new(1);
    let loader = Engine::new(&tree, &loader_ep, &loader_stats);
    let load = workload::load_path(dir.path(), WorkloadType::Randint, "a", 0);
    let keys = workload::read_load_file(&load, WorkloadType::Randint).unwrap();
    assert_eq!(keys, (1..=4).map(Key::Int).collect::<Vec<_>>());
    let mut session = loader.sync_session();
    for key in &keys {
        session.insert(key, 1);
    }

    let path = workload::txn_path(dir.path(), WorkloadType::Randint, "a", 0);
    let requests = workload::read_txn_file(&path, WorkloadType::Randint, None).unwrap();
    assert_eq!(requests.len(), 8);

    let stats = StatsRegistry::new(2, 2);
    std::thread::scope(|s| {
        for thread_id in 0..2 {
            let (tree, stats, requests) = (&tree, &stats, &requests);
            s.spawn(move || {
                let t = stats.thread(thread_id);
                let mut gens: Vec<ReplayGenerator<'_>> = (0..2)
                    .map(|coro_id| {
                        let id = CoroIdentity {
                            node_id: 0,
                            node_count: 1,
                            thread_id,
                            thread_count: 2,
                            coro_id,
                            coro_count: 2,
                        };
                        ReplayGenerator::new(requests, id, t)
                    })
                    .collect();
                let mut scripts: Vec<VecDeque<Request>> = (0..2).map(|_| VecDeque::new()).collect();
                for n in 1..=4 {
                    for (g, script) in gens.iter_mut().zip(scripts.iter_mut()) {
                        script.push_back(g.next());
                        assert_eq!(g.wrapped(), n == 4);
                    }
                }
                assert_eq!(t.requests(0), 4);
                assert_eq!(t.requests(1), 4);

                let endpoint = tree.register_thread(thread_id + 1);
                let engine = Engine::new(tree, &endpoint, t);
                let remaining = AtomicUsize::new(8);
                let stop = AtomicBool::new(false);
                let scripts: Vec<Script<'_>> = scripts
                    .into_iter()
                    .map(|requests| Script {
                        requests,
                        remaining: &remaining,
                        stop: &stop,
                    })
                    .collect();
                engine.run_coroutines(scripts, &stop);
                assert_eq!(endpoint.outstanding(), 0);
            });
        }
    });

    assert_eq!(stats.total_requests(), 16);
    assert_eq!(tree.entry_count(), 4);
    for k in 1..=4 {
        assert!(session.search(&Key::Int(k)).is_some());
    }
}

#[test]
fn test_threads_contend_across_endpoints() {
    let tree = SimTree::new(SimConfig {
        leaf_count: 4,
        ..SimConfig::default()
    });
    let stats = StatsRegistry::new(2, 2);
    std::thread::scope(|s| {
        for t in 0..2usize {
            let (tree, stats) = (&tree, &stats);
            s.spawn(move || {
                let endpoint = tree.register_thread(t);
                let engine = Engine::new(tree, &endpoint, stats.thread(t));
                let mut session = engine.sync_session();
                for round in 0..200u64 {
                    session.insert(&Key::Int(round % 16), round);
                }
            });
        }
    });
    assert_eq!(tree.entry_count(), 16);
    assert_eq!(tree.dropped_inserts(), 0);
    let counters = stats.counters();
    assert!(counters.try_lock >= 400);
    assert!(counters.try_read >= 400);
}

#[test]
fn test_driver_writes_latency_and_parquet() {
    let dir = tempfile::tempdir().unwrap();
    write_workload(dir.path());
    let config = config(dir.path());

    let summaries = driver::run_local(&config).unwrap();
    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0];
    assert_eq!(summary.reports.len(), 2);
    assert_eq!(summary.reports[0].epoch, 1);
    assert!(summary.total_requests > 0);

    assert_eq!(summary.latency_files.len(), 2);
    let first = fs::read_to_string(dir.path().join("us_lat/epoch_1.lat")).unwrap();
    let lines: Vec<&str> = first.lines().collect();
    assert_eq!(lines.len(), 100_000);
    assert!(lines[0].starts_with("0.0\t"));
    assert!(lines[15].starts_with("1.5\t"));
    assert!(lines[99_999].starts_with("9999.9\t"));
    assert!(dir.path().join("us_lat/epoch_2.lat").exists());
    assert!(dir.path().join("out.parquet").exists());
}

#[test]
fn test_two_local_nodes_synthetic() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.node_count = 2;
    config.thread_count = 1;
    config.output = None;
    config.source = TxnSource::Synthetic {
        key_range: 1000,
        read_ratio: 0.5,
        distribution: KeyDistribution::Zipfian,
        pattern_len: 64,
    };

    let summaries = driver::run_local(&config).unwrap();
    assert_eq!(summaries.len(), 2);
    for (node, s) in summaries.iter().enumerate() {
        assert_eq!(s.node_id, node as u32);
        assert_eq!(s.reports.len(), 2);
        assert!(dir.path().join(format!("us_lat/node_{node}/epoch_2.lat")).exists());
    }
    // Cluster throughput is the same figure on both nodes.
    assert_eq!(summaries[0].reports[0].cluster_mops, summaries[1].reports[0].cluster_mops);
}

#[test]
fn test_failed_node_aborts_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.node_count = 2;
    config.thread_count = 1;
    config.output = None;
    config.source = TxnSource::Synthetic {
        key_range: 100,
        read_ratio: 0.5,
        distribution: KeyDistribution::Uniform,
        pattern_len: 16,
    };
    // Node 1 cannot create its latency directory.
    fs::create_dir_all(&config.latency_dir).unwrap();
    fs::write(config.latency_dir.join("node_1"), "").unwrap();

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(driver::run_local(&config));
    });
    let result = rx
        .recv_timeout(Duration::from_secs(30))
        .expect("run_local still blocked after a node failed");
    assert!(matches!(result, Err(Error::Io(_))), "{result:?}");
}

#[test]
fn test_scan_workload_runs_synchronously() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "load_randint_workloade0", "INSERT 10\nINSERT 11\nINSERT 12\n");
    write(dir.path(), "txn_randint_workloade0", "SCAN 10 5\nREAD 11\n");
    let mut config = config(dir.path());
    config.thread_count = 1;
    config.workload_idx = "e".into();
    config.output = None;
    assert!(!config.coro_mode());

    let summaries = driver::run_local(&config).unwrap();
    assert!(summaries[0].total_requests > 0);
    assert!(summaries[0].counters.try_read > 0);
}
