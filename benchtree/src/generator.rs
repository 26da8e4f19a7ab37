//! Per-coroutine request generators.
//!
//! One thread's transaction sequence is shared by all of its coroutines:
//! coroutine `c` of `C` replays indices `c, c + C, c + 2C, ...` (mod `L`),
//! which partitions the sequence without copying it. Once a coroutine has
//! walked past the end, it keeps replaying, and inserts are remapped so
//! they never hit a key that already exists.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::request::{Key, MAX_KEY_SPACE_SIZE, OpKind, Request, VALUE_MAX, VALUE_MIN, WorkloadEntry};
use crate::stats::ThreadStats;

/// Source of requests for one coroutine slot.
pub trait RequestGen {
    fn next(&mut self) -> Request;
}

/// Position of a coroutine slot in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoroIdentity {
    pub node_id: u32,
    pub node_count: u32,
    pub thread_id: usize,
    pub thread_count: usize,
    pub coro_id: usize,
    pub coro_count: usize,
}

impl CoroIdentity {
    /// First integer key this coroutine uses after wrapping. Distinct for
    /// every (node, thread, coroutine) of the cluster.
    pub fn key_seed(&self) -> u64 {
        let (t, c) = (self.thread_count as u64, self.coro_count as u64);
        MAX_KEY_SPACE_SIZE
            + t * c * self.node_id as u64
            + self.thread_id as u64 * c
            + self.coro_id as u64
    }

    /// Distance between two consecutive remapped keys of one coroutine:
    /// the number of coroutines in the cluster.
    pub fn key_stride(&self) -> u64 {
        (self.thread_count * self.coro_count) as u64 * self.node_count as u64
    }
}

/// Replays a preloaded request sequence.
pub struct ReplayGenerator<'a> {
    requests: &'a [WorkloadEntry],
    id: CoroIdentity,
    stats: &'a ThreadStats,
    pos: usize,
    epoch: u64,
    wrapped: bool,
    extra_key: u64,
    rng: SmallRng,
}

impl<'a> ReplayGenerator<'a> {
    /// # Panics
    /// Panics if `requests` is empty; workload loading rejects empty files.
    pub fn new(requests: &'a [WorkloadEntry], id: CoroIdentity, stats: &'a ThreadStats) -> Self {
        assert!(!requests.is_empty(), "request sequence must not be empty");
        assert!(id.coro_count > 0 && id.coro_id < id.coro_count);
        Self {
            requests,
            id,
            stats,
            pos: id.coro_id % requests.len(),
            epoch: 0,
            wrapped: false,
            extra_key: id.key_seed(),
            rng: SmallRng::seed_from_u64(id.key_seed().rotate_left(17) ^ 0x9e37_79b9_7f4a_7c15),
        }
    }

    /// Completed passes over the sequence.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether the sequence has been replayed in full at least once.
    #[inline]
    pub fn wrapped(&self) -> bool {
        self.wrapped
    }

    fn insert_key(&mut self, key: &Key) -> Key {
        match key {
            Key::Str(_) => key.with_epoch(self.epoch),
            Key::Int(_) if self.wrapped => {
                let k = self.extra_key;
                self.extra_key += self.id.key_stride();
                Key::Int(k)
            }
            Key::Int(_) => key.clone(),
        }
    }
}

impl RequestGen for ReplayGenerator<'_> {
    fn next(&mut self) -> Request {
        let requests = self.requests;
        let entry = &requests[self.pos];
        let value = self.rng.random_range(VALUE_MIN..=VALUE_MAX);
        let request = match entry.op {
            OpKind::Read => Request::Search {
                key: entry.key.clone(),
            },
            OpKind::Update => Request::Update {
                key: entry.key.clone(),
                value,
            },
            OpKind::Scan => Request::Scan {
                key: entry.key.clone(),
                range_size: entry.range_size,
            },
            OpKind::Insert => Request::Insert {
                key: self.insert_key(&entry.key),
                value,
            },
        };

        self.pos += self.id.coro_count;
        if self.pos >= self.requests.len() {
            self.pos %= self.requests.len();
            self.epoch += 1;
            self.wrapped = true;
        }

        self.stats.record_request(self.id.coro_id);
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(op: OpKind, n: u64) -> Vec<WorkloadEntry> {
        (0..n)
            .map(|k| WorkloadEntry {
                op,
                key: Key::Int(k),
                range_size: 0,
            })
            .collect()
    }

    fn ident(coro_id: usize, coro_count: usize) -> CoroIdentity {
        CoroIdentity {
            node_id: 0,
            node_count: 1,
            thread_id: 0,
            thread_count: 1,
            coro_id,
            coro_count,
        }
    }

    #[test]
    fn test_round_robin_starts_at_coro_id() {
        let reqs = entries(OpKind::Read, 8);
        let stats = ThreadStats::new(2);
        let mut g1 = ReplayGenerator::new(&reqs, ident(1, 2), &stats);
        let keys: Vec<Key> = (0..5).map(|_| g1.next().key().clone()).collect();
        assert_eq!(keys, [1, 3, 5, 7, 1].map(Key::Int).to_vec());
        assert_eq!(g1.epoch(), 1);
        assert_eq!(stats.requests(1), 5);
        assert_eq!(stats.requests(0), 0);
    }

    #[test]
    fn test_wrap_flag_after_full_pass() {
        let reqs = entries(OpKind::Read, 4);
        let stats = ThreadStats::new(2);
        let mut g = ReplayGenerator::new(&reqs, ident(0, 2), &stats);
        g.next();
        assert!(!g.wrapped());
        g.next();
        assert!(g.wrapped());
        assert_eq!(g.epoch(), 1);
    }

    #[test]
    fn test_first_pass_inserts_keep_keys() {
        let reqs = entries(OpKind::Insert, 4);
        let stats = ThreadStats::new(1);
        let mut g = ReplayGenerator::new(&reqs, ident(0, 1), &stats);
        let first: Vec<Key> = (0..4).map(|_| g.next().key().clone()).collect();
        assert_eq!(first, (0..4).map(Key::Int).collect::<Vec<_>>());
        // Replays come from the private counter.
        assert_eq!(g.next().key(), &Key::Int(MAX_KEY_SPACE_SIZE));
        assert_eq!(g.next().key(), &Key::Int(MAX_KEY_SPACE_SIZE + 1));
    }

    #[test]
    fn test_string_insert_replay_gets_epoch_suffix() {
        let reqs = vec![WorkloadEntry {
            op: OpKind::Insert,
            key: Key::Str("a@b.c".into()),
            range_size: 0,
        }];
        let stats = ThreadStats::new(1);
        let mut g = ReplayGenerator::new(&reqs, ident(0, 1), &stats);
        assert_eq!(g.next().key(), &Key::Str("a@b.c".into()));
        assert_eq!(g.next().key(), &Key::Str("a@b.c#1".into()));
        assert_eq!(g.next().key(), &Key::Str("a@b.c#2".into()));
    }

    #[test]
    fn test_single_entry_epoch_passes_u32() {
        let reqs = vec![WorkloadEntry {
            op: OpKind::Insert,
            key: Key::Str("k".into()),
            range_size: 0,
        }];
        let stats = ThreadStats::new(1);
        let mut g = ReplayGenerator::new(&reqs, ident(0, 1), &stats);
        g.epoch = u64::from(u32::MAX);
        assert_eq!(g.next().key(), &Key::Str(format!("k#{}", u32::MAX)));
        assert_eq!(g.next().key(), &Key::Str("k#4294967296".into()));
        assert_eq!(g.epoch(), u64::from(u32::MAX) + 2);
    }

    #[test]
    fn test_value_regenerated_every_call() {
        let reqs = entries(OpKind::Update, 1);
        let stats = ThreadStats::new(1);
        let mut g = ReplayGenerator::new(&reqs, ident(0, 1), &stats);
        let values: Vec<u64> = (0..16)
            .map(|_| match g.next() {
                Request::Update { value, .. } => value,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert!(values.iter().all(|v| (VALUE_MIN..=VALUE_MAX).contains(v)));
        let mut dedup = values.clone();
        dedup.sort();
        dedup.dedup();
        assert!(dedup.len() > 1);
    }

    #[test]
    fn test_scan_carries_range() {
        let reqs = vec![WorkloadEntry {
            op: OpKind::Scan,
            key: Key::Int(10),
            range_size: 50,
        }];
        let stats = ThreadStats::new(1);
        let mut g = ReplayGenerator::new(&reqs, ident(0, 1), &stats);
        assert_eq!(
            g.next(),
            Request::Scan {
                key: Key::Int(10),
                range_size: 50
            }
        );
    }

    #[test]
    fn test_more_coroutines_than_requests() {
        let reqs = entries(OpKind::Read, 2);
        let stats = ThreadStats::new(4);
        let mut g = ReplayGenerator::new(&reqs, ident(3, 4), &stats);
        assert_eq!(g.next().key(), &Key::Int(1));
        assert!(g.wrapped());
    }
}
