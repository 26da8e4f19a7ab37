//! In-process stand-in for the remote memory node and the tree on top of it.
//!
//! [`SimEndpoint`] queues one-sided operations and applies them to a shared
//! word array only when they complete, a random number of polls later, so
//! completions land late and out of order just like on a real queue pair.
//! A slot reused too early therefore really gets clobbered.
//!
//! [`SimTree`] is a flat leaf index, not a B+-tree: a key's home leaf is
//! fixed by its value, full leaves spill into the next leaf (their sibling),
//! writers take a per-leaf CAS lock, readers validate front/rear page
//! versions and retry torn reads. It exercises every arena region the way a
//! remote tree does.
//!
//! Leaf page layout, in 8-byte words (`W = page_size / 8`):
//!
//! ```text
//! [0] front version  [1] count  [2] flags  [3..3+2*cap] (key, value)...  [W-1] rear version
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::arena::{LEAF_PAGE_SIZE, Slot};
use crate::engine::{Completion, CoroContext};
use crate::request::{Key, Value};
use crate::stats::Counter;
use crate::transport::{Endpoint, RemoteAddr, RemoteOp, WrId};
use crate::tree::TreeIndex;

const WORD: usize = 8;
const FRONT: usize = 0;
const COUNT: usize = 1;
const FLAGS: usize = 2;
const PAIRS: usize = 3;
const FLAG_OVERFLOW: u64 = 1;

/// Consecutive integer keys sharing a home leaf.
const KEYS_PER_SPAN: u64 = 8;
/// Leaves a key may spill over before an insert is dropped.
const MAX_PROBE: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    pub leaf_count: usize,
    /// Must match the page size of the arenas used against this tree.
    pub page_size: usize,
    /// Polls before a posted operation completes, inclusive range.
    pub min_delay: u32,
    pub max_delay: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            leaf_count: 16 * 1024,
            page_size: LEAF_PAGE_SIZE,
            min_delay: 1,
            max_delay: 4,
        }
    }
}

// ============================================================================
// Remote memory
// ============================================================================

struct SimMemory {
    words: Box<[AtomicU64]>,
}

impl SimMemory {
    fn new(bytes: usize) -> Self {
        Self {
            words: (0..bytes / WORD).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    fn word(&self, remote: RemoteAddr, i: usize) -> &AtomicU64 {
        debug_assert_eq!(remote.offset % WORD as u64, 0);
        &self.words[remote.offset as usize / WORD + i]
    }

    /// Reads copy from the last word down, writes from the first word up.
    /// A page read overlapping a page write then sees the rear version of
    /// the older write and the front version of the newer one, so the
    /// version check catches the mix.
    ///
    /// # Safety
    /// The arena owning `op`'s local buffer must be alive.
    unsafe fn apply(&self, op: &RemoteOp) {
        match *op {
            RemoteOp::Read { local, remote } => {
                for i in (0..local.words()).rev() {
                    let v = self.word(remote, i).load(Ordering::Acquire);
                    unsafe { local.write_word(i, v) };
                }
            }
            RemoteOp::Write { local, remote } => {
                for i in 0..local.words() {
                    let v = unsafe { local.read_word(i) };
                    self.word(remote, i).store(v, Ordering::Release);
                }
            }
            RemoteOp::Cas {
                local,
                remote,
                compare,
                swap,
            } => {
                let old = match self.word(remote, 0).compare_exchange(
                    compare,
                    swap,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(v) | Err(v) => v,
                };
                unsafe { local.write_word(0, old) };
            }
        }
    }
}

// ============================================================================
// SimEndpoint
// ============================================================================

struct InFlight {
    op: RemoteOp,
    wr_id: WrId,
    remaining: u32,
}

/// Per-thread queue pair of the simulator.
pub struct SimEndpoint {
    memory: Arc<SimMemory>,
    queue: RefCell<Vec<InFlight>>,
    rng: RefCell<SmallRng>,
    min_delay: u32,
    max_delay: u32,
}

impl SimEndpoint {
    /// Operations posted and not yet completed.
    pub fn outstanding(&self) -> usize {
        self.queue.borrow().len()
    }
}

impl Endpoint for SimEndpoint {
    unsafe fn post(&self, op: RemoteOp, wr_id: WrId) {
        let remaining = self
            .rng
            .borrow_mut()
            .random_range(self.min_delay..=self.max_delay);
        self.queue.borrow_mut().push(InFlight {
            op,
            wr_id,
            remaining,
        });
    }

    fn poll(&self, done: &mut Vec<WrId>) -> usize {
        let mut n = 0;
        self.queue.borrow_mut().retain_mut(|f| {
            if f.remaining > 0 {
                f.remaining -= 1;
                return true;
            }
            // Safety: `post` callers keep the arena alive until this poll.
            unsafe { self.memory.apply(&f.op) };
            done.push(f.wr_id);
            n += 1;
            false
        });
        n
    }
}

// ============================================================================
// SimTree
// ============================================================================

/// Flat leaf index over simulated remote memory.
pub struct SimTree {
    config: SimConfig,
    memory: Arc<SimMemory>,
    /// Leaves whose path has been fetched at least once.
    cached: Box<[AtomicBool]>,
    capacity: usize,
    dropped: AtomicU64,
}

impl SimTree {
    pub fn new(config: SimConfig) -> Self {
        assert!(config.leaf_count > 0);
        assert!(config.page_size % WORD == 0 && config.page_size >= 6 * WORD);
        assert!(config.min_delay <= config.max_delay);
        let bytes = config.leaf_count * WORD + config.page_size * (config.leaf_count + 1);
        Self {
            config,
            memory: Arc::new(SimMemory::new(bytes)),
            cached: (0..config.leaf_count).map(|_| AtomicBool::new(false)).collect(),
            capacity: (config.page_size / WORD - PAIRS - 1) / 2,
            dropped: AtomicU64::new(0),
        }
    }

    /// Entries a single leaf holds.
    #[inline]
    pub fn leaf_capacity(&self) -> usize {
        self.capacity
    }

    /// Inserts dropped because every probed leaf was full.
    pub fn dropped_inserts(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Entries stored, read directly from memory.
    pub fn entry_count(&self) -> u64 {
        (0..self.config.leaf_count)
            .map(|leaf| self.memory.word(self.leaf_addr(leaf), COUNT).load(Ordering::Acquire))
            .sum()
    }

    #[inline]
    fn lock_addr(&self, leaf: usize) -> RemoteAddr {
        RemoteAddr::new(0, (leaf * WORD) as u64)
    }

    #[inline]
    fn root_addr(&self) -> RemoteAddr {
        RemoteAddr::new(0, (self.config.leaf_count * WORD) as u64)
    }

    #[inline]
    fn leaf_addr(&self, leaf: usize) -> RemoteAddr {
        let base = self.config.leaf_count * WORD + self.config.page_size;
        RemoteAddr::new(0, (base + leaf * self.config.page_size) as u64)
    }

    #[inline]
    fn home_leaf(&self, key: u64) -> usize {
        ((key / KEYS_PER_SPAN) % self.config.leaf_count as u64) as usize
    }

    #[inline]
    fn next_leaf(&self, leaf: usize) -> usize {
        (leaf + 1) % self.config.leaf_count
    }

    /// Fetch the path to `leaf` unless it is cached. The root read is
    /// returned pending so it overlaps with the leaf read.
    fn locate<'a>(
        &self,
        leaf: usize,
        ctx: &mut CoroContext<'a, SimEndpoint>,
    ) -> Option<Completion<'a>> {
        if self.cached[leaf].load(Ordering::Relaxed) {
            ctx.stats().incr(Counter::CacheHit);
            return None;
        }
        ctx.stats().incr(Counter::CacheMiss);
        let slot = ctx.arena().acquire_page_slot();
        let pending = ctx.post_read(slot, self.root_addr());
        self.cached[leaf].store(true, Ordering::Relaxed);
        Some(pending)
    }

    /// Read `leaf` into `slot` until front and rear versions agree.
    async fn read_leaf<'a>(
        &self,
        leaf: usize,
        slot: Slot<'a>,
        ctx: &mut CoroContext<'a, SimEndpoint>,
    ) {
        debug_assert_eq!(slot.len(), self.config.page_size);
        let last = slot.words() - 1;
        loop {
            ctx.stats().incr(Counter::TryRead);
            ctx.read(slot, self.leaf_addr(leaf)).await;
            if slot.read_word(FRONT) == slot.read_word(last) {
                return;
            }
            ctx.stats().incr(Counter::ReadRetry);
        }
    }

    async fn lock(&self, leaf: usize, ctx: &mut CoroContext<'_, SimEndpoint>) {
        let tag = ctx.coro_id() as u64 + 1;
        loop {
            ctx.stats().incr(Counter::TryLock);
            let slot = ctx.arena().acquire_cas_slot();
            let zero = ctx.arena().zero_sentinel().read_u64();
            let old = ctx.cas(slot, self.lock_addr(leaf), zero, tag).await;
            if old == zero {
                return;
            }
            ctx.stats().incr(Counter::LockFail);
            ctx.yield_now().await;
        }
    }

    async fn unlock(&self, leaf: usize, ctx: &mut CoroContext<'_, SimEndpoint>) {
        let slot = ctx.arena().unlock_slot();
        slot.write_u64(0);
        ctx.write(slot, self.lock_addr(leaf)).await;
    }

    /// Bump the page version and write the page back.
    async fn write_leaf<'a>(
        &self,
        leaf: usize,
        slot: Slot<'a>,
        ctx: &mut CoroContext<'a, SimEndpoint>,
    ) {
        let last = slot.words() - 1;
        let version = slot.read_word(FRONT) + 1;
        slot.write_word(FRONT, version);
        slot.write_word(last, version);
        ctx.write(slot, self.leaf_addr(leaf)).await;
    }

    fn find(&self, slot: Slot<'_>, key: u64) -> Option<usize> {
        let count = (slot.read_word(COUNT) as usize).min(self.capacity);
        (0..count).find(|i| slot.read_word(PAIRS + 2 * i) == key)
    }
}

impl TreeIndex for SimTree {
    type Endpoint = SimEndpoint;

    fn register_thread(&self, thread_id: usize) -> SimEndpoint {
        SimEndpoint {
            memory: Arc::clone(&self.memory),
            queue: RefCell::new(Vec::with_capacity(256)),
            rng: RefCell::new(SmallRng::seed_from_u64(0x5eed ^ thread_id as u64)),
            min_delay: self.config.min_delay,
            max_delay: self.config.max_delay,
        }
    }

    async fn search(&self, key: &Key, ctx: &mut CoroContext<'_, SimEndpoint>) -> Option<Value> {
        let k = key.to_u64();
        let mut leaf = self.home_leaf(k);
        let root = self.locate(leaf, ctx);

        let mut found = None;
        for probe in 0..MAX_PROBE {
            let slot = if probe == 0 {
                ctx.arena().acquire_page_slot()
            } else {
                ctx.arena().acquire_sibling_slot()
            };
            self.read_leaf(leaf, slot, ctx).await;
            if let Some(i) = self.find(slot, k) {
                found = Some(slot.read_word(PAIRS + 2 * i + 1));
                break;
            }
            if slot.read_word(FLAGS) & FLAG_OVERFLOW == 0 {
                break;
            }
            leaf = self.next_leaf(leaf);
        }

        if let Some(root) = root {
            root.await;
        }
        found
    }

    async fn insert(&self, key: &Key, value: Value, ctx: &mut CoroContext<'_, SimEndpoint>) {
        let k = key.to_u64();
        let mut leaf = self.home_leaf(k);
        if let Some(root) = self.locate(leaf, ctx) {
            root.await;
        }

        for probe in 0..MAX_PROBE {
            self.lock(leaf, ctx).await;
            let slot = if probe == 0 {
                ctx.arena().acquire_page_slot()
            } else {
                ctx.arena().acquire_sibling_slot()
            };
            self.read_leaf(leaf, slot, ctx).await;

            let count = slot.read_word(COUNT) as usize;
            let placed = match self.find(slot, k) {
                Some(i) => {
                    slot.write_word(PAIRS + 2 * i + 1, value);
                    true
                }
                None if count < self.capacity => {
                    slot.write_word(PAIRS + 2 * count, k);
                    slot.write_word(PAIRS + 2 * count + 1, value);
                    slot.write_word(COUNT, count as u64 + 1);
                    true
                }
                None => {
                    slot.write_word(FLAGS, slot.read_word(FLAGS) | FLAG_OVERFLOW);
                    false
                }
            };
            self.write_leaf(leaf, slot, ctx).await;
            self.unlock(leaf, ctx).await;
            if placed {
                return;
            }
            leaf = self.next_leaf(leaf);
        }

        if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
            tracing::warn!(key = %key, "simulated index full around key, dropping inserts");
        }
    }

    async fn range_query(
        &self,
        low: &Key,
        high: &Key,
        ctx: &mut CoroContext<'_, SimEndpoint>,
    ) -> BTreeMap<Key, Value> {
        let mut out = BTreeMap::new();
        let (Key::Int(lo), Key::Int(hi)) = (low, high) else {
            return out;
        };
        if lo >= hi {
            return out;
        }

        let spans = ((hi - 1) / KEYS_PER_SPAN - lo / KEYS_PER_SPAN + 1)
            .min(self.config.leaf_count as u64) as usize;
        let first = self.home_leaf(*lo);
        let slot = ctx.arena().range_slot();
        for s in 0..spans {
            let mut leaf = (first + s) % self.config.leaf_count;
            for _ in 0..MAX_PROBE {
                self.read_leaf(leaf, slot, ctx).await;
                let count = (slot.read_word(COUNT) as usize).min(self.capacity);
                for i in 0..count {
                    let k = slot.read_word(PAIRS + 2 * i);
                    if (*lo..*hi).contains(&k) {
                        out.insert(Key::Int(k), slot.read_word(PAIRS + 2 * i + 1));
                    }
                }
                if slot.read_word(FLAGS) & FLAG_OVERFLOW == 0 {
                    break;
                }
                leaf = self.next_leaf(leaf);
            }
        }
        out
    }

    fn height(&self) -> u32 {
        2
    }
}
