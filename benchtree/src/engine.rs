//! Cooperative coroutine engine.
//!
//! A worker thread hosts a fixed number of coroutine slots. Each slot is a
//! future that loops `next()` -> tree operation. Tree operations suspend
//! only while one of their one-sided operations is outstanding: every
//! posted op carries a [`WrId`] naming its coroutine, and when the engine
//! sees that id on the endpoint's completion queue it marks the op done and
//! queues the coroutine again. The ready queue is round-robin and owned by
//! the engine; futures are polled with a no-op waker.

use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::{Pin, pin};
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};

use minstant::Instant;

use crate::arena::{ArenaGeometry, PER_CORO_RDMA_BUF, ScratchArena, Slot};
use crate::generator::RequestGen;
use crate::request::{Key, Request, Value};
use crate::stats::ThreadStats;
use crate::transport::{Endpoint, RemoteAddr, RemoteOp, WrId};
use crate::tree::{TreeIndex, execute};

// ============================================================================
// Scheduler
// ============================================================================

/// Ready queue and completion board of one worker thread.
pub struct Scheduler {
    ready: RefCell<VecDeque<usize>>,
    queued: Box<[Cell<bool>]>,
    done: RefCell<HashSet<WrId>>,
    inflight: Box<[Cell<u32>]>,
    next_seq: Cell<u64>,
}

impl Scheduler {
    /// All `coro_count` slots start out ready.
    pub fn new(coro_count: usize) -> Self {
        Self {
            ready: RefCell::new((0..coro_count).collect()),
            queued: (0..coro_count).map(|_| Cell::new(true)).collect(),
            done: RefCell::new(HashSet::new()),
            inflight: (0..coro_count).map(|_| Cell::new(0)).collect(),
            next_seq: Cell::new(0),
        }
    }

    #[inline]
    pub fn coro_count(&self) -> usize {
        self.queued.len()
    }

    /// Operations posted by `coro_id` and not completed yet.
    #[inline]
    pub fn inflight(&self, coro_id: usize) -> u32 {
        self.inflight[coro_id].get()
    }

    #[inline]
    fn wake(&self, coro_id: usize) {
        if !self.queued[coro_id].replace(true) {
            self.ready.borrow_mut().push_back(coro_id);
        }
    }

    #[inline]
    fn pop_ready(&self) -> Option<usize> {
        let coro_id = self.ready.borrow_mut().pop_front()?;
        self.queued[coro_id].set(false);
        Some(coro_id)
    }

    #[inline]
    fn issue(&self, coro_id: usize) -> WrId {
        let seq = self.next_seq.get();
        self.next_seq.set(seq.wrapping_add(1));
        let c = &self.inflight[coro_id];
        c.set(c.get() + 1);
        WrId::new(coro_id, seq)
    }

    /// Record a completion reported by the endpoint.
    fn complete(&self, wr_id: WrId) {
        let coro_id = wr_id.coro_id();
        let c = &self.inflight[coro_id];
        c.set(c.get().saturating_sub(1));
        self.done.borrow_mut().insert(wr_id);
        self.wake(coro_id);
    }

    #[inline]
    fn take_done(&self, wr_id: WrId) -> bool {
        self.done.borrow_mut().remove(&wr_id)
    }

    /// Operations posted by any coroutine and not completed yet.
    pub fn outstanding(&self) -> u32 {
        self.inflight.iter().map(Cell::get).sum()
    }

    /// Poll until nothing is in flight. Completions nobody awaits any more
    /// are dropped. Arenas may only be released after this.
    fn drain<E: Endpoint>(&self, endpoint: &E) {
        let mut buf = Vec::with_capacity(16);
        while self.outstanding() > 0 {
            if self.poll_endpoint(endpoint, &mut buf) == 0 {
                std::hint::spin_loop();
            }
        }
        self.done.borrow_mut().clear();
    }

    /// Poll `endpoint` once and dispatch what it reports.
    fn poll_endpoint<E: Endpoint>(&self, endpoint: &E, buf: &mut Vec<WrId>) -> usize {
        buf.clear();
        let n = endpoint.poll(buf);
        for wr_id in buf.iter() {
            self.complete(*wr_id);
        }
        n
    }
}

/// Resolves once the work request it names has completed.
#[must_use = "an outstanding operation must be awaited before its slot is reused"]
pub struct Completion<'s> {
    sched: &'s Scheduler,
    wr_id: WrId,
}

impl Completion<'_> {
    #[inline]
    pub fn wr_id(&self) -> WrId {
        self.wr_id
    }
}

impl Future for Completion<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.sched.take_done(self.wr_id) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

/// Gives up the thread once, staying at the back of the ready queue.
pub struct YieldNow<'s> {
    sched: &'s Scheduler,
    coro_id: usize,
    yielded: bool,
}

impl Future for YieldNow<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        self.sched.wake(self.coro_id);
        Poll::Pending
    }
}

// ============================================================================
// CoroContext
// ============================================================================

/// What a tree operation gets to talk to the network: its coroutine's arena,
/// the thread's endpoint and the thread's statistics.
pub struct CoroContext<'a, E: Endpoint> {
    coro_id: usize,
    arena: &'a ScratchArena,
    endpoint: &'a E,
    sched: &'a Scheduler,
    stats: &'a ThreadStats,
}

impl<'a, E: Endpoint> CoroContext<'a, E> {
    /// The caller drains `sched` against `endpoint` before `arena` goes away.
    pub(crate) fn new(
        coro_id: usize,
        arena: &'a ScratchArena,
        endpoint: &'a E,
        sched: &'a Scheduler,
        stats: &'a ThreadStats,
    ) -> Self {
        Self {
            coro_id,
            arena,
            endpoint,
            sched,
            stats,
        }
    }

    #[inline]
    pub fn coro_id(&self) -> usize {
        self.coro_id
    }

    #[inline]
    pub fn arena(&self) -> &'a ScratchArena {
        self.arena
    }

    #[inline]
    pub fn stats(&self) -> &'a ThreadStats {
        self.stats
    }

    #[inline]
    fn issue(&self, op: RemoteOp) -> Completion<'a> {
        let wr_id = self.sched.issue(self.coro_id);
        // Safety: callers pass slots borrowed for 'a, and the engine drains
        // the scheduler before 'a ends.
        unsafe { self.endpoint.post(op, wr_id) };
        Completion {
            sched: self.sched,
            wr_id,
        }
    }

    /// Start reading `remote` into `local` without waiting; await the
    /// returned completion before touching the slot. Used to pipeline
    /// several reads.
    #[inline]
    pub fn post_read(&self, local: Slot<'a>, remote: RemoteAddr) -> Completion<'a> {
        self.issue(RemoteOp::Read {
            local: local.buf(),
            remote,
        })
    }

    pub async fn read(&self, local: Slot<'a>, remote: RemoteAddr) {
        self.post_read(local, remote).await
    }

    pub async fn write(&self, local: Slot<'a>, remote: RemoteAddr) {
        self.issue(RemoteOp::Write {
            local: local.buf(),
            remote,
        })
        .await
    }

    /// Compare-and-swap; returns the value found at `remote`.
    pub async fn cas(&self, local: Slot<'a>, remote: RemoteAddr, compare: u64, swap: u64) -> u64 {
        self.issue(RemoteOp::Cas {
            local: local.buf(),
            remote,
            compare,
            swap,
        })
        .await;
        local.read_u64()
    }

    #[inline]
    pub fn yield_now(&self) -> YieldNow<'a> {
        YieldNow {
            sched: self.sched,
            coro_id: self.coro_id,
            yielded: false,
        }
    }
}

/// Drive one future to completion on the calling thread.
pub fn block_on<E: Endpoint, F: Future>(endpoint: &E, sched: &Scheduler, fut: F) -> F::Output {
    let mut fut = pin!(fut);
    let mut cx = Context::from_waker(Waker::noop());
    let mut buf = Vec::with_capacity(16);
    loop {
        if let Poll::Ready(out) = fut.as_mut().poll(&mut cx) {
            return out;
        }
        while sched.poll_endpoint(endpoint, &mut buf) == 0 && sched.ready.borrow().is_empty() {
            std::hint::spin_loop();
        }
        while sched.pop_ready().is_some() {}
    }
}

// ============================================================================
// Engine
// ============================================================================

type Task<'a> = Pin<Box<dyn Future<Output = ()> + 'a>>;

/// Per-thread execution engine.
pub struct Engine<'e, T: TreeIndex> {
    tree: &'e T,
    endpoint: &'e T::Endpoint,
    stats: &'e ThreadStats,
    geometry: ArenaGeometry,
    budget: usize,
}

impl<'e, T: TreeIndex> Engine<'e, T> {
    pub fn new(tree: &'e T, endpoint: &'e T::Endpoint, stats: &'e ThreadStats) -> Self {
        Self {
            tree,
            endpoint,
            stats,
            geometry: ArenaGeometry::default(),
            budget: PER_CORO_RDMA_BUF,
        }
    }

    /// Arena geometry and per-coroutine budget for the slots this engine
    /// creates.
    pub fn with_arena(mut self, geometry: ArenaGeometry, budget: usize) -> Self {
        self.geometry = geometry;
        self.budget = budget;
        self
    }

    fn new_arena(&self) -> ScratchArena {
        ScratchArena::with_geometry(self.geometry, self.budget)
    }

    /// Single in-flight request execution, used for the load phase and for
    /// the non-coroutine mode.
    pub fn sync_session(&self) -> SyncSession<'_, 'e, T> {
        SyncSession {
            engine: self,
            arena: self.new_arena(),
            sched: Scheduler::new(1),
        }
    }

    /// Run one coroutine slot per generator until `stop` is set. Every
    /// completed request is recorded in the latency histogram of its slot.
    pub fn run_coroutines<G: RequestGen>(&self, generators: Vec<G>, stop: &AtomicBool) {
        let coro_count = generators.len();
        let sched = Scheduler::new(coro_count);
        let arenas: Vec<ScratchArena> = (0..coro_count).map(|_| self.new_arena()).collect();

        let mut tasks: Vec<Option<Task<'_>>> = arenas
            .iter()
            .zip(generators)
            .enumerate()
            .map(|(coro_id, (arena, mut generator))| {
                let (tree, endpoint, stats, sched) = (self.tree, self.endpoint, self.stats, &sched);
                let task: Task<'_> = Box::pin(async move {
                    let mut ctx = CoroContext::new(coro_id, arena, endpoint, sched, stats);
                    while !stop.load(Ordering::Relaxed) {
                        let request = generator.next();
                        let start = Instant::now();
                        execute(tree, &request, &mut ctx).await;
                        stats.record_latency(coro_id, start.elapsed());
                    }
                });
                Some(task)
            })
            .collect();

        let mut live = tasks.len();
        let mut cx = Context::from_waker(Waker::noop());
        let mut buf = Vec::with_capacity(64);
        while live > 0 {
            sched.poll_endpoint(self.endpoint, &mut buf);
            let Some(coro_id) = sched.pop_ready() else {
                std::hint::spin_loop();
                continue;
            };
            if let Some(task) = tasks[coro_id].as_mut() {
                if task.as_mut().poll(&mut cx).is_ready() {
                    tasks[coro_id] = None;
                    live -= 1;
                }
            }
        }
        drop(tasks);
        sched.drain(self.endpoint);
    }

    /// Issue requests one at a time until `stop` is set.
    pub fn run_sync<G: RequestGen>(&self, mut generator: G, stop: &AtomicBool) {
        let mut session = self.sync_session();
        while !stop.load(Ordering::Relaxed) {
            let request = generator.next();
            let start = Instant::now();
            session.execute(&request);
            self.stats.record_latency(0, start.elapsed());
        }
    }
}

/// One coroutine slot driven synchronously.
pub struct SyncSession<'s, 'e, T: TreeIndex> {
    engine: &'s Engine<'e, T>,
    arena: ScratchArena,
    sched: Scheduler,
}

impl<T: TreeIndex> SyncSession<'_, '_, T> {
    fn drive<'s, F: Future>(
        &'s mut self,
        op: impl FnOnce(&'s T, CoroContext<'s, T::Endpoint>) -> F,
    ) -> F::Output {
        let engine = self.engine;
        let ctx = CoroContext::new(0, &self.arena, engine.endpoint, &self.sched, engine.stats);
        let out = block_on(engine.endpoint, &self.sched, op(engine.tree, ctx));
        self.sched.drain(engine.endpoint);
        out
    }

    pub fn execute(&mut self, request: &Request) {
        self.drive(|tree, mut ctx| async move { execute(tree, request, &mut ctx).await })
    }

    pub fn insert(&mut self, key: &Key, value: Value) {
        self.drive(|tree, mut ctx| async move { tree.insert(key, value, &mut ctx).await })
    }

    pub fn search(&mut self, key: &Key) -> Option<Value> {
        self.drive(|tree, mut ctx| async move { tree.search(key, &mut ctx).await })
    }
}
