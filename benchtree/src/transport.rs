//! Boundary to the one-sided transport and the cluster.
//!
//! The tree issues [`RemoteOp`]s through a per-thread [`Endpoint`]; the
//! endpoint reports finished work requests by id when polled. The engine
//! maps a [`WrId`] back to the coroutine that posted it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::arena::LocalBuf;
use crate::error::{Error, Result};

/// Address in a memory node's registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteAddr {
    pub node: u16,
    pub offset: u64,
}

impl RemoteAddr {
    #[inline]
    pub const fn new(node: u16, offset: u64) -> Self {
        Self { node, offset }
    }
}

/// One-sided verb. The local side is always arena memory and its length is
/// the transfer length.
#[derive(Debug, Clone, Copy)]
pub enum RemoteOp {
    /// Copy `local.len()` bytes from `remote` into `local`.
    Read { local: LocalBuf, remote: RemoteAddr },
    /// Copy `local.len()` bytes from `local` to `remote`.
    Write { local: LocalBuf, remote: RemoteAddr },
    /// 8-byte compare-and-swap at `remote`; the old value lands in `local`.
    Cas {
        local: LocalBuf,
        remote: RemoteAddr,
        compare: u64,
        swap: u64,
    },
}

const CORO_SHIFT: u32 = 48;
const SEQ_MASK: u64 = (1 << CORO_SHIFT) - 1;

/// Work request id: owning coroutine in the upper 16 bits, a per-thread
/// sequence number below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WrId(u64);

impl WrId {
    #[inline]
    pub fn new(coro_id: usize, seq: u64) -> Self {
        debug_assert!(coro_id < (1 << (64 - CORO_SHIFT)));
        Self(((coro_id as u64) << CORO_SHIFT) | (seq & SEQ_MASK))
    }

    #[inline]
    pub fn coro_id(self) -> usize {
        (self.0 >> CORO_SHIFT) as usize
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Per-thread transport resources (queue pair + completion queue).
pub trait Endpoint {
    /// Post a one-sided operation.
    ///
    /// # Safety
    /// The arena owning the local buffer must stay alive until `wr_id` is
    /// reported by [`Endpoint::poll`]; the endpoint accesses it until then.
    unsafe fn post(&self, op: RemoteOp, wr_id: WrId);

    /// Append finished work requests to `done`; returns how many were added.
    fn poll(&self, done: &mut Vec<WrId>) -> usize;
}

/// Cluster membership and collectives.
pub trait Cluster: Send + Sync {
    fn node_id(&self) -> u32;

    fn node_count(&self) -> u32;

    /// Block until every node reached the barrier named `tag`. Fails once
    /// another node has aborted.
    fn barrier(&self, tag: &str) -> Result<()>;

    /// Sum `value` over all nodes. Only node 0's result is meaningful.
    fn sum(&self, value: u64) -> Result<u64>;

    /// Give up on the run. Nodes blocked in a collective, or entering one
    /// later, fail instead of waiting for this node.
    fn abort(&self);
}

// ============================================================================
// LocalCluster
// ============================================================================

#[derive(Default)]
struct BarrierState {
    arrived: u32,
    generation: u64,
    aborted: bool,
}

struct LocalShared {
    state: Mutex<BarrierState>,
    cvar: Condvar,
    acc: AtomicU64,
}

impl LocalShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState::default()),
            cvar: Condvar::new(),
            acc: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait(&self, node_count: u32) -> Result<()> {
        let mut state = self.lock();
        if state.aborted {
            return Err(Error::ClusterAborted);
        }
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == node_count {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(());
        }
        while state.generation == generation && !state.aborted {
            state = self.cvar.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        if state.generation == generation {
            Err(Error::ClusterAborted)
        } else {
            Ok(())
        }
    }

    fn abort(&self) {
        self.lock().aborted = true;
        self.cvar.notify_all();
    }
}

/// In-process cluster. A group of `n` handles behaves like `n` nodes, each
/// driven from its own thread.
pub struct LocalCluster {
    node_id: u32,
    node_count: u32,
    shared: Arc<LocalShared>,
}

impl LocalCluster {
    /// Single-node cluster.
    pub fn single() -> Self {
        Self {
            node_id: 0,
            node_count: 1,
            shared: Arc::new(LocalShared::new()),
        }
    }

    /// `n` handles sharing barriers and reductions.
    pub fn group(n: u32) -> Vec<Self> {
        let n = n.max(1);
        let shared = Arc::new(LocalShared::new());
        (0..n)
            .map(|node_id| Self {
                node_id,
                node_count: n,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl Cluster for LocalCluster {
    fn node_id(&self) -> u32 {
        self.node_id
    }

    fn node_count(&self) -> u32 {
        self.node_count
    }

    fn barrier(&self, tag: &str) -> Result<()> {
        tracing::debug!(node = self.node_id, tag, "barrier");
        self.shared.wait(self.node_count)
    }

    fn sum(&self, value: u64) -> Result<u64> {
        self.shared.acc.fetch_add(value, Ordering::AcqRel);
        self.shared.wait(self.node_count)?;
        let total = self.shared.acc.load(Ordering::Acquire);
        self.shared.wait(self.node_count)?;
        if self.node_id == 0 {
            self.shared.acc.store(0, Ordering::Release);
        }
        self.shared.wait(self.node_count)?;
        Ok(total)
    }

    fn abort(&self) {
        tracing::warn!(node = self.node_id, "aborting cluster");
        self.shared.abort();
    }
}
