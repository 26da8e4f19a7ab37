use mpi::collective::{CommunicatorCollectives, SystemOperation};
use mpi::environment::Universe;
use mpi::topology::{Communicator, SimpleCommunicator};

use crate::error::{Error, Result};
use crate::transport::Cluster;

/// Cluster of MPI ranks, one rank per node.
///
/// MPI is initialized with `Threading::Serialized`: collectives may come
/// from any thread, but never from two threads at once. The driver calls
/// them from the main thread, except for the warm-up barrier which worker
/// 0 enters while the main thread is spinning on the ready flag.
pub struct MpiCluster {
    world: SimpleCommunicator,
    rank: u32,
    size: u32,
    _universe: Universe,
}

// SAFETY: see the threading note on the type; calls are never concurrent.
unsafe impl Send for MpiCluster {}
unsafe impl Sync for MpiCluster {}

impl MpiCluster {
    pub fn init() -> Result<Self> {
        let (universe, threading) = mpi::initialize_with_threading(mpi::Threading::Serialized)
            .ok_or_else(|| Error::InvalidConfig("MPI is already initialized".into()))?;
        if threading < mpi::Threading::Serialized {
            tracing::warn!(?threading, "MPI library offers less than serialized threading");
        }
        let world = universe.world();
        Ok(Self {
            rank: world.rank() as u32,
            size: world.size() as u32,
            world,
            _universe: universe,
        })
    }
}

impl Cluster for MpiCluster {
    fn node_id(&self) -> u32 {
        self.rank
    }

    fn node_count(&self) -> u32 {
        self.size
    }

    fn barrier(&self, tag: &str) -> Result<()> {
        tracing::debug!(rank = self.rank, tag, "barrier");
        self.world.barrier();
        Ok(())
    }

    fn sum(&self, value: u64) -> Result<u64> {
        let mut total = 0u64;
        self.world
            .all_reduce_into(&value, &mut total, SystemOperation::sum());
        Ok(total)
    }

    /// `MPI_Abort` on the world communicator; takes every rank down.
    fn abort(&self) {
        tracing::error!(rank = self.rank, "aborting MPI job");
        self.world.abort(1)
    }
}
