//! Node-local communicator setup. Real communicator splitting and window
//! creation are external-library calls the core merely invokes; this
//! module is the thin seam where `vcache-shim`'s File Cache reaches into
//! the `mpi` crate for exactly that, nothing more.

use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

/// A file's global communicator plus the node-local communicator split off
/// it, with the node-local I/O node elected (rank 0 in the node-local
/// communicator).
pub struct NodeTopology {
    pub world_rank: i32,
    pub world_size: i32,
    pub node_comm: SimpleCommunicator,
    pub node_rank: i32,
    pub node_size: i32,
}

impl NodeTopology {
    /// Split `world` by shared-memory locality (`MPI_Comm_split_type` with
    /// `MPI_COMM_TYPE_SHARED`, wrapped by the `mpi` crate's
    /// `split_shared`). `MPI_THREAD_MULTIPLE` must already have been
    /// requested at `mpi::initialize_with_threading` time, since the main
    /// thread fences windows while the slow store's async runtime may
    /// concurrently perform I/O.
    pub fn init(world: &SimpleCommunicator) -> Self {
        let node_comm = world.split_shared(world.rank());
        Self {
            world_rank: world.rank(),
            world_size: world.size(),
            node_rank: node_comm.rank(),
            node_size: node_comm.size(),
            node_comm,
        }
    }

    /// Rank 0 in the node-local communicator is the elected I/O node:
    /// only it purges folders on release (`StoragePool::purge`) and, by
    /// convention, emits file-system log lines gated by `IO_NODE`.
    pub fn is_node_io_node(&self) -> bool {
        self.node_rank == 0
    }
}
