//! The real one-sided RMA backend, over the `mpi` crate's window
//! primitives. Wraps the raw put/get/fence calls behind the narrow
//! [`crate::window::RmaWindow`] trait so the mirror logic itself never
//! names an MPI type.

use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use mpi::window::WindowOperations;
use parking_lot::Mutex;

use vcache_core::CacheError;

use crate::window::{RmaWindow, WindowFactory};

/// Owns this rank's exposed window over its backing buffer. Construction
/// is collective: every rank in `comm` must call `MpiRmaWindow::create`
/// with a buffer of its own local size (the sizes may differ across
/// ranks under an uneven partition).
pub struct MpiRmaWindow {
    comm: SimpleCommunicator,
    // The window must outlive every put/get against it; `local_buffer`
    // backs the exposed memory and is never read directly by this rank
    // except through the window (other ranks' one-sided puts land here).
    local_buffer: Mutex<Vec<u8>>,
    window: mpi::window::Window<'static, u8>,
}

// SAFETY: `window` borrows `local_buffer` for the process lifetime of the
// mirror; both are torn down together by `destroy_read_mirror`'s
// win_free-then-free ordering.
unsafe impl Send for MpiRmaWindow {}
unsafe impl Sync for MpiRmaWindow {}

impl MpiRmaWindow {
    /// Create a window exposing `local_bytes` of this rank's buffer.
    /// Collective over `comm`: every rank must call this before any rank
    /// fences.
    pub fn create(comm: &SimpleCommunicator, local_bytes: usize) -> Self {
        tracing::info!(rank = comm.rank(), bytes = local_bytes, "creating RMA window for read mirror");
        let mut buffer = vec![0u8; local_bytes];
        // SAFETY: `buffer`'s allocation is pinned behind the `Mutex` for
        // the window's entire lifetime; the window is dropped (via
        // `destroy_read_mirror`) before the buffer is freed.
        let window = unsafe {
            std::mem::transmute::<mpi::window::Window<'_, u8>, mpi::window::Window<'static, u8>>(
                comm.window_create(&mut buffer),
            )
        };
        Self {
            comm: comm.duplicate(),
            local_buffer: Mutex::new(buffer),
            window,
        }
    }
}

impl RmaWindow for MpiRmaWindow {
    fn rank(&self) -> i32 {
        self.comm.rank()
    }

    fn num_ranks(&self) -> i32 {
        self.comm.size()
    }

    fn begin_fence(&self, read_only: bool) {
        let mut assert = mpi::ffi::MPI_MODE_NOPRECEDE;
        if read_only {
            assert |= mpi::ffi::MPI_MODE_NOPUT;
        }
        self.window.fence(assert as i32);
    }

    fn end_fence(&self) {
        self.window.fence(mpi::ffi::MPI_MODE_NOSUCCEED as i32);
    }

    fn put(&self, target_rank: i32, target_offset: u64, data: &[u8]) -> Result<(), CacheError> {
        self.window.put(data, target_rank, target_offset as usize);
        Ok(())
    }

    fn get(&self, target_rank: i32, target_offset: u64, dst: &mut [u8]) -> Result<(), CacheError> {
        self.window.get(dst, target_rank, target_offset as usize);
        Ok(())
    }

    fn allreduce_and(&self, local: bool) -> bool {
        let local_i: i32 = if local { 1 } else { 0 };
        let mut result: i32 = 0;
        self.comm
            .all_reduce_into(&local_i, &mut result, mpi::collective::SystemOperation::logical_and());
        result != 0
    }
}

/// Builds one `MpiRmaWindow` per opened dataset over a file's (duplicated)
/// communicator, the real-MPI counterpart to
/// `window::local::LocalWindowFactory`. `vcache-shim`'s File Cache holds
/// one of these per open file and calls `create_window` once per dataset
/// opened with read caching enabled.
pub struct MpiWindowFactory {
    comm: SimpleCommunicator,
}

impl MpiWindowFactory {
    pub fn new(comm: SimpleCommunicator) -> Self {
        Self { comm }
    }
}

impl WindowFactory for MpiWindowFactory {
    fn create_window(&self, local_bytes: u64) -> std::sync::Arc<dyn RmaWindow> {
        std::sync::Arc::new(MpiRmaWindow::create(&self.comm, local_bytes as usize))
    }

    fn rank(&self) -> i32 {
        self.comm.rank()
    }

    fn num_ranks(&self) -> i32 {
        self.comm.size()
    }
}
