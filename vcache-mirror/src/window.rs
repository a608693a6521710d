//! The one-sided RMA transport a [`crate::ReadMirror`] puts/gets through.
//!
//! Every remote-access phase is bracketed by a begin-fence (`no_precede`)
//! and an end-fence (`no_succeed`), with read-only phases additionally
//! passing `no_put`. This is expressed as a narrow trait so the mirror's
//! put-on-write-back / get-on-read logic never touches the `mpi` crate
//! directly, mirroring how `vcache-storage::StorageBackend` keeps the
//! engine's branches out of the capability implementation.

use vcache_core::CacheError;

/// A fenced one-sided-access phase. Dropping it ends the phase with the
/// appropriate end-fence; callers open one via
/// [`RmaWindow::begin_access`].
pub struct AccessPhase<'w> {
    window: &'w dyn RmaWindow,
}

impl<'w> Drop for AccessPhase<'w> {
    fn drop(&mut self) {
        self.window.end_fence();
    }
}

/// The capability a [`crate::ReadMirror`] needs from the MPI one-sided
/// runtime: a window over this rank's portion of the mirror, plus
/// put/get addressed by (target rank, byte offset).
pub trait RmaWindow: Send + Sync {
    fn rank(&self) -> i32;
    fn num_ranks(&self) -> i32;

    /// Begin a fenced access phase. `read_only` adds `no_put` to the
    /// begin-fence.
    fn begin_fence(&self, read_only: bool);
    fn end_fence(&self);

    /// One-sided put of `data` into `target_rank`'s window at
    /// `target_offset` bytes.
    fn put(&self, target_rank: i32, target_offset: u64, data: &[u8]) -> Result<(), CacheError>;

    /// One-sided get of `len` bytes from `target_rank`'s window at
    /// `target_offset` into `dst` (which must be at least `len` long).
    fn get(&self, target_rank: i32, target_offset: u64, dst: &mut [u8]) -> Result<(), CacheError>;

    /// Collective logical-AND across all ranks, used to decide whether a
    /// dataset's mirror is fully cached on every rank at once.
    fn allreduce_and(&self, local: bool) -> bool;
}

/// RAII helper: open a fenced phase and make sure it's closed even on an
/// early return.
pub fn fenced_phase(window: &dyn RmaWindow, read_only: bool) -> AccessPhase<'_> {
    window.begin_fence(read_only);
    AccessPhase { window }
}

/// Constructs the window a dataset's Read Mirror opens. Kept separate
/// from `RmaWindow` itself so `vcache-shim`'s File Cache can create one
/// window per opened dataset without naming the `mpi` crate, the same
/// way it never names a `StorageBackend` implementation directly.
pub trait WindowFactory: Send + Sync {
    fn create_window(&self, local_bytes: u64) -> std::sync::Arc<dyn RmaWindow>;
    fn rank(&self) -> i32;
    fn num_ranks(&self) -> i32;
}

/// An in-process stand-in for the MPI window: every simulated rank's
/// handle points into one shared fabric. Used by this crate's own unit
/// tests, by `vcache-shim`'s single-process demo/integration tests, and
/// by the `vcache-demo` binary's no-MPI mode to exercise multi-rank
/// behavior in one process without `mpirun`.
pub mod local {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use vcache_core::CacheError;

    use super::{RmaWindow, WindowFactory};

    /// Shared backing store every simulated rank's handle points into.
    pub struct LocalRmaFabric {
        buffers: Vec<Mutex<Vec<u8>>>,
        /// Votes for the most recent `allreduce_and`; a real MPI collective
        /// blocks until every rank contributes, which a single-process
        /// simulation can't do: tests must call `allreduce_and` for every
        /// rank (in any order) before reading the result.
        and_votes: Mutex<Vec<bool>>,
    }

    impl LocalRmaFabric {
        pub fn new(num_ranks: usize, bytes_per_rank: usize) -> Arc<Self> {
            Arc::new(Self {
                buffers: (0..num_ranks)
                    .map(|_| Mutex::new(vec![0u8; bytes_per_rank]))
                    .collect(),
                and_votes: Mutex::new(vec![true; num_ranks]),
            })
        }
    }

    pub struct LocalRmaWindow {
        fabric: Arc<LocalRmaFabric>,
        rank: i32,
    }

    impl LocalRmaWindow {
        pub fn new(fabric: Arc<LocalRmaFabric>, rank: i32) -> Self {
            Self { fabric, rank }
        }
    }

    impl RmaWindow for LocalRmaWindow {
        fn rank(&self) -> i32 {
            self.rank
        }

        fn num_ranks(&self) -> i32 {
            self.fabric.buffers.len() as i32
        }

        fn begin_fence(&self, _read_only: bool) {}
        fn end_fence(&self) {}

        fn put(&self, target_rank: i32, target_offset: u64, data: &[u8]) -> Result<(), CacheError> {
            let mut buf = self.fabric.buffers[target_rank as usize].lock();
            let start = target_offset as usize;
            let end = start + data.len();
            if end > buf.len() {
                return Err(CacheError::WindowError(format!(
                    "put out of bounds: rank {target_rank} offset {target_offset} len {}",
                    data.len()
                )));
            }
            buf[start..end].copy_from_slice(data);
            Ok(())
        }

        fn get(&self, target_rank: i32, target_offset: u64, dst: &mut [u8]) -> Result<(), CacheError> {
            let buf = self.fabric.buffers[target_rank as usize].lock();
            let start = target_offset as usize;
            let end = start + dst.len();
            if end > buf.len() {
                return Err(CacheError::WindowError(format!(
                    "get out of bounds: rank {target_rank} offset {target_offset} len {}",
                    dst.len()
                )));
            }
            dst.copy_from_slice(&buf[start..end]);
            Ok(())
        }

        fn allreduce_and(&self, local: bool) -> bool {
            let mut votes = self.fabric.and_votes.lock();
            votes[self.rank as usize] = local;
            votes.iter().all(|v| *v)
        }
    }

    /// A `WindowFactory` over one simulated rank's view of a shared
    /// `LocalRmaFabric`. `create_window`'s `local_bytes` argument is
    /// ignored: the fabric was already sized per rank at construction,
    /// since a single-process simulation knows every rank's size up
    /// front, unlike a real MPI job.
    pub struct LocalWindowFactory {
        fabric: Arc<LocalRmaFabric>,
        rank: i32,
    }

    impl LocalWindowFactory {
        pub fn new(fabric: Arc<LocalRmaFabric>, rank: i32) -> Self {
            Self { fabric, rank }
        }
    }

    impl WindowFactory for LocalWindowFactory {
        fn create_window(&self, _local_bytes: u64) -> Arc<dyn RmaWindow> {
            Arc::new(LocalRmaWindow::new(self.fabric.clone(), self.rank))
        }

        fn rank(&self) -> i32 {
            self.rank
        }

        fn num_ranks(&self) -> i32 {
            self.fabric.buffers.len() as i32
        }
    }
}
