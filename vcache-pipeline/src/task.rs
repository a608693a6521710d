//! The Write Pipeline's task record.

use vcache_core::{Selection, TransferProperties, TypeDescriptor};
use vcache_storage::OpaqueRef;

use crate::DatasetHandle;

/// Monotonically increasing task id, strictly ordered within one
/// pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

/// One entry in the Write Pipeline's FIFO. Immutable after enqueue except
/// for the request handle it holds alongside it in the ring: modeled
/// here by keeping the handle out of this struct and pairing it in
/// [`crate::ring::TaskRing`] instead.
#[derive(Debug, Clone)]
pub struct WriteTask {
    pub id: TaskId,
    pub dataset: DatasetHandle,
    pub mem_type: TypeDescriptor,
    /// Rewritten to a 1-D contiguous selection of the same element count:
    /// the staged copy is contiguous.
    pub mem_sel: Selection,
    pub file_sel: Selection,
    pub xfer_props: TransferProperties,
    pub stage_offset: u64,
    /// Unrounded byte size actually written (zero for a no-op task).
    pub size: u64,
    /// `size` rounded up to the page size (what the stage cursor advances
    /// by and what is reclaimed on drain).
    pub rounded_size: u64,
    pub opaque: Option<OpaqueRef>,
    /// The file cache's pause flag at the moment this task was enqueued.
    pub paused_at_enqueue: bool,
}
